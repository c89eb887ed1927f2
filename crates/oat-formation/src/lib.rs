//! Formation engine: compiles a formation of pools, boxes and a load balancer
//! into server components, drives them through provisioning and bootstrap, and
//! renders the load balancer's proxy configuration.

pub mod ast;
pub mod commands;
pub mod component;
pub mod driver;
pub mod error;
pub mod haproxy;
pub mod model;
pub mod pool;
pub mod report;
pub mod retry;
pub mod settings;
pub mod sink;

#[cfg(test)]
pub(crate) mod testing;

pub use component::{ComponentRole, ComponentState, ServerComponent};
pub use driver::Orchestrator;
pub use error::{ComponentError, GenerationError, SpecValidationError};
pub use model::{FormationSpec, compile};
pub use report::{RunReport, Stage};
pub use settings::{RemoteContext, RunSettings};
