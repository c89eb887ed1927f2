use std::path::PathBuf;

use oat_formation::SpecValidationError;

/// Anything that stops the run before the orchestrator starts.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("invalid value for {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },

    #[error("could not read formation {}: {source}", .path.display())]
    ReadFormation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid formation: {0}")]
    Definition(#[from] SpecValidationError),

    #[error("infra error: {0}")]
    Infra(#[from] oat_infra::Error),
}
