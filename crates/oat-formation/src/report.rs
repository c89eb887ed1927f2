use std::fmt::{self, Write as _};
use std::path::PathBuf;

use uuid::Uuid;

use crate::component::ComponentRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Provision,
    Verify,
    HostEntries,
    Bootstrap,
    Finalize,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provision => "provision",
            Self::Verify => "verify",
            Self::HostEntries => "host entries",
            Self::Bootstrap => "bootstrap",
            Self::Finalize => "finalize",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one component over the whole run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentReport {
    pub server_name: String,
    pub role: ComponentRole,
    pub ip_address: Option<String>,
    /// Stages that finished successfully, in the order they finished.
    pub completed: Vec<Stage>,
    /// First stage that failed and why.
    pub failure: Option<(Stage, String)>,
    pub log_path: Option<PathBuf>,
}

impl ComponentReport {
    pub fn new(server_name: impl Into<String>, role: ComponentRole) -> Self {
        Self {
            server_name: server_name.into(),
            role,
            ip_address: None,
            completed: Vec::new(),
            failure: None,
            log_path: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    pub fn completed(&self, stage: Stage) -> bool {
        self.completed.contains(&stage)
    }

    pub(crate) fn record(&mut self, stage: Stage, outcome: Result<(), String>) {
        match outcome {
            Ok(()) => self.completed.push(stage),
            Err(reason) => {
                if self.failure.is_none() {
                    self.failure = Some((stage, reason));
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    /// In component declaration order.
    pub components: Vec<ComponentReport>,
    /// Failures that belong to the run rather than one component.
    pub run_failures: Vec<String>,
}

impl RunReport {
    pub fn success(&self) -> bool {
        self.run_failures.is_empty() && self.components.iter().all(ComponentReport::succeeded)
    }

    pub fn component(&self, server_name: &str) -> Option<&ComponentReport> {
        self.components.iter().find(|c| c.server_name == server_name)
    }

    pub fn failed_components(&self) -> impl Iterator<Item = &ComponentReport> {
        self.components.iter().filter(|c| !c.succeeded())
    }

    /// Human readable multi-line summary, one line per component.
    pub fn summary(&self) -> String {
        let done = self.components.iter().filter(|c| c.succeeded()).count();
        let mut out = format!(
            "run {}: {done} of {} components completed\n",
            self.run_id,
            self.components.len()
        );
        for c in &self.components {
            let _ = write!(out, "  {} ({})", c.server_name, c.role);
            if let Some(ip) = &c.ip_address {
                let _ = write!(out, " {ip}");
            }
            let stages: Vec<&str> = c.completed.iter().map(Stage::as_str).collect();
            let stages = if stages.is_empty() {
                "-".to_string()
            } else {
                stages.join(", ")
            };
            match &c.failure {
                None => {
                    let _ = writeln!(out, ": {stages}");
                }
                Some((stage, reason)) => {
                    let _ = writeln!(out, ": {stages}; FAILED at {stage}: {reason}");
                }
            }
        }
        for failure in &self.run_failures {
            let _ = writeln!(out, "run failure: {failure}");
        }
        out
    }
}
