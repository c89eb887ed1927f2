use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use oat_infra::{ComputeProvider, RemoteTransport};

use crate::retry::RetryPolicy;

/// Knobs for one orchestration run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub activation: RetryPolicy,
    pub connectivity: RetryPolicy,
    pub command: RetryPolicy,
    /// Where `{server_name}.out` / `.err` are written.
    pub log_dir: PathBuf,
    /// Local scratch space, e.g. the rendered proxy config.
    pub work_dir: PathBuf,
    /// Directory of `*.pub` keys plus the installer script, copied to every server.
    pub public_keys_dir: PathBuf,
    /// Upper bound on concurrently running component tasks.
    pub max_parallelism: usize,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            activation: RetryPolicy::activation(),
            connectivity: RetryPolicy::connectivity(),
            command: RetryPolicy::command(),
            log_dir: PathBuf::from("."),
            work_dir: PathBuf::from("."),
            public_keys_dir: PathBuf::from("public_ssh_keys"),
            max_parallelism: 64,
        }
    }
}

impl RunSettings {
    /// Same bounds, different pauses: `poll` for activation and connectivity,
    /// `command` between remote command retries.
    pub fn with_delays(mut self, poll: Duration, command: Duration) -> Self {
        self.activation = self.activation.with_delay(poll);
        self.connectivity = self.connectivity.with_delay(poll);
        self.command = self.command.with_delay(command);
        self
    }
}

/// Collaborators shared by every component task of a run.
#[derive(Clone)]
pub struct RemoteContext {
    pub provider: Arc<dyn ComputeProvider>,
    pub transport: Arc<dyn RemoteTransport>,
    pub settings: RunSettings,
}

impl RemoteContext {
    pub fn new(
        provider: Arc<dyn ComputeProvider>,
        transport: Arc<dyn RemoteTransport>,
        settings: RunSettings,
    ) -> Self {
        Self {
            provider,
            transport,
            settings,
        }
    }
}
