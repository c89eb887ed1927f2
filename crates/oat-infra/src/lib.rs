pub mod hetzner;
pub mod openstack;
pub mod ssh;
pub mod types;

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use types::{
    CommandOutput, FlavorRecord, ImageRecord, KeypairRecord, SecurityGroupRecord, ServerHandle,
    ServerId, ServerSpec, ServerSummary,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("openstack error: {0}")]
    Nova(#[from] nova_api::Error),

    #[error("hetzner api error: {0}")]
    HetznerApi(String),

    #[error("invalid id: {0}")]
    InvalidId(String),

    #[error("missing env var: {0}")]
    MissingEnv(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("server not found: {0}")]
    ServerNotFound(String),

    #[error("transport io error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("{program} exited with status {exit_code}: {stderr}")]
    TransportStatus {
        program: &'static str,
        exit_code: i32,
        stderr: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Known compute provider backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderName {
    OpenStack,
    Hetzner,
}

impl ProviderName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenStack => "openstack",
            Self::Hetzner => "hetzner",
        }
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "openstack" => Ok(Self::OpenStack),
            "hetzner" => Ok(Self::Hetzner),
            other => Err(Error::UnknownProvider(other.to_string())),
        }
    }
}

/// Backend-agnostic view of a compute cloud.
///
/// Implementations must be usable from many concurrent tasks at once: every
/// component of a formation shares a single provider.
#[async_trait]
pub trait ComputeProvider: Send + Sync + 'static {
    async fn list_images(&self) -> Result<Vec<ImageRecord>>;

    async fn list_flavors(&self) -> Result<Vec<FlavorRecord>>;

    async fn list_keypairs(&self) -> Result<Vec<KeypairRecord>>;

    async fn list_security_groups(&self) -> Result<Vec<SecurityGroupRecord>>;

    async fn list_servers(&self) -> Result<Vec<ServerSummary>>;

    /// Issue the create call. The returned handle is usually still building.
    async fn create_server(&self, spec: &ServerSpec) -> Result<ServerHandle>;

    async fn get_server(&self, id: &ServerId) -> Result<ServerHandle>;

    /// Re-read state, status and addresses of `handle` from the provider.
    async fn refresh(&self, handle: &mut ServerHandle) -> Result<()> {
        *handle = self.get_server(&handle.id).await?;
        Ok(())
    }

    /// Provider identifier.
    fn name(&self) -> ProviderName;
}

/// Remote command execution and file transfer to a server.
#[async_trait]
pub trait RemoteTransport: Send + Sync + 'static {
    /// Open and close a session to check the host accepts our key.
    async fn test_connection(&self, address: &str, key_file: &Path) -> Result<()>;

    /// Run `command` remotely. A non-zero exit is returned, not raised.
    async fn run_command(&self, address: &str, key_file: &Path, command: &str)
    -> Result<CommandOutput>;

    /// Recursively copy `local_path` to `remote_path` on the host.
    async fn copy(
        &self,
        local_path: &Path,
        address: &str,
        key_file: &Path,
        remote_path: &str,
    ) -> Result<CommandOutput>;

    /// Shell rendering of `command` as it would run against `address`, for echoing.
    fn describe(&self, address: &str, key_file: &Path, command: &str) -> String;
}

/// Build the provider named `name` from environment variables.
pub fn build_provider(name: ProviderName) -> Result<Arc<dyn ComputeProvider>> {
    dotenvy::dotenv().ok();

    let provider: Arc<dyn ComputeProvider> = match name {
        ProviderName::OpenStack => Arc::new(openstack::OpenStackProvider::from_env()?),
        ProviderName::Hetzner => Arc::new(hetzner::HetznerProvider::from_env()?),
    };
    tracing::info!(provider = %name, "registered compute provider");

    Ok(provider)
}
