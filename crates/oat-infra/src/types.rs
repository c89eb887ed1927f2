use serde::{Deserialize, Serialize};

/// Opaque provider-side server identifier (Nova UUID or Hetzner numeric id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerId(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlavorRecord {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeypairRecord {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroupRecord {
    pub id: String,
    pub name: String,
}

/// Entry of the provider's server listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSummary {
    pub id: ServerId,
    pub name: String,
}

/// Everything needed to create one server.
#[derive(Debug, Clone)]
pub struct ServerSpec {
    pub name: String,
    pub image_id: String,
    pub flavor_id: String,
    pub key_name: String,
    pub security_groups: Vec<SecurityGroupRecord>,
}

/// Provider-reported server state, normalised across providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerState {
    Building,
    Active,
    Stopped,
    Error,
    Deleted,
    Unknown,
}

/// Last known view of a created server. Refreshed through
/// [`ComputeProvider::refresh`](crate::ComputeProvider::refresh).
#[derive(Debug, Clone)]
pub struct ServerHandle {
    pub id: ServerId,
    pub name: String,
    pub state: ServerState,
    /// Raw status string as the provider reported it.
    pub status: String,
    pub addresses: Vec<String>,
}

impl ServerHandle {
    pub fn is_active(&self) -> bool {
        self.state == ServerState::Active
    }
}

/// Result of one remote command or copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}
