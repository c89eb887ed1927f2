use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ── Identity (Keystone v2) ───────────────────────────────────────────

/// Password credentials for a Keystone v2 token request.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub auth_url: String,
    pub tenant_id: String,
    pub tenant_name: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenRequest {
    pub auth: TokenAuth,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenAuth {
    #[serde(rename = "tenantName")]
    pub tenant_name: String,
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
    #[serde(rename = "passwordCredentials")]
    pub password_credentials: PasswordCredentials,
}

#[derive(Debug, Clone, Serialize)]
pub struct PasswordCredentials {
    pub username: String,
    pub password: String,
}

impl From<&Credentials> for TokenRequest {
    fn from(c: &Credentials) -> Self {
        Self {
            auth: TokenAuth {
                tenant_name: c.tenant_name.clone(),
                tenant_id: c.tenant_id.clone(),
                password_credentials: PasswordCredentials {
                    username: c.username.clone(),
                    password: c.password.clone(),
                },
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access: Access,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Access {
    pub token: Token,
    #[serde(rename = "serviceCatalog", default)]
    pub service_catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Token {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEntry {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Endpoint {
    #[serde(rename = "publicURL")]
    pub public_url: String,
}

impl Access {
    /// Public URL of the first `compute` endpoint in the catalog.
    pub fn compute_url(&self) -> Option<&str> {
        self.service_catalog
            .iter()
            .find(|e| e.kind == "compute")
            .and_then(|e| e.endpoints.first())
            .map(|e| e.public_url.trim_end_matches('/'))
    }
}

// ── Compute ──────────────────────────────────────────────────────────

/// Nova ids are UUID strings for most resources but plain integers for
/// nova-network security groups.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ResourceId {
    Int(i64),
    Str(String),
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(id) => write!(f, "{id}"),
            Self::Str(id) => f.write_str(id),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Image {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageList {
    pub images: Vec<Image>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Flavor {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlavorList {
    pub flavors: Vec<Flavor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Keypair {
    pub name: String,
    #[serde(default)]
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeypairEntry {
    pub keypair: Keypair,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeypairList {
    pub keypairs: Vec<KeypairEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityGroup {
    pub id: ResourceId,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityGroupList {
    pub security_groups: Vec<SecurityGroup>,
}

/// Summary entry returned by `GET /servers`.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerRefList {
    pub servers: Vec<ServerRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerAddress {
    pub addr: String,
    #[serde(default)]
    pub version: Option<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub status: String,
    /// Network label to addresses on that network.
    #[serde(default)]
    pub addresses: BTreeMap<String, Vec<ServerAddress>>,
}

impl Server {
    /// Every address across all networks, in network label order.
    pub fn all_addresses(&self) -> Vec<String> {
        self.addresses
            .values()
            .flat_map(|addrs| addrs.iter().map(|a| a.addr.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerEnvelope {
    pub server: Server,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateServerRequest {
    pub server: ServerCreate,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerCreate {
    pub name: String,
    #[serde(rename = "imageRef")]
    pub image_ref: String,
    #[serde(rename = "flavorRef")]
    pub flavor_ref: String,
    pub key_name: String,
    pub security_groups: Vec<SecurityGroupName>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecurityGroupName {
    pub name: String,
}

/// `POST /servers` only echoes the id (and admin password) back.
#[derive(Debug, Clone, Deserialize)]
pub struct CreatedServer {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatedServerEnvelope {
    pub server: CreatedServer,
}
