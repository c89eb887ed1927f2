//! Typed Rust client for the OpenStack Identity (v2) and Compute APIs.
//!
//! Covers the subset needed to provision formation servers:
//! tokens, images, flavors, keypairs, security groups and servers
//! (list, create, get).

mod types;

pub use types::*;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("nova api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("nova api {endpoint} returned {status}: {body}")]
    Api {
        endpoint: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("no compute endpoint in the service catalog")]
    NoComputeEndpoint,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Authenticated client for a tenant's Nova endpoint.
#[derive(Clone)]
pub struct NovaClient {
    token: String,
    compute_url: String,
    http: reqwest::Client,
}

impl NovaClient {
    /// Exchange password credentials for a token and locate the compute endpoint.
    pub async fn authenticate(credentials: &Credentials) -> Result<Self> {
        let http = reqwest::Client::new();
        let url = format!("{}/tokens", credentials.auth_url.trim_end_matches('/'));

        let resp = http
            .post(url)
            .json(&TokenRequest::from(credentials))
            .send()
            .await?;

        let access = Self::check(resp, "create token")
            .await?
            .json::<TokenResponse>()
            .await?
            .access;

        let compute_url = access
            .compute_url()
            .ok_or(Error::NoComputeEndpoint)?
            .to_string();

        Ok(Self::new(access.token.id, compute_url))
    }

    pub fn new(token: impl Into<String>, compute_url: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            compute_url: compute_url.into(),
            http: reqwest::Client::new(),
        }
    }

    pub fn compute_url(&self) -> &str {
        &self.compute_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.compute_url)
    }

    async fn check(resp: reqwest::Response, endpoint: &'static str) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api { endpoint, status, body });
        }
        Ok(resp)
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str, endpoint: &'static str) -> Result<T> {
        let resp = self
            .http
            .get(self.url(path))
            .header("X-Auth-Token", &self.token)
            .send()
            .await?;

        Self::check(resp, endpoint)
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    // ── Catalog ──────────────────────────────────────────────────────

    pub async fn list_images(&self) -> Result<Vec<Image>> {
        let list: ImageList = self.get("/images", "list images").await?;
        Ok(list.images)
    }

    pub async fn list_flavors(&self) -> Result<Vec<Flavor>> {
        let list: FlavorList = self.get("/flavors", "list flavors").await?;
        Ok(list.flavors)
    }

    pub async fn list_keypairs(&self) -> Result<Vec<Keypair>> {
        let list: KeypairList = self.get("/os-keypairs", "list keypairs").await?;
        Ok(list.keypairs.into_iter().map(|e| e.keypair).collect())
    }

    pub async fn list_security_groups(&self) -> Result<Vec<SecurityGroup>> {
        let list: SecurityGroupList = self
            .get("/os-security-groups", "list security groups")
            .await?;
        Ok(list.security_groups)
    }

    // ── Servers ──────────────────────────────────────────────────────

    pub async fn list_servers(&self) -> Result<Vec<ServerRef>> {
        let list: ServerRefList = self.get("/servers", "list servers").await?;
        Ok(list.servers)
    }

    pub async fn get_server(&self, server_id: &str) -> Result<Server> {
        let env: ServerEnvelope = self
            .get(&format!("/servers/{server_id}"), "get server")
            .await?;
        Ok(env.server)
    }

    pub async fn create_server(&self, req: &CreateServerRequest) -> Result<CreatedServer> {
        let resp = self
            .http
            .post(self.url("/servers"))
            .header("X-Auth-Token", &self.token)
            .json(req)
            .send()
            .await?;

        let env: CreatedServerEnvelope = Self::check(resp, "create server")
            .await?
            .json()
            .await?;
        Ok(env.server)
    }
}
