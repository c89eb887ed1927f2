use std::future::Future;

use async_trait::async_trait;
use nova_api::{Credentials, NovaClient};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::types::{
    FlavorRecord, ImageRecord, KeypairRecord, SecurityGroupRecord, ServerHandle, ServerId,
    ServerSpec, ServerState, ServerSummary,
};
use crate::{ComputeProvider, Error, ProviderName, Result};

/// OpenStack Compute provider.
///
/// Delegates to `nova_api::NovaClient` for all HTTP calls. The token is
/// obtained on first use and the authenticated client is shared by every
/// caller afterwards. A call rejected with 401 drops the session and is
/// retried once with a fresh token.
pub struct OpenStackProvider {
    credentials: Credentials,
    session: Mutex<Option<NovaClient>>,
}

impl OpenStackProvider {
    /// Create from the variables an OpenStack RC file exports:
    /// `OS_AUTH_URL`, `OS_TENANT_ID`, `OS_TENANT_NAME`, `OS_USERNAME`, `OS_PASSWORD`.
    pub fn from_env() -> Result<Self> {
        let var = |name: &str| std::env::var(name).map_err(|_| Error::MissingEnv(name.into()));

        Ok(Self::new(Credentials {
            auth_url: var("OS_AUTH_URL")?,
            tenant_id: var("OS_TENANT_ID")?,
            tenant_name: var("OS_TENANT_NAME")?,
            username: var("OS_USERNAME")?,
            password: var("OS_PASSWORD")?,
        }))
    }

    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            session: Mutex::new(None),
        }
    }

    async fn client(&self) -> Result<NovaClient> {
        let mut session = self.session.lock().await;
        if let Some(client) = session.as_ref() {
            return Ok(client.clone());
        }

        let client = NovaClient::authenticate(&self.credentials).await?;
        info!(
            tenant = %self.credentials.tenant_name,
            compute_url = %client.compute_url(),
            "openstack: authenticated"
        );
        *session = Some(client.clone());
        Ok(client)
    }

    /// Run `call` with the shared client, re-authenticating once if Keystone
    /// has expired the token.
    async fn with_client<T, F, Fut>(&self, call: F) -> Result<T>
    where
        F: Fn(NovaClient) -> Fut,
        Fut: Future<Output = nova_api::Result<T>>,
    {
        match call(self.client().await?).await {
            Err(nova_api::Error::Api { endpoint, status, .. }) if status.as_u16() == 401 => {
                warn!(endpoint, "openstack: token rejected, re-authenticating");
                self.session.lock().await.take();
                Ok(call(self.client().await?).await?)
            }
            result => Ok(result?),
        }
    }

    pub(crate) fn parse_state(status: &str) -> ServerState {
        match status {
            "ACTIVE" => ServerState::Active,
            "BUILD" | "REBUILD" | "REBOOT" | "HARD_REBOOT" | "RESIZE" => ServerState::Building,
            "SHUTOFF" | "STOPPED" | "SUSPENDED" | "PAUSED" => ServerState::Stopped,
            "ERROR" => ServerState::Error,
            "DELETED" | "SOFT_DELETED" => ServerState::Deleted,
            _ => ServerState::Unknown,
        }
    }

    fn handle(server: nova_api::Server) -> ServerHandle {
        let addresses = server.all_addresses();
        ServerHandle {
            id: ServerId(server.id),
            name: server.name,
            state: Self::parse_state(&server.status),
            status: server.status,
            addresses,
        }
    }
}

#[async_trait]
impl ComputeProvider for OpenStackProvider {
    async fn list_images(&self) -> Result<Vec<ImageRecord>> {
        let images = self.with_client(|c| async move { c.list_images().await }).await?;
        Ok(images
            .into_iter()
            .map(|i| ImageRecord { id: i.id, name: i.name })
            .collect())
    }

    async fn list_flavors(&self) -> Result<Vec<FlavorRecord>> {
        let flavors = self.with_client(|c| async move { c.list_flavors().await }).await?;
        Ok(flavors
            .into_iter()
            .map(|f| FlavorRecord { id: f.id, name: f.name })
            .collect())
    }

    async fn list_keypairs(&self) -> Result<Vec<KeypairRecord>> {
        let keypairs = self.with_client(|c| async move { c.list_keypairs().await }).await?;
        Ok(keypairs
            .into_iter()
            .map(|k| KeypairRecord { name: k.name })
            .collect())
    }

    async fn list_security_groups(&self) -> Result<Vec<SecurityGroupRecord>> {
        let groups = self.with_client(|c| async move { c.list_security_groups().await }).await?;
        Ok(groups
            .into_iter()
            .map(|g| SecurityGroupRecord {
                id: g.id.to_string(),
                name: g.name,
            })
            .collect())
    }

    async fn list_servers(&self) -> Result<Vec<ServerSummary>> {
        let servers = self.with_client(|c| async move { c.list_servers().await }).await?;
        Ok(servers
            .into_iter()
            .map(|s| ServerSummary {
                id: ServerId(s.id),
                name: s.name,
            })
            .collect())
    }

    async fn create_server(&self, spec: &ServerSpec) -> Result<ServerHandle> {
        let request = nova_api::CreateServerRequest {
            server: nova_api::ServerCreate {
                name: spec.name.clone(),
                image_ref: spec.image_id.clone(),
                flavor_ref: spec.flavor_id.clone(),
                key_name: spec.key_name.clone(),
                security_groups: spec
                    .security_groups
                    .iter()
                    .map(|g| nova_api::SecurityGroupName { name: g.name.clone() })
                    .collect(),
            },
        };
        let request = &request;
        let created = self
            .with_client(|c| async move { c.create_server(request).await })
            .await?;

        info!(server_id = %created.id, name = %spec.name, "openstack: server created");

        Ok(ServerHandle {
            id: ServerId(created.id),
            name: spec.name.clone(),
            state: ServerState::Building,
            status: "BUILD".into(),
            addresses: Vec::new(),
        })
    }

    async fn get_server(&self, id: &ServerId) -> Result<ServerHandle> {
        let server = self
            .with_client(|c| async move { c.get_server(&id.0).await })
            .await?;
        debug!(server_id = %id.0, status = %server.status, "openstack: server fetched");
        Ok(Self::handle(server))
    }

    fn name(&self) -> ProviderName {
        ProviderName::OpenStack
    }
}
