use std::fmt::Display;
use std::future::Future;

use async_trait::async_trait;
use hcloud::apis::configuration::Configuration;
use hcloud::apis::{firewalls_api, images_api, server_types_api, servers_api, ssh_keys_api};
use hcloud::models;
use tracing::info;

use crate::types::{
    FlavorRecord, ImageRecord, KeypairRecord, SecurityGroupRecord, ServerHandle, ServerId,
    ServerSpec, ServerState, ServerSummary,
};
use crate::{ComputeProvider, Error, ProviderName, Result};

/// Largest page the list endpoints accept.
const PER_PAGE: i64 = 50;

/// Hetzner Cloud provider using the `hcloud` crate.
///
/// Formation vocabulary maps onto Hetzner resources as follows: flavors are
/// server types, keypairs are SSH keys and security groups are firewalls.
pub struct HetznerProvider {
    config: Configuration,
    location: String,
    network_id: Option<i64>,
}

impl HetznerProvider {
    /// Create from env vars:
    ///
    /// - `HETZNER_API_TOKEN` (required)
    /// - `HETZNER_LOCATION` (default: `"fsn1"`)
    /// - `HETZNER_NETWORK_ID` (optional, integer): private network to attach
    pub fn from_env() -> Result<Self> {
        let token = std::env::var("HETZNER_API_TOKEN")
            .map_err(|_| Error::MissingEnv("HETZNER_API_TOKEN".into()))?;

        let mut config = Configuration::new();
        config.bearer_access_token = Some(token);

        let location = std::env::var("HETZNER_LOCATION").unwrap_or_else(|_| "fsn1".into());

        let network_id = std::env::var("HETZNER_NETWORK_ID")
            .ok()
            .and_then(|s| s.parse::<i64>().ok());

        Ok(Self {
            config,
            location,
            network_id,
        })
    }

    fn parse_state(status: &models::server::Status) -> ServerState {
        match status {
            models::server::Status::Running => ServerState::Active,
            models::server::Status::Initializing | models::server::Status::Starting => {
                ServerState::Building
            }
            models::server::Status::Off | models::server::Status::Stopping => ServerState::Stopped,
            models::server::Status::Deleting => ServerState::Deleted,
            _ => ServerState::Unknown,
        }
    }

    /// Public IPv4 first, then private network addresses in attachment order.
    fn addresses(
        public_net: &models::ServerPublicNet,
        private_net: &[models::ServerPrivateNet],
    ) -> Vec<String> {
        public_net
            .ipv4
            .iter()
            .map(|v4| v4.ip.clone())
            .chain(private_net.iter().filter_map(|net| net.ip.clone()))
            .collect()
    }

    fn handle(server: &models::Server) -> ServerHandle {
        ServerHandle {
            id: ServerId(server.id.to_string()),
            name: server.name.clone(),
            state: Self::parse_state(&server.status),
            status: format!("{:?}", server.status).to_lowercase(),
            addresses: Self::addresses(&server.public_net, &server.private_net),
        }
    }

    fn parse_id(raw: &str) -> Result<i64> {
        raw.parse::<i64>()
            .map_err(|_| Error::InvalidId(raw.to_string()))
    }
}

/// Follow `next_page` until the listing is exhausted. `fetch` returns one
/// page of items and the number of the page after it, if any.
async fn all_pages<T, E, F, Fut>(what: &str, fetch: F) -> Result<Vec<T>>
where
    E: Display,
    F: Fn(i64) -> Fut,
    Fut: Future<Output = std::result::Result<(Vec<T>, Option<i64>), E>>,
{
    let mut items = Vec::new();
    let mut page = Some(1);
    while let Some(current) = page {
        let (batch, next) = fetch(current)
            .await
            .map_err(|e| Error::HetznerApi(format!("{what}: {e}")))?;
        items.extend(batch);
        page = next;
    }
    Ok(items)
}

#[async_trait]
impl ComputeProvider for HetznerProvider {
    async fn list_images(&self) -> Result<Vec<ImageRecord>> {
        let images = all_pages("list images", |page| async move {
            images_api::list_images(
                &self.config,
                images_api::ListImagesParams {
                    page: Some(page),
                    per_page: Some(PER_PAGE),
                    ..Default::default()
                },
            )
            .await
            .map(|r| (r.images, r.meta.pagination.next_page))
        })
        .await?;

        Ok(images
            .into_iter()
            .filter_map(|image| {
                image.name.map(|name| ImageRecord {
                    id: image.id.to_string(),
                    name,
                })
            })
            .collect())
    }

    async fn list_flavors(&self) -> Result<Vec<FlavorRecord>> {
        let types = all_pages("list server types", |page| async move {
            server_types_api::list_server_types(
                &self.config,
                server_types_api::ListServerTypesParams {
                    page: Some(page),
                    per_page: Some(PER_PAGE),
                    ..Default::default()
                },
            )
            .await
            .map(|r| (r.server_types, r.meta.pagination.next_page))
        })
        .await?;

        Ok(types
            .into_iter()
            .map(|t| FlavorRecord {
                id: t.id.to_string(),
                name: t.name,
            })
            .collect())
    }

    async fn list_keypairs(&self) -> Result<Vec<KeypairRecord>> {
        let keys = all_pages("list ssh keys", |page| async move {
            ssh_keys_api::list_ssh_keys(
                &self.config,
                ssh_keys_api::ListSshKeysParams {
                    page: Some(page),
                    per_page: Some(PER_PAGE),
                    ..Default::default()
                },
            )
            .await
            .map(|r| (r.ssh_keys, r.meta.pagination.next_page))
        })
        .await?;

        Ok(keys
            .into_iter()
            .map(|k| KeypairRecord { name: k.name })
            .collect())
    }

    async fn list_security_groups(&self) -> Result<Vec<SecurityGroupRecord>> {
        let firewalls = all_pages("list firewalls", |page| async move {
            firewalls_api::list_firewalls(
                &self.config,
                firewalls_api::ListFirewallsParams {
                    page: Some(page),
                    per_page: Some(PER_PAGE),
                    ..Default::default()
                },
            )
            .await
            .map(|r| (r.firewalls, r.meta.pagination.next_page))
        })
        .await?;

        Ok(firewalls
            .into_iter()
            .map(|fw| SecurityGroupRecord {
                id: fw.id.to_string(),
                name: fw.name,
            })
            .collect())
    }

    async fn list_servers(&self) -> Result<Vec<ServerSummary>> {
        let servers = all_pages("list servers", |page| async move {
            servers_api::list_servers(
                &self.config,
                servers_api::ListServersParams {
                    page: Some(page),
                    per_page: Some(PER_PAGE),
                    ..Default::default()
                },
            )
            .await
            .map(|r| (r.servers, r.meta.pagination.next_page))
        })
        .await?;

        Ok(servers
            .into_iter()
            .map(|s| ServerSummary {
                id: ServerId(s.id.to_string()),
                name: s.name,
            })
            .collect())
    }

    async fn create_server(&self, spec: &ServerSpec) -> Result<ServerHandle> {
        let firewalls = spec
            .security_groups
            .iter()
            .map(|g| {
                Self::parse_id(&g.id)
                    .map(|firewall| models::CreateServerRequestFirewalls { firewall })
            })
            .collect::<Result<Vec<_>>>()?;

        let resp = servers_api::create_server(
            &self.config,
            servers_api::CreateServerParams {
                create_server_request: models::CreateServerRequest {
                    name: spec.name.clone(),
                    server_type: spec.flavor_id.clone(),
                    image: spec.image_id.clone(),
                    location: Some(self.location.clone()),
                    user_data: None,
                    networks: self.network_id.map(|id| vec![id]),
                    firewalls: Some(firewalls),
                    ssh_keys: Some(vec![spec.key_name.clone()]),
                    volumes: None,
                    start_after_create: Some(true),
                    automount: None,
                    datacenter: None,
                    labels: None,
                    placement_group: None,
                    public_net: None,
                },
            },
        )
        .await
        .map_err(|e| Error::HetznerApi(format!("create server: {e}")))?;

        let server = resp.server;

        info!(server_id = server.id, name = %spec.name, "hetzner: server created");

        Ok(Self::handle(&server))
    }

    async fn get_server(&self, id: &ServerId) -> Result<ServerHandle> {
        let server_id = Self::parse_id(&id.0)?;

        let resp = servers_api::get_server(
            &self.config,
            servers_api::GetServerParams { id: server_id },
        )
        .await
        .map_err(|e| Error::HetznerApi(format!("get server: {e}")))?;

        let server = resp
            .server
            .ok_or_else(|| Error::ServerNotFound(id.0.clone()))?;

        Ok(Self::handle(&server))
    }

    fn name(&self) -> ProviderName {
        ProviderName::Hetzner
    }
}
