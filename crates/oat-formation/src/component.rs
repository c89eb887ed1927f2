//! One server of a formation and the state machine that brings it up.
//!
//! A component only ever moves forward through [`ComponentState`]; the first
//! error parks it in `Failed` and it takes no further part in the run.

use std::fmt;
use std::path::{Path, PathBuf};

use oat_infra::types::{
    CommandOutput, FlavorRecord, ImageRecord, SecurityGroupRecord, ServerHandle, ServerSpec,
};
use oat_infra::{ComputeProvider, RemoteTransport};
use tracing::{info, warn};

use crate::commands::{self, RemoteStep};
use crate::error::ComponentError;
use crate::model::{Defaults, VmSpec};
use crate::retry::{RetryError, RetryPolicy, retry};
use crate::settings::RemoteContext;
use crate::sink::ComponentSink;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ComponentRole {
    /// Replica of the named pool.
    Pool(String),
    LoadBalancer,
    /// Replica of the named standalone box.
    Box(String),
}

impl ComponentRole {
    pub fn pool_name(&self) -> Option<&str> {
        match self {
            Self::Pool(name) => Some(name),
            _ => None,
        }
    }

    pub fn is_load_balancer(&self) -> bool {
        matches!(self, Self::LoadBalancer)
    }
}

impl fmt::Display for ComponentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pool(name) => write!(f, "pool {name}"),
            Self::LoadBalancer => f.write_str("load balancer"),
            Self::Box(name) => write!(f, "box {name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentState {
    Defined,
    ImageResolved,
    Validated,
    Created,
    Active,
    ConnectivityConfirmed,
    Bootstrapped,
    Failed(String),
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Defined => f.write_str("defined"),
            Self::ImageResolved => f.write_str("image resolved"),
            Self::Validated => f.write_str("validated"),
            Self::Created => f.write_str("created"),
            Self::Active => f.write_str("active"),
            Self::ConnectivityConfirmed => f.write_str("connectivity confirmed"),
            Self::Bootstrapped => f.write_str("bootstrapped"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Borrowed logging view: every line goes to tracing and, once the sink is
/// open, to the component's own log files.
#[derive(Clone, Copy)]
struct ComponentLog<'a> {
    server: &'a str,
    sink: Option<&'a ComponentSink>,
}

impl ComponentLog<'_> {
    fn note(&self, line: &str) {
        info!(server = %self.server, "{line}");
        if let Some(sink) = self.sink
            && let Err(e) = sink.out(line)
        {
            warn!(server = %self.server, error = %e, "failed to write component log");
        }
    }

    fn warn(&self, line: &str) {
        warn!(server = %self.server, "{line}");
        if let Some(sink) = self.sink
            && let Err(e) = sink.err(line)
        {
            warn!(server = %self.server, error = %e, "failed to write component log");
        }
    }
}

#[derive(Debug)]
enum AttemptFailure {
    Exit(i32),
    Transport(String),
}

impl AttemptFailure {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Exit(code) => *code,
            Self::Transport(_) => -1,
        }
    }
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exit(code) => write!(f, "exit status {code}"),
            Self::Transport(reason) => f.write_str(reason),
        }
    }
}

#[derive(Debug)]
pub struct ServerComponent {
    server_name: String,
    role: ComponentRole,
    ssh_key_name: String,
    pem_file: PathBuf,
    security_groups: Vec<String>,
    vm: VmSpec,
    state: ComponentState,
    image: Option<ImageRecord>,
    flavor: Option<FlavorRecord>,
    resolved_groups: Vec<SecurityGroupRecord>,
    server: Option<ServerHandle>,
    ip_address: Option<String>,
    sink: Option<ComponentSink>,
}

impl ServerComponent {
    pub fn new(server_name: String, role: ComponentRole, defaults: &Defaults, vm: VmSpec) -> Self {
        Self {
            server_name,
            role,
            ssh_key_name: defaults.ssh_key_name.clone(),
            pem_file: defaults.pem_file.clone(),
            security_groups: defaults.security_groups.clone(),
            vm,
            state: ComponentState::Defined,
            image: None,
            flavor: None,
            resolved_groups: Vec::new(),
            server: None,
            ip_address: None,
            sink: None,
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn role(&self) -> &ComponentRole {
        &self.role
    }

    pub fn vm(&self) -> &VmSpec {
        &self.vm
    }

    pub fn pem_file(&self) -> &Path {
        &self.pem_file
    }

    pub fn state(&self) -> &ComponentState {
        &self.state
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, ComponentState::Failed(_))
    }

    pub fn image(&self) -> Option<&ImageRecord> {
        self.image.as_ref()
    }

    pub fn flavor(&self) -> Option<&FlavorRecord> {
        self.flavor.as_ref()
    }

    pub fn server(&self) -> Option<&ServerHandle> {
        self.server.as_ref()
    }

    /// Cached address. Set once connectivity has been attempted.
    pub fn ip_address(&self) -> Option<&str> {
        self.ip_address.as_deref()
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.sink.as_ref().map(ComponentSink::out_path)
    }

    /// Open `{server_name}.out` / `.err` under `dir`.
    pub fn open_sink(&mut self, dir: &Path) -> Result<(), ComponentError> {
        let sink = ComponentSink::open(dir, &self.server_name).map_err(|source| {
            ComponentError::Sink {
                server: self.server_name.clone(),
                source,
            }
        })?;
        self.sink = Some(sink);
        Ok(())
    }

    fn log(&self) -> ComponentLog<'_> {
        ComponentLog {
            server: &self.server_name,
            sink: self.sink.as_ref(),
        }
    }

    fn advance(&mut self, state: ComponentState) {
        self.log().note(&format!("state: {} -> {state}", self.state));
        self.state = state;
    }

    /// Park the component in `Failed`, keeping the first failure reason.
    pub fn mark_failed(&mut self, err: &ComponentError) {
        self.log().warn(&err.to_string());
        if !self.is_failed() {
            self.state = ComponentState::Failed(err.to_string());
        }
    }

    fn settle<T>(&mut self, result: Result<T, ComponentError>) -> Result<T, ComponentError> {
        if let Err(e) = &result {
            self.mark_failed(e);
        }
        result
    }

    fn provider_error(&self, source: oat_infra::Error) -> ComponentError {
        ComponentError::Provider {
            server: self.server_name.clone(),
            source,
        }
    }

    fn out_of_order(&self, stage: &'static str) -> ComponentError {
        ComponentError::OutOfOrder {
            server: self.server_name.clone(),
            stage,
        }
    }

    pub async fn resolve_image_and_flavor(
        &mut self,
        provider: &dyn ComputeProvider,
    ) -> Result<(), ComponentError> {
        let images = provider
            .list_images()
            .await
            .map_err(|e| self.provider_error(e))?;
        let image = images
            .into_iter()
            .find(|i| i.name == self.vm.image)
            .ok_or_else(|| ComponentError::ImageNotFound {
                server: self.server_name.clone(),
                image: self.vm.image.clone(),
            })?;

        let flavors = provider
            .list_flavors()
            .await
            .map_err(|e| self.provider_error(e))?;
        let flavor = flavors
            .into_iter()
            .find(|f| f.name == self.vm.vm_flavor)
            .ok_or_else(|| ComponentError::FlavorNotFound {
                server: self.server_name.clone(),
                flavor: self.vm.vm_flavor.clone(),
            })?;

        self.image = Some(image);
        self.flavor = Some(flavor);
        self.advance(ComponentState::ImageResolved);
        Ok(())
    }

    /// Keypair, private key file, bootstrap urls, then security groups. The
    /// first failing check wins.
    pub async fn validate(&mut self, provider: &dyn ComputeProvider) -> Result<(), ComponentError> {
        self.log()
            .note(&format!("Running validators: server name = {}", self.server_name));

        let keypairs = provider
            .list_keypairs()
            .await
            .map_err(|e| self.provider_error(e))?;
        if !keypairs.iter().any(|k| k.name == self.ssh_key_name) {
            return Err(ComponentError::KeypairNotFound {
                server: self.server_name.clone(),
                keypair: self.ssh_key_name.clone(),
            });
        }

        if !self.pem_file.exists() {
            return Err(ComponentError::PemFileMissing {
                server: self.server_name.clone(),
                path: self.pem_file.clone(),
            });
        }

        if let Some(step) = self
            .vm
            .bootstrap_sequence
            .iter()
            .find(|s| !s.url().starts_with("git://"))
        {
            return Err(ComponentError::InvalidBootstrapUrl {
                server: self.server_name.clone(),
                url: step.url().to_string(),
            });
        }

        let groups = provider
            .list_security_groups()
            .await
            .map_err(|e| self.provider_error(e))?;
        let found: Vec<SecurityGroupRecord> = groups
            .into_iter()
            .filter(|g| self.security_groups.contains(&g.name))
            .collect();
        if found.len() != self.security_groups.len() {
            return Err(ComponentError::SecurityGroupMismatch {
                server: self.server_name.clone(),
                requested: self.security_groups.clone(),
                found: found.into_iter().map(|g| g.name).collect(),
            });
        }

        self.resolved_groups = found;
        self.advance(ComponentState::Validated);
        Ok(())
    }

    pub async fn create_server(&mut self, provider: &dyn ComputeProvider) -> Result<(), ComponentError> {
        let (Some(image), Some(flavor)) = (&self.image, &self.flavor) else {
            return Err(self.out_of_order("create"));
        };

        let existing = provider
            .list_servers()
            .await
            .map_err(|e| self.provider_error(e))?;
        if existing.iter().any(|s| s.name == self.server_name) {
            return Err(ComponentError::DuplicateServerName {
                server: self.server_name.clone(),
            });
        }

        let spec = ServerSpec {
            name: self.server_name.clone(),
            image_id: image.id.clone(),
            flavor_id: flavor.id.clone(),
            key_name: self.ssh_key_name.clone(),
            security_groups: self.resolved_groups.clone(),
        };
        let handle = provider
            .create_server(&spec)
            .await
            .map_err(|e| self.provider_error(e))?;

        self.log()
            .note(&format!("Created server {} (id {})", self.server_name, handle.id.0));
        self.server = Some(handle);
        self.advance(ComponentState::Created);
        Ok(())
    }

    /// Poll the provider until the server reports active.
    pub async fn wait_until_active(
        &mut self,
        provider: &dyn ComputeProvider,
        policy: RetryPolicy,
    ) -> Result<(), ComponentError> {
        let Some(id) = self.server.as_ref().map(|s| s.id.clone()) else {
            return Err(self.out_of_order("activation"));
        };

        let log = self.log();
        log.note("Starting server activation checks.");
        let id = &id;
        let result = retry(policy, "activation", move |attempt| async move {
            let handle = provider.get_server(id).await.map_err(|e| e.to_string())?;
            if handle.is_active() {
                Ok(handle)
            } else {
                log.note(&format!(
                    "Server not active yet (check {attempt}, status {}).",
                    handle.status
                ));
                Err(handle.status)
            }
        })
        .await;

        match result {
            Ok(handle) => {
                self.server = Some(handle);
                self.advance(ComponentState::Active);
                Ok(())
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                Err(ComponentError::ServerActivationTimeout {
                    server: self.server_name.clone(),
                    attempts,
                    status: last,
                })
            }
        }
    }

    /// First address the provider reported, cached for the rest of the run.
    fn resolve_address(&mut self) -> Result<String, ComponentError> {
        if self.ip_address.is_none() {
            self.ip_address = self
                .server
                .as_ref()
                .and_then(|s| s.addresses.first().cloned());
        }
        self.ip_address
            .clone()
            .ok_or_else(|| ComponentError::NoAddress {
                server: self.server_name.clone(),
            })
    }

    async fn check_connectivity(
        &mut self,
        transport: &dyn RemoteTransport,
        policy: RetryPolicy,
    ) -> Result<(), ComponentError> {
        let address = self.resolve_address()?;
        let address = address.as_str();
        let key = self.pem_file.as_path();
        let log = self.log();
        log.note(&format!("Checking ssh connectivity to {address}."));

        let result = retry(policy, "connectivity", move |attempt| async move {
            transport.test_connection(address, key).await.map_err(|e| {
                log.warn(&format!("ssh check {attempt} failed: {e}"));
                e.to_string()
            })
        })
        .await;

        result.map_err(|RetryError::Exhausted { attempts, last }| {
            ComponentError::ConnectivityTimeout {
                server: self.server_name.clone(),
                attempts,
                reason: last,
            }
        })
    }

    pub async fn confirm_connectivity(
        &mut self,
        transport: &dyn RemoteTransport,
        policy: RetryPolicy,
    ) -> Result<(), ComponentError> {
        if self.server.is_none() {
            return Err(self.out_of_order("connectivity"));
        }
        self.check_connectivity(transport, policy).await?;
        self.advance(ComponentState::ConnectivityConfirmed);
        Ok(())
    }

    async fn provision_steps(&mut self, ctx: &RemoteContext) -> Result<(), ComponentError> {
        let provider = ctx.provider.as_ref();
        self.resolve_image_and_flavor(provider).await?;
        self.validate(provider).await?;
        self.create_server(provider).await?;
        self.wait_until_active(provider, ctx.settings.activation)
            .await?;
        self.confirm_connectivity(ctx.transport.as_ref(), ctx.settings.connectivity)
            .await
    }

    /// Resolve, validate, create, wait for activation and confirm ssh.
    pub async fn provision(&mut self, ctx: &RemoteContext) -> Result<(), ComponentError> {
        let result = self.provision_steps(ctx).await;
        let result = self.settle(result);
        if result.is_ok() {
            self.log().note(&format!("{} provisioned.", self.server_name));
        }
        result
    }

    /// Re-read the server from the provider and re-check ssh.
    pub async fn verify(&mut self, ctx: &RemoteContext) -> Result<(), ComponentError> {
        let result = self.verify_steps(ctx).await;
        self.settle(result)
    }

    async fn verify_steps(&mut self, ctx: &RemoteContext) -> Result<(), ComponentError> {
        let Some(mut handle) = self.server.take() else {
            return Err(self.out_of_order("verify"));
        };
        let refreshed = ctx.provider.refresh(&mut handle).await;
        self.server = Some(handle);
        refreshed.map_err(|e| self.provider_error(e))?;

        self.check_connectivity(ctx.transport.as_ref(), ctx.settings.connectivity)
            .await?;
        self.log().note(&format!("{} verified.", self.server_name));
        Ok(())
    }

    /// Echo `step`, then run it under the command retry policy.
    pub async fn run_step(
        &mut self,
        ctx: &RemoteContext,
        step: &RemoteStep,
    ) -> Result<CommandOutput, ComponentError> {
        let address = self.resolve_address()?;
        let address = address.as_str();
        let key = self.pem_file.as_path();
        let transport = ctx.transport.as_ref();
        let log = self.log();

        let label = step.to_string();
        match step {
            RemoteStep::Shell(cmd) => log.note(&transport.describe(address, key, cmd)),
            RemoteStep::Copy { local, remote } => {
                log.note(&format!("scp -r {} {address}:{remote}", local.display()))
            }
        }

        let result = retry(ctx.settings.command, &label, move |attempt| async move {
            let outcome = match step {
                RemoteStep::Shell(cmd) => transport.run_command(address, key, cmd).await,
                RemoteStep::Copy { local, remote } => {
                    transport.copy(local, address, key, remote).await
                }
            };
            match outcome {
                Ok(out) if out.success() => {
                    let stdout = out.stdout.trim_end();
                    if !stdout.is_empty() {
                        log.note(stdout);
                    }
                    Ok(out)
                }
                Ok(out) => {
                    log.warn(&format!(
                        "Attempt {attempt} exited with status {}.",
                        out.exit_code
                    ));
                    let stderr = out.stderr.trim_end();
                    if !stderr.is_empty() {
                        log.warn(stderr);
                    }
                    Err(AttemptFailure::Exit(out.exit_code))
                }
                Err(e) => {
                    log.warn(&format!("Attempt {attempt} could not run: {e}"));
                    Err(AttemptFailure::Transport(e.to_string()))
                }
            }
        })
        .await;

        match result {
            Ok(out) => {
                log.note(&format!("Command successful: {label}"));
                Ok(out)
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                log.warn(&format!("Unable to execute command: {label}"));
                Err(ComponentError::CommandFailed {
                    server: self.server_name.clone(),
                    command: label,
                    attempts,
                    exit_code: last.exit_code(),
                })
            }
        }
    }

    pub async fn run_remote(
        &mut self,
        ctx: &RemoteContext,
        command: &str,
    ) -> Result<CommandOutput, ComponentError> {
        self.run_step(ctx, &RemoteStep::Shell(command.to_string()))
            .await
    }

    /// Run the idempotent bootstrap plan. Safe to call again on a server that
    /// was already bootstrapped.
    pub async fn bootstrap(&mut self, ctx: &RemoteContext) -> Result<(), ComponentError> {
        if self.server.is_none() {
            let err = self.out_of_order("bootstrap");
            return self.settle(Err(err));
        }

        let plan = commands::bootstrap_plan(&self.vm.bootstrap_sequence, &ctx.settings.public_keys_dir);
        let mut result = Ok(());
        for step in &plan {
            if let Err(e) = self.run_step(ctx, step).await {
                result = Err(e);
                break;
            }
        }
        self.settle(result)?;

        if self.state != ComponentState::Bootstrapped {
            self.advance(ComponentState::Bootstrapped);
        }
        self.log().note(&format!("{} bootstrapped.", self.server_name));
        Ok(())
    }

    /// `"{ip} {pool}.vip"` for every pool, pointing at this load balancer.
    pub fn host_entries<'a>(
        &self,
        pool_names: impl IntoIterator<Item = &'a str>,
    ) -> Result<Vec<String>, ComponentError> {
        let ip = self.ip_address().ok_or_else(|| ComponentError::NoAddress {
            server: self.server_name.clone(),
        })?;
        Ok(pool_names
            .into_iter()
            .map(|pool| format!("{ip} {pool}.vip"))
            .collect())
    }

    /// Rewrite the `.vip` lines of `/etc/hosts`.
    pub async fn install_host_entries(
        &mut self,
        ctx: &RemoteContext,
        entries: &[String],
    ) -> Result<(), ComponentError> {
        let mut result = Ok(());
        for command in commands::host_entry_commands(entries) {
            if let Err(e) = self.run_remote(ctx, &command).await {
                result = Err(e);
                break;
            }
        }
        self.settle(result)?;
        self.log().note("Entry additions complete.");
        Ok(())
    }

    /// Write `config` locally, copy it over the proxy config and restart the proxy.
    pub async fn upload_config(&mut self, ctx: &RemoteContext, config: &str) -> Result<(), ComponentError> {
        let result = self.upload_config_steps(ctx, config).await;
        self.settle(result)
    }

    async fn upload_config_steps(&mut self, ctx: &RemoteContext, config: &str) -> Result<(), ComponentError> {
        let work_dir = &ctx.settings.work_dir;
        let local = work_dir.join(format!("{}-haproxy.cfg", self.server_name));
        let io_error = |source| ComponentError::LocalIo {
            server: self.server_name.clone(),
            source,
        };
        tokio::fs::create_dir_all(work_dir).await.map_err(io_error)?;
        tokio::fs::write(&local, config).await.map_err(io_error)?;

        self.run_step(
            ctx,
            &RemoteStep::Copy {
                local,
                remote: commands::HAPROXY_CONFIG_PATH.to_string(),
            },
        )
        .await?;
        self.run_remote(ctx, commands::HAPROXY_RELOAD).await?;
        self.log().note("Proxy configuration installed.");
        Ok(())
    }
}
