//! In-memory provider and transport for tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use oat_infra::types::{
    CommandOutput, FlavorRecord, ImageRecord, KeypairRecord, SecurityGroupRecord, ServerHandle,
    ServerId, ServerSpec, ServerState, ServerSummary,
};
use oat_infra::{ComputeProvider, Error, ProviderName, RemoteTransport, Result};

use crate::model::Defaults;
use crate::settings::RunSettings;

pub fn pem_file() -> tempfile::NamedTempFile {
    tempfile::Builder::new()
        .suffix(".pem")
        .tempfile()
        .unwrap()
}

pub fn defaults(pem: &Path) -> Defaults {
    Defaults {
        ssh_key_name: "milo-qa".into(),
        pem_file: pem.to_path_buf(),
        security_groups: vec!["default".into()],
    }
}

/// Production retry bounds with every pause removed.
pub fn fast_settings(dir: &Path) -> RunSettings {
    RunSettings {
        log_dir: dir.to_path_buf(),
        work_dir: dir.to_path_buf(),
        public_keys_dir: dir.join("public_ssh_keys"),
        ..RunSettings::default()
    }
    .with_delays(Duration::ZERO, Duration::ZERO)
}

#[derive(Default)]
struct Cloud {
    servers: Vec<(ServerId, String)>,
    created: Vec<ServerSpec>,
    polls: HashMap<String, u32>,
    never_active: HashSet<String>,
    activate_after: HashMap<String, u32>,
}

/// Catalog: images `ubuntu-12.04`, flavors `small`/`tiny`, keypair `milo-qa`,
/// security groups `default`/`web`. Server `x` gets address `x.test`.
pub struct FakeProvider {
    images: Vec<ImageRecord>,
    flavors: Vec<FlavorRecord>,
    keypairs: Vec<KeypairRecord>,
    groups: Vec<SecurityGroupRecord>,
    cloud: Mutex<Cloud>,
}

impl FakeProvider {
    pub fn standard() -> Self {
        let record = |id: &str, name: &str| (id.to_string(), name.to_string());
        Self {
            images: [record("img-1", "ubuntu-12.04")]
                .into_iter()
                .map(|(id, name)| ImageRecord { id, name })
                .collect(),
            flavors: [record("flv-1", "small"), record("flv-2", "tiny")]
                .into_iter()
                .map(|(id, name)| FlavorRecord { id, name })
                .collect(),
            keypairs: vec![KeypairRecord {
                name: "milo-qa".into(),
            }],
            groups: [record("sg-1", "default"), record("sg-2", "web")]
                .into_iter()
                .map(|(id, name)| SecurityGroupRecord { id, name })
                .collect(),
            cloud: Mutex::new(Cloud::default()),
        }
    }

    pub fn with_existing_server(self, name: &str) -> Self {
        {
            let mut cloud = self.cloud.lock().unwrap();
            let id = ServerId(format!("pre-{name}"));
            cloud.servers.push((id, name.to_string()));
        }
        self
    }

    pub fn never_active(self, name: &str) -> Self {
        self.cloud.lock().unwrap().never_active.insert(name.to_string());
        self
    }

    /// Report active from the `polls`-th status read on.
    pub fn activate_after(self, name: &str, polls: u32) -> Self {
        self.cloud
            .lock()
            .unwrap()
            .activate_after
            .insert(name.to_string(), polls);
        self
    }

    pub fn created(&self) -> Vec<ServerSpec> {
        self.cloud.lock().unwrap().created.clone()
    }

    pub fn polls(&self, name: &str) -> u32 {
        self.cloud
            .lock()
            .unwrap()
            .polls
            .get(name)
            .copied()
            .unwrap_or_default()
    }

    fn handle(id: ServerId, name: &str, active: bool) -> ServerHandle {
        let (state, status) = if active {
            (ServerState::Active, "active")
        } else {
            (ServerState::Building, "building")
        };
        ServerHandle {
            id,
            name: name.to_string(),
            state,
            status: status.to_string(),
            addresses: vec![format!("{name}.test")],
        }
    }
}

#[async_trait]
impl ComputeProvider for FakeProvider {
    async fn list_images(&self) -> Result<Vec<ImageRecord>> {
        Ok(self.images.clone())
    }

    async fn list_flavors(&self) -> Result<Vec<FlavorRecord>> {
        Ok(self.flavors.clone())
    }

    async fn list_keypairs(&self) -> Result<Vec<KeypairRecord>> {
        Ok(self.keypairs.clone())
    }

    async fn list_security_groups(&self) -> Result<Vec<SecurityGroupRecord>> {
        Ok(self.groups.clone())
    }

    async fn list_servers(&self) -> Result<Vec<ServerSummary>> {
        let cloud = self.cloud.lock().unwrap();
        Ok(cloud
            .servers
            .iter()
            .map(|(id, name)| ServerSummary {
                id: id.clone(),
                name: name.clone(),
            })
            .collect())
    }

    async fn create_server(&self, spec: &ServerSpec) -> Result<ServerHandle> {
        let mut cloud = self.cloud.lock().unwrap();
        let id = ServerId(format!("srv-{}", cloud.servers.len() + 1));
        cloud.servers.push((id.clone(), spec.name.clone()));
        cloud.created.push(spec.clone());
        Ok(Self::handle(id, &spec.name, false))
    }

    async fn get_server(&self, id: &ServerId) -> Result<ServerHandle> {
        let mut cloud = self.cloud.lock().unwrap();
        let name = cloud
            .servers
            .iter()
            .find(|(sid, _)| sid == id)
            .map(|(_, name)| name.clone())
            .ok_or_else(|| Error::ServerNotFound(id.0.clone()))?;
        let polls = {
            let polls = cloud.polls.entry(name.clone()).or_default();
            *polls += 1;
            *polls
        };
        let needed = cloud.activate_after.get(&name).copied().unwrap_or(1);
        let active = !cloud.never_active.contains(&name) && polls >= needed;
        Ok(Self::handle(id.clone(), &name, active))
    }

    fn name(&self) -> ProviderName {
        ProviderName::OpenStack
    }
}

#[derive(Default)]
struct Host {
    files: HashSet<String>,
    commands: Vec<String>,
    copies: Vec<(PathBuf, String)>,
    clones: u32,
    script_runs: u32,
    apt_updates: u32,
    connection_attempts: u32,
    successful_connections: u32,
    unreachable: u32,
    drop_after: Option<u32>,
    upstream_changed: HashSet<String>,
    panic_on: Option<String>,
}

impl Host {
    /// Apply the effects of a shell command, understanding the marker-guarded
    /// forms the bootstrap plan emits.
    fn interpret(&mut self, command: &str) {
        if let Some(rest) = command.strip_prefix("if [ -e ") {
            let Some((marker, rest)) = rest.split_once(" ]; then echo ") else {
                return;
            };
            let Some((_, action)) = rest.split_once("; else ") else {
                return;
            };
            let action = action.strip_suffix("; fi").unwrap_or(action);
            if !self.files.contains(marker) {
                self.perform(action);
            }
        } else if command.contains("git pull") {
            let dir = command
                .strip_prefix("cd ")
                .and_then(|rest| rest.split_whitespace().next())
                .unwrap_or_default();
            if self.upstream_changed.remove(dir) {
                self.files.remove(&format!("{dir}-done"));
            }
        } else {
            self.perform(command);
        }
    }

    fn perform(&mut self, action: &str) {
        for part in action.split(" && ").map(str::trim) {
            if let Some(args) = part.strip_prefix("git clone ") {
                if let Some(dir) = args.split_whitespace().nth(1) {
                    self.files.insert(dir.to_string());
                }
                self.clones += 1;
            } else if part.starts_with("bash -l bootstrap.sh") {
                self.script_runs += 1;
            } else if part.starts_with("apt-get update") {
                self.apt_updates += 1;
            } else if let Some(path) = part.strip_prefix("touch ") {
                self.files.insert(path.trim_start_matches("../").to_string());
            }
        }
    }
}

/// Records every command per address and simulates the remote marker files.
#[derive(Default)]
pub struct FakeTransport {
    hosts: Mutex<HashMap<String, Host>>,
    /// (substring, remaining failures); `u32::MAX` never runs out.
    failures: Mutex<Vec<(String, u32)>>,
}

impl FakeTransport {
    fn configure(mut self, address: &str, f: impl FnOnce(&mut Host)) -> Self {
        let hosts = self.hosts.get_mut().unwrap();
        f(hosts.entry(address.to_string()).or_default());
        self
    }

    /// Refuse the next `times` connections; `u32::MAX` refuses forever.
    pub fn unreachable(self, address: &str, times: u32) -> Self {
        self.configure(address, |h| h.unreachable = times)
    }

    /// Accept `successes` connections, then refuse every later one.
    pub fn drop_after(self, address: &str, successes: u32) -> Self {
        self.configure(address, |h| h.drop_after = Some(successes))
    }

    pub fn panic_on(self, address: &str, pattern: &str) -> Self {
        self.configure(address, |h| h.panic_on = Some(pattern.to_string()))
    }

    /// Commands containing `pattern` exit 1 the next `times` times.
    pub fn fail_commands(self, pattern: &str, times: u32) -> Self {
        self.failures
            .lock()
            .unwrap()
            .push((pattern.to_string(), times));
        self
    }

    /// The next `git pull` in `dir` reports new commits.
    pub fn push_upstream(&self, address: &str, dir: &str) {
        self.with_host(address, |h| {
            h.upstream_changed.insert(dir.to_string());
        });
    }

    fn with_host<T>(&self, address: &str, f: impl FnOnce(&mut Host) -> T) -> T {
        let mut hosts = self.hosts.lock().unwrap();
        f(hosts.entry(address.to_string()).or_default())
    }

    pub fn commands(&self, address: &str) -> Vec<String> {
        self.with_host(address, |h| h.commands.clone())
    }

    pub fn copies(&self, address: &str) -> Vec<(PathBuf, String)> {
        self.with_host(address, |h| h.copies.clone())
    }

    pub fn clones(&self, address: &str) -> u32 {
        self.with_host(address, |h| h.clones)
    }

    pub fn script_runs(&self, address: &str) -> u32 {
        self.with_host(address, |h| h.script_runs)
    }

    pub fn apt_updates(&self, address: &str) -> u32 {
        self.with_host(address, |h| h.apt_updates)
    }

    pub fn connection_attempts(&self, address: &str) -> u32 {
        self.with_host(address, |h| h.connection_attempts)
    }

    fn injected_failure(&self, command: &str) -> bool {
        let mut failures = self.failures.lock().unwrap();
        match failures
            .iter_mut()
            .find(|(pattern, left)| *left > 0 && command.contains(pattern.as_str()))
        {
            Some((_, left)) => {
                if *left != u32::MAX {
                    *left -= 1;
                }
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl RemoteTransport for FakeTransport {
    async fn test_connection(&self, address: &str, _key_file: &Path) -> Result<()> {
        let refused = self.with_host(address, |h| {
            h.connection_attempts += 1;
            if h.unreachable > 0 {
                if h.unreachable != u32::MAX {
                    h.unreachable -= 1;
                }
                return true;
            }
            if h.drop_after.is_some_and(|limit| h.successful_connections >= limit) {
                return true;
            }
            h.successful_connections += 1;
            false
        });
        if refused {
            return Err(Error::TransportStatus {
                program: "ssh",
                exit_code: 255,
                stderr: "Connection refused".into(),
            });
        }
        Ok(())
    }

    async fn run_command(&self, address: &str, _key_file: &Path, command: &str) -> Result<CommandOutput> {
        let failed = self.injected_failure(command);
        let should_panic = self.with_host(address, |h| {
            h.commands.push(command.to_string());
            let should_panic = h
                .panic_on
                .as_deref()
                .is_some_and(|pattern| command.contains(pattern));
            if !failed && !should_panic {
                h.interpret(command);
            }
            should_panic
        });
        // Outside the lock so other tasks can keep using the fake.
        if should_panic {
            panic!("simulated crash running `{command}` on {address}");
        }
        if failed {
            return Ok(CommandOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: "simulated failure".into(),
            });
        }
        Ok(CommandOutput::default())
    }

    async fn copy(
        &self,
        local_path: &Path,
        address: &str,
        _key_file: &Path,
        remote_path: &str,
    ) -> Result<CommandOutput> {
        self.with_host(address, |h| {
            h.copies
                .push((local_path.to_path_buf(), remote_path.to_string()))
        });
        Ok(CommandOutput::default())
    }

    fn describe(&self, address: &str, _key_file: &Path, command: &str) -> String {
        format!("ssh {address} '{command}'")
    }
}
