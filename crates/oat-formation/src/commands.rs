//! Remote command plans. Every command is safe to re-run: work that already
//! happened is skipped by checking a marker file on the server.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::model::BootstrapStep;

pub const APT_MARKER: &str = "apt_update_done";
pub const KEY_INSTALLER: &str = "pub_key_adder.sh";
pub const HAPROXY_CONFIG_PATH: &str = "/etc/haproxy/haproxy.cfg";
pub const HAPROXY_RELOAD: &str = "service haproxy restart";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStep {
    Shell(String),
    Copy { local: PathBuf, remote: String },
}

impl fmt::Display for RemoteStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shell(cmd) => f.write_str(cmd),
            Self::Copy { local, remote } => write!(f, "copy {} -> :{remote}", local.display()),
        }
    }
}

/// `if [ -e {marker} ]; then echo {skip}; else {action}; fi`
pub fn guarded(marker: &str, skip: &str, action: &str) -> String {
    format!("if [ -e {marker} ]; then echo {skip}; else {action}; fi")
}

pub fn step_dir(index: usize) -> String {
    format!("bootstrap-{index}")
}

pub fn done_marker(index: usize) -> String {
    format!("bootstrap-{index}-done")
}

/// Full bootstrap of one server: package index, git, every bootstrap step in
/// order, then the public key bundle.
pub fn bootstrap_plan(steps: &[BootstrapStep], public_keys_dir: &Path) -> Vec<RemoteStep> {
    let mut plan = vec![
        RemoteStep::Shell(guarded(
            APT_MARKER,
            "no need to update",
            &format!("apt-get update > /dev/null && touch {APT_MARKER}"),
        )),
        RemoteStep::Shell(
            "if which git > /dev/null; then echo git installed; else apt-get -y install git > git_install; fi"
                .into(),
        ),
    ];

    for (index, step) in steps.iter().enumerate() {
        let dir = step_dir(index);
        let done = done_marker(index);
        match step {
            BootstrapStep::Git { url } => {
                plan.push(RemoteStep::Shell(guarded(
                    &dir,
                    &format!("no need to clone {dir}"),
                    &format!("git clone {url} {dir}"),
                )));
                // New upstream commits invalidate the done marker.
                plan.push(RemoteStep::Shell(format!(
                    "cd {dir} && if git pull | grep -q \"Already up\"; then echo {dir} up to date; else rm -f ../{done}; fi"
                )));
                plan.push(RemoteStep::Shell(guarded(
                    &done,
                    &format!("{dir} done"),
                    &format!("cd {dir} && bash -l bootstrap.sh && touch ../{done}"),
                )));
            }
        }
    }

    let bundle = public_keys_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "public_ssh_keys".into());
    plan.push(RemoteStep::Copy {
        local: public_keys_dir.to_path_buf(),
        remote: String::new(),
    });
    plan.push(RemoteStep::Shell(format!("cd {bundle} && bash -l {KEY_INSTALLER}")));

    plan
}

/// Replace every `.vip` line of `/etc/hosts` with `entries`.
pub fn host_entry_commands(entries: &[String]) -> Vec<String> {
    let mut commands = vec!["sed -i '/\\.vip$/d' /etc/hosts".to_string()];
    commands.extend(entries.iter().map(|e| format!("echo \"{e}\" >> /etc/hosts")));
    commands
}
