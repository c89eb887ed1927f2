use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::types::CommandOutput;
use crate::{Error, RemoteTransport, Result};

const SSH_OPTIONS: [&str; 8] = [
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "BatchMode=yes",
    "-o",
    "LogLevel=ERROR",
];

/// Remote transport backed by the system `ssh` and `scp` binaries.
///
/// Host keys are not verified: formation servers are freshly created and
/// their keys are unknown to us.
#[derive(Debug, Clone)]
pub struct SshTransport {
    user: String,
    connect_timeout_secs: u64,
}

impl SshTransport {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            connect_timeout_secs: 10,
        }
    }

    pub fn with_connect_timeout(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    fn target(&self, address: &str) -> String {
        format!("{}@{address}", self.user)
    }

    fn base_args(&self, key_file: &Path) -> Vec<String> {
        let mut args = vec!["-i".to_string(), key_file.display().to_string()];
        args.extend(SSH_OPTIONS.iter().map(|s| s.to_string()));
        args.push("-o".into());
        args.push(format!("ConnectTimeout={}", self.connect_timeout_secs));
        args
    }

    async fn exec(program: &'static str, args: Vec<String>) -> Result<CommandOutput> {
        debug!(program, ?args, "transport: spawning");

        let output = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(CommandOutput {
            // `None` means the process was killed by a signal.
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl Default for SshTransport {
    fn default() -> Self {
        Self::new("root")
    }
}

#[async_trait]
impl RemoteTransport for SshTransport {
    async fn test_connection(&self, address: &str, key_file: &Path) -> Result<()> {
        let mut args = self.base_args(key_file);
        args.push(self.target(address));
        args.push("true".into());

        let out = Self::exec("ssh", args).await?;
        if !out.success() {
            return Err(Error::TransportStatus {
                program: "ssh",
                exit_code: out.exit_code,
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    async fn run_command(
        &self,
        address: &str,
        key_file: &Path,
        command: &str,
    ) -> Result<CommandOutput> {
        let mut args = self.base_args(key_file);
        args.push(self.target(address));
        args.push(command.to_string());
        Self::exec("ssh", args).await
    }

    async fn copy(
        &self,
        local_path: &Path,
        address: &str,
        key_file: &Path,
        remote_path: &str,
    ) -> Result<CommandOutput> {
        let mut args = vec!["-r".to_string()];
        args.extend(self.base_args(key_file));
        args.push(local_path.display().to_string());
        args.push(format!("{}:{remote_path}", self.target(address)));
        Self::exec("scp", args).await
    }

    fn describe(&self, address: &str, key_file: &Path, command: &str) -> String {
        format!(
            "ssh {} {} '{command}'",
            self.base_args(key_file).join(" "),
            self.target(address)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn describe_includes_key_target_and_quoted_command() {
        let transport = SshTransport::new("root");
        let line = transport.describe("10.0.0.4", &PathBuf::from("/keys/qa.pem"), "uptime");
        assert!(line.starts_with("ssh -i /keys/qa.pem "));
        assert!(line.contains("StrictHostKeyChecking=no"));
        assert!(line.contains("ConnectTimeout=10"));
        assert!(line.ends_with("root@10.0.0.4 'uptime'"));
    }

    #[test]
    fn connect_timeout_is_configurable() {
        let transport = SshTransport::new("ubuntu").with_connect_timeout(3);
        let line = transport.describe("h", &PathBuf::from("k"), "true");
        assert!(line.contains("ConnectTimeout=3"));
        assert!(line.contains("ubuntu@h"));
    }
}
