use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use oat_formation::RunSettings;
use oat_infra::ProviderName;

use crate::error::CliError;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub provider: ProviderName,
    pub ssh_user: String,
    pub log_dir: PathBuf,
    pub work_dir: PathBuf,
    pub public_keys_dir: PathBuf,
    pub poll_interval_secs: u64,
    pub command_retry_delay_secs: u64,
    pub max_parallelism: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, CliError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, CliError> {
        let get = |name: &str, default: &str| var(name).unwrap_or_else(|| default.into());
        Ok(Self {
            provider: parse("OAT_PROVIDER", get("OAT_PROVIDER", "openstack"))?,
            ssh_user: get("OAT_SSH_USER", "root"),
            log_dir: get("OAT_LOG_DIR", ".").into(),
            work_dir: get("OAT_WORK_DIR", ".").into(),
            public_keys_dir: get("OAT_PUBLIC_KEYS_DIR", "public_ssh_keys").into(),
            poll_interval_secs: parse("OAT_POLL_INTERVAL_SECS", get("OAT_POLL_INTERVAL_SECS", "30"))?,
            command_retry_delay_secs: parse(
                "OAT_COMMAND_RETRY_DELAY_SECS",
                get("OAT_COMMAND_RETRY_DELAY_SECS", "10"),
            )?,
            max_parallelism: parse("OAT_MAX_PARALLELISM", get("OAT_MAX_PARALLELISM", "64"))?,
        })
    }

    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            log_dir: self.log_dir.clone(),
            work_dir: self.work_dir.clone(),
            public_keys_dir: self.public_keys_dir.clone(),
            max_parallelism: self.max_parallelism,
            ..RunSettings::default()
        }
        .with_delays(
            Duration::from_secs(self.poll_interval_secs),
            Duration::from_secs(self.command_retry_delay_secs),
        )
    }
}

fn parse<T: FromStr>(name: &'static str, value: String) -> Result<T, CliError> {
    value
        .parse()
        .map_err(|_| CliError::InvalidEnv { name, value })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<AppConfig, CliError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_match_production_bounds() {
        let config = config(&[]).unwrap();
        assert_eq!(config.provider, ProviderName::OpenStack);
        assert_eq!(config.ssh_user, "root");

        let settings = config.run_settings();
        assert_eq!(settings.activation.delay, Duration::from_secs(30));
        assert_eq!(settings.connectivity.max_attempts, 7);
        assert_eq!(settings.command.delay, Duration::from_secs(10));
        assert_eq!(settings.max_parallelism, 64);
        assert_eq!(settings.public_keys_dir, PathBuf::from("public_ssh_keys"));
    }

    #[test]
    fn overrides_are_applied() {
        let config = config(&[
            ("OAT_PROVIDER", "hetzner"),
            ("OAT_POLL_INTERVAL_SECS", "1"),
            ("OAT_LOG_DIR", "/var/log/oat"),
        ])
        .unwrap();
        assert_eq!(config.provider, ProviderName::Hetzner);
        assert_eq!(config.run_settings().activation.delay, Duration::from_secs(1));
        assert_eq!(config.log_dir, PathBuf::from("/var/log/oat"));
    }

    #[test]
    fn bad_values_name_the_variable() {
        let err = config(&[("OAT_MAX_PARALLELISM", "lots")]).unwrap_err();
        assert!(matches!(err, CliError::InvalidEnv { name: "OAT_MAX_PARALLELISM", .. }));

        let err = config(&[("OAT_PROVIDER", "aws")]).unwrap_err();
        assert!(matches!(err, CliError::InvalidEnv { name: "OAT_PROVIDER", .. }));
    }
}
