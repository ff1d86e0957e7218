//! Configuration loading and types

use std::path::{Path, PathBuf};

use helmsman_exec::{HostKeyPolicy, KeySource, Server, SshConfig};
use serde::{Deserialize, Serialize};

/// Top-level `helmsman.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` wins
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// SSH settings shared by every remote host
    #[serde(default)]
    pub ssh: SshDefaults,
    /// Named hosts
    #[serde(default)]
    pub host: Vec<HostAlias>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            ssh: SshDefaults::default(),
            host: Vec::new(),
        }
    }
}

/// Defaults for SSH connections
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshDefaults {
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub key: KeySource,
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
}

impl Default for SshDefaults {
    fn default() -> Self {
        Self {
            user: default_user(),
            port: default_port(),
            key: KeySource::default(),
            host_key_policy: HostKeyPolicy::default(),
        }
    }
}

/// A `[[host]]` entry; unset fields fall back to `[ssh]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostAlias {
    /// Name used on the command line
    pub name: String,
    /// Address to connect to, `name` if unset
    pub address: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub key: Option<KeySource>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_user() -> String {
    "root".to_string()
}

fn default_port() -> u16 {
    22
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("failed to read {}: {e}", path.display()))?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from `explicit`, `$HELMSMAN_CONFIG` or the usual locations
    ///
    /// Returns the path that was used, `None` when falling back to defaults.
    ///
    /// # Errors
    /// Returns error if a chosen file cannot be read or parsed
    pub fn discover(explicit: Option<&Path>) -> eyre::Result<(Self, Option<PathBuf>)> {
        let chosen = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("HELMSMAN_CONFIG").map(PathBuf::from));
        if let Some(path) = chosen {
            return Ok((Self::load(&path)?, Some(path)));
        }

        let paths = [
            Some(PathBuf::from("helmsman.toml")),
            Some(PathBuf::from("/etc/helmsman/helmsman.toml")),
            dirs::config_dir().map(|p| p.join("helmsman/helmsman.toml")),
        ];
        for path in paths.into_iter().flatten() {
            if path.exists() {
                return Ok((Self::load(&path)?, Some(path)));
            }
        }

        Ok((Config::default(), None))
    }

    /// SSH settings for `name`, resolving `[[host]]` aliases
    #[must_use]
    pub fn ssh_config(&self, name: &str) -> SshConfig {
        let alias = self.host.iter().find(|h| h.name == name);
        let address = alias
            .and_then(|h| h.address.clone())
            .unwrap_or_else(|| name.to_string());
        let user = alias
            .and_then(|h| h.user.clone())
            .unwrap_or_else(|| self.ssh.user.clone());

        SshConfig {
            port: alias.and_then(|h| h.port).unwrap_or(self.ssh.port),
            key: alias
                .and_then(|h| h.key.clone())
                .unwrap_or_else(|| self.ssh.key.clone()),
            host_key_policy: self.ssh.host_key_policy.clone(),
            ..SshConfig::new(address, user)
        }
    }

    /// Server for a command-line host argument
    #[must_use]
    pub fn server(&self, name: &str) -> Server {
        let template = self.ssh_config(name);
        let host = template.host.clone();
        Server::connect(&host, &template)
    }
}
