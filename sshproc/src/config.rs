//! Connection parameters and the host inventory file.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable consulted for private key passphrases when none is configured.
pub const KEY_PASSPHRASE_ENV: &str = "SSHPROC_KEY_PASSPHRASE";

/// Key file names tried, in order, when looking for keys in the keys directory.
pub const DEFAULT_KEY_NAMES: [&str; 3] = ["id_ed25519", "id_rsa", "id_ecdsa"];

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read file {0}: {1}")]
    FileRead(PathBuf, std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// SSH connection configuration
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectConfig {
    /// Remote hostname or IP
    pub host: String,

    /// SSH port (default 22)
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Remote login name; the local login name when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Private key tried before anything else
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,

    /// Path to SSH keys directory (default ~/.ssh)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys_dir: Option<PathBuf>,

    /// known_hosts file (default ~/.ssh/known_hosts)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts_path: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub allow_agent: bool,

    #[serde(default = "default_true")]
    pub look_for_keys: bool,

    /// Accept hosts missing from known_hosts. Changed keys are always rejected.
    #[serde(default)]
    pub accept_unknown_hosts: bool,

    /// Connection timeout
    #[serde(default = "default_timeout", with = "duration_secs")]
    pub timeout: Duration,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

impl fmt::Debug for ConnectConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("key_path", &self.key_path)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("keys_dir", &self.keys_dir)
            .field("known_hosts_path", &self.known_hosts_path)
            .field("allow_agent", &self.allow_agent)
            .field("look_for_keys", &self.look_for_keys)
            .field("accept_unknown_hosts", &self.accept_unknown_hosts)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ConnectConfig {
    /// Config for `host` on port 22 with every other setting at its default.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_ssh_port(),
            username: None,
            password: None,
            key_path: None,
            passphrase: None,
            keys_dir: None,
            known_hosts_path: None,
            allow_agent: true,
            look_for_keys: true,
            accept_unknown_hosts: false,
            timeout: default_timeout(),
        }
    }

    /// Parse `[user@]host[:port]`.
    pub fn from_target(target: &str) -> Result<Self> {
        let target = target.trim();
        let (username, rest) = match target.rsplit_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
            Some(_) => {
                return Err(ConfigError::Validation(format!(
                    "Empty user name in target '{target}'"
                )));
            }
            None => (None, target),
        };

        // Bracketed IPv6 literal, optionally followed by a port.
        let (host, port) = if let Some(inner) = rest.strip_prefix('[') {
            let (host, after) = inner.split_once(']').ok_or_else(|| {
                ConfigError::Validation(format!("Unterminated '[' in target '{target}'"))
            })?;
            let port = match after.strip_prefix(':') {
                Some(port) => Some(parse_port(port, target)?),
                None if after.is_empty() => None,
                None => {
                    return Err(ConfigError::Validation(format!(
                        "Unexpected '{after}' in target '{target}'"
                    )));
                }
            };
            (host, port)
        } else if rest.matches(':').count() == 1 {
            let (host, port) = rest.split_once(':').unwrap_or((rest, ""));
            (host, Some(parse_port(port, target)?))
        } else {
            (rest, None)
        };

        if host.is_empty() {
            return Err(ConfigError::Validation(format!(
                "Missing host in target '{target}'"
            )));
        }

        let mut config = Self::new(host);
        config.username = username;
        if let Some(port) = port {
            config.port = port;
        }
        Ok(config)
    }

    /// Get the SSH keys directory
    pub fn keys_directory(&self) -> PathBuf {
        self.keys_dir.clone().unwrap_or_else(ssh_dir)
    }

    /// Get the known_hosts file consulted for host key checks
    pub fn known_hosts_file(&self) -> PathBuf {
        self.known_hosts_path
            .clone()
            .unwrap_or_else(|| ssh_dir().join("known_hosts"))
    }

    /// Remote login name, falling back to the local one.
    pub fn login_name(&self) -> Option<String> {
        self.username.clone().or_else(local_username)
    }
}

fn parse_port(value: &str, target: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| ConfigError::Validation(format!("Invalid port '{value}' in '{target}'")))
}

fn ssh_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ssh")
}

fn local_username() -> Option<String> {
    ["USER", "USERNAME", "LOGNAME"]
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|value| !value.trim().is_empty())
}

/// Get sshproc's home directory (`SSHPROC_HOME`, else `~/.sshproc`).
pub fn sshproc_home_dir() -> std::result::Result<PathBuf, std::io::Error> {
    if let Ok(v) = std::env::var("SSHPROC_HOME")
        && !v.trim().is_empty()
    {
        return Ok(PathBuf::from(v));
    }

    let home = dirs::home_dir().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Could not determine home directory",
        )
    })?;

    Ok(home.join(".sshproc"))
}

/// Host inventory from ~/.sshproc/hosts.toml `[hosts.<alias>]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HostsToml {
    /// Map of alias to connection settings
    #[serde(default)]
    pub hosts: HashMap<String, ConnectConfig>,
}

impl HostsToml {
    /// Get the default path of the inventory file.
    pub fn default_path() -> Result<PathBuf> {
        let home = sshproc_home_dir().map_err(|e| {
            ConfigError::Validation(format!("Could not determine sshproc home directory: {}", e))
        })?;
        Ok(home.join("hosts.toml"))
    }

    /// Load the inventory from the default location. A missing file is an empty inventory.
    pub fn load() -> Result<Self> {
        let path = Self::default_path()?;
        if path.exists() {
            return Self::load_from_file(&path);
        }
        Ok(Self::default())
    }

    /// Load the inventory from a specific file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileRead(path.as_ref().to_path_buf(), e))?;
        Self::parse(&content)
    }

    /// Parse inventory TOML.
    pub fn parse(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let inventory: HostsToml = toml::from_str(content)?;
        for (alias, entry) in &inventory.hosts {
            if entry.host.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Host '{alias}' has an empty host name"
                )));
            }
            if entry.port == 0 {
                return Err(ConfigError::Validation(format!(
                    "Host '{alias}' has an invalid port 0"
                )));
            }
        }
        Ok(inventory)
    }

    /// Look up an alias, or treat `target` as `[user@]host[:port]`.
    pub fn resolve(&self, target: &str) -> Result<ConnectConfig> {
        if let Some(entry) = self.hosts.get(target) {
            return Ok(entry.clone());
        }
        ConnectConfig::from_target(target)
    }
}
