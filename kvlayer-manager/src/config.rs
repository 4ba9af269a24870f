//! Client configuration and process-level options.
//!
//! [`ClientConfig`] is the document an orchestrator hands to a
//! [`Manager`](crate::Manager): which servers to talk to, whether a
//! migration or a replica is in effect, and the optional local layers. It is
//! plain data, read from JSON (remote reload payloads) or YAML (files), and
//! never evaluated.
//!
//! [`ManagerOptions`] holds what varies per process rather than per config:
//! the hostname checked against `disabled_client_hosts`, the kill switch,
//! and the reload jitter.

use std::path::Path;
use std::time::Duration;

use kvlayer_core::{ConfigError, KvResult};
use serde::{Deserialize, Serialize};

// ============================================================================
// CLIENT CONFIG
// ============================================================================

/// Topology of one logical cache client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Servers the base client connects to.
    #[serde(default)]
    pub servers: Vec<String>,

    /// Destination of an ongoing migration. Non-empty enables
    /// [`MigratingStore`](kvlayer_topology::MigratingStore).
    #[serde(default)]
    pub new_servers: Vec<String>,

    /// Replica servers. Non-empty enables
    /// [`ReplicatedStore`](kvlayer_topology::ReplicatedStore).
    #[serde(default)]
    pub backup_servers: Vec<String>,

    /// Bound of the per-process [`LocalCache`](kvlayer_topology::LocalCache);
    /// absent means no local layer.
    #[serde(default)]
    pub local_cache_size: Option<usize>,

    /// Replace the client with a store that misses on every read.
    #[serde(default)]
    pub disabled: bool,

    /// Hostnames on which the client is disabled.
    #[serde(default)]
    pub disabled_client_hosts: Vec<String>,

    /// Trace every call in a sample of processes.
    #[serde(default)]
    pub log_every_actions: bool,

    /// Path the orchestrator publishes updates of this config under.
    #[serde(default)]
    pub config_path: Option<String>,
}

impl ClientConfig {
    pub fn with_servers<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            servers: servers.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(payload: &str) -> KvResult<Self> {
        let config: Self = serde_json::from_str(payload).map_err(|e| ConfigError::InvalidPayload {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml_str(payload: &str) -> KvResult<Self> {
        let config: Self = serde_yaml::from_str(payload).map_err(|e| ConfigError::InvalidPayload {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read a YAML config file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> KvResult<Self> {
        let path = path.as_ref();
        let payload = std::fs::read_to_string(path).map_err(|e| ConfigError::InvalidPayload {
            reason: format!("{}: {}", path.display(), e),
        })?;
        Self::from_yaml_str(&payload)
    }

    /// Check the config describes a usable client.
    pub fn validate(&self) -> KvResult<()> {
        if self.servers.is_empty() && !self.disabled {
            return Err(ConfigError::MissingRequired {
                field: "servers".to_string(),
            }
            .into());
        }

        for (field, hosts) in [
            ("servers", &self.servers),
            ("new_servers", &self.new_servers),
            ("backup_servers", &self.backup_servers),
        ] {
            if hosts.iter().any(|h| h.trim().is_empty()) {
                return Err(ConfigError::InvalidPayload {
                    reason: format!("{field} contains an empty server address"),
                }
                .into());
            }
        }

        Ok(())
    }

    /// Stable encoding used to identify equal configs.
    pub fn canonical(&self) -> String {
        // Struct fields serialize in declaration order.
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ============================================================================
// MANAGER OPTIONS
// ============================================================================

/// Default upper bound of the random delay before applying a reload.
pub const DEFAULT_RELOAD_JITTER: Duration = Duration::from_millis(3000);

/// One process in this many traces every call when `log_every_actions` is on.
pub const LOG_SAMPLE_MODULUS: u32 = 25;

/// Per-process settings of a [`Manager`](crate::Manager).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerOptions {
    /// Disable caching regardless of config.
    pub disabled: bool,

    /// This host's name, matched against `disabled_client_hosts`.
    pub hostname: Option<String>,

    /// Upper bound of the delay before a reload is applied, spreading the
    /// reconnects of a fleet receiving the same update.
    pub reload_jitter: Duration,

    /// Process id used for log sampling.
    pub pid: u32,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            disabled: false,
            hostname: None,
            reload_jitter: DEFAULT_RELOAD_JITTER,
            pid: std::process::id(),
        }
    }
}

impl ManagerOptions {
    /// Create ManagerOptions from environment variables.
    ///
    /// Environment variables:
    /// - `KVLAYER_DISABLE`: any value other than empty, "0" or "false" disables caching
    /// - `KVLAYER_HOSTNAME`: hostname override (default: `HOSTNAME`)
    /// - `KVLAYER_RELOAD_JITTER_MS`: reload jitter bound in milliseconds (default: 3000)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let disabled = std::env::var("KVLAYER_DISABLE")
            .ok()
            .map(|s| is_truthy(&s))
            .unwrap_or(false);

        let hostname = std::env::var("KVLAYER_HOSTNAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let reload_jitter = std::env::var("KVLAYER_RELOAD_JITTER_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.reload_jitter);

        Self {
            disabled,
            hostname,
            reload_jitter,
            pid: defaults.pid,
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn with_reload_jitter(mut self, jitter: Duration) -> Self {
        self.reload_jitter = jitter;
        self
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    /// Whether this process falls in the logging sample.
    pub fn log_sampled(&self) -> bool {
        self.pid % LOG_SAMPLE_MODULUS == 0
    }

    /// Whether `config` turns caching off for this process.
    pub fn disables(&self, config: &ClientConfig) -> bool {
        self.disabled
            || config.disabled
            || self
                .hostname
                .as_ref()
                .is_some_and(|h| config.disabled_client_hosts.iter().any(|d| d == h))
    }
}

fn is_truthy(value: &str) -> bool {
    let value = value.trim();
    !(value.is_empty() || value == "0" || value.eq_ignore_ascii_case("false"))
}

// =============================================================================
// TESTS
// =============================================================================
