//! Cadence configuration system.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CadenceError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub deployment: DeploymentConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

impl CadenceConfig {
    /// Load config from the default path (~/.cadence/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CadenceError::Config(format!("Failed to read config: {e}")))?;
        Self::parse(&content)
    }

    /// Parse and validate a TOML document.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| CadenceError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.events.validate()?;
        self.cluster.validate()
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Cadence home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cadence")
    }
}

/// Which replica the poll query may be served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadPreference {
    #[default]
    Primary,
    PrimaryPreferred,
    Secondary,
    Nearest,
}

/// Durability required before a claim/completion write is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteConcern {
    #[default]
    Majority,
    Acknowledged,
    Unacknowledged,
}

/// Event engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_min_poll_ms")]
    pub min_poll_ms: u64,
    #[serde(default = "default_max_poll_ms")]
    pub max_poll_ms: u64,
    #[serde(default = "default_poll_backoff_scalar")]
    pub poll_backoff_scalar: f64,
    #[serde(default = "default_max_concurrent_messages")]
    pub max_concurrent_messages: usize,
    #[serde(default)]
    pub read_preference: ReadPreference,
    #[serde(default)]
    pub write_concern: WriteConcern,
    #[serde(default = "default_defer_delay_ms")]
    pub script_saturation_defer_delay_ms: u64,
    /// Per-tenant overrides keyed by tenant id.
    #[serde(default)]
    pub tenants: HashMap<String, TenantEventsConfig>,
}

fn default_min_poll_ms() -> u64 { 100 }
fn default_max_poll_ms() -> u64 { 1000 }
fn default_poll_backoff_scalar() -> f64 { 1.5 }
fn default_max_concurrent_messages() -> usize { 50 }
fn default_defer_delay_ms() -> u64 { 500 }

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            min_poll_ms: default_min_poll_ms(),
            max_poll_ms: default_max_poll_ms(),
            poll_backoff_scalar: default_poll_backoff_scalar(),
            max_concurrent_messages: default_max_concurrent_messages(),
            read_preference: ReadPreference::default(),
            write_concern: WriteConcern::default(),
            script_saturation_defer_delay_ms: default_defer_delay_ms(),
            tenants: HashMap::new(),
        }
    }
}

impl EventsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_poll_ms == 0 {
            return Err(CadenceError::Config("events.min_poll_ms must be > 0".into()));
        }
        if self.max_poll_ms < self.min_poll_ms {
            return Err(CadenceError::Config(format!(
                "events.max_poll_ms ({}) must be >= events.min_poll_ms ({})",
                self.max_poll_ms, self.min_poll_ms
            )));
        }
        if !(self.poll_backoff_scalar >= 1.0) {
            return Err(CadenceError::Config(
                "events.poll_backoff_scalar must be >= 1.0".into(),
            ));
        }
        if self.max_concurrent_messages == 0 {
            return Err(CadenceError::Config(
                "events.max_concurrent_messages must be >= 1".into(),
            ));
        }
        Ok(())
    }

    pub fn min_poll(&self) -> Duration {
        Duration::from_millis(self.min_poll_ms)
    }

    pub fn max_poll(&self) -> Duration {
        Duration::from_millis(self.max_poll_ms)
    }

    /// How far a saturated tenant's script event is pushed back.
    pub fn script_defer_delay(&self, tenant: &str) -> Duration {
        let ms = self
            .tenants
            .get(tenant)
            .and_then(|t| t.script_saturation_defer_delay_ms)
            .unwrap_or(self.script_saturation_defer_delay_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenantEventsConfig {
    #[serde(default)]
    pub script_saturation_defer_delay_ms: Option<u64>,
}

/// Event store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_path() -> String { "~/.cadence/events.db".into() }

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// Cooperating worker processes sharing one queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_self_name")]
    pub self_name: String,
    /// Ordered endpoint names. Shard ranges are assigned by position.
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,
    #[serde(default = "default_max_shard_key")]
    pub max_shard_key: u32,
}

fn default_self_name() -> String { "worker-0".into() }
fn default_endpoints() -> Vec<String> { vec![default_self_name()] }
fn default_max_shard_key() -> u32 { u32::MAX }

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            self_name: default_self_name(),
            endpoints: default_endpoints(),
            max_shard_key: default_max_shard_key(),
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.endpoints.iter().any(|e| e == &self.self_name) {
            return Err(CadenceError::Config(format!(
                "cluster.self_name '{}' is not listed in cluster.endpoints",
                self.self_name
            )));
        }
        Ok(())
    }

    pub fn self_index(&self) -> Option<usize> {
        self.endpoints.iter().position(|e| e == &self.self_name)
    }
}

/// Deployment identity, used to gate console logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    #[serde(default = "default_env")]
    pub env: String,
    #[serde(default = "default_domain")]
    pub domain: String,
}

fn default_env() -> String { "development".into() }
fn default_domain() -> String { "local".into() }

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            env: default_env(),
            domain: default_domain(),
        }
    }
}

impl DeploymentConfig {
    /// Console events are dropped on restricted production deployments.
    pub fn allows_console(&self) -> bool {
        !(self.env == "production" && self.domain == "market")
    }
}

/// Outbound notification delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default = "default_notify_timeout")]
    pub timeout_secs: u64,
}

fn default_notify_timeout() -> u64 { 30 }

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            timeout_secs: default_notify_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CadenceConfig::default();
        assert_eq!(config.events.min_poll_ms, 100);
        assert_eq!(config.events.max_poll_ms, 1000);
        assert_eq!(config.events.poll_backoff_scalar, 1.5);
        assert_eq!(config.events.max_concurrent_messages, 50);
        assert_eq!(config.events.read_preference, ReadPreference::Primary);
        assert_eq!(config.events.write_concern, WriteConcern::Majority);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_with_tenant_override() {
        let config = CadenceConfig::parse(
            r#"
[events]
max_concurrent_messages = 8
write_concern = "acknowledged"

[events.tenants.acme]
script_saturation_defer_delay_ms = 250
"#,
        )
        .unwrap();
        assert_eq!(config.events.max_concurrent_messages, 8);
        assert_eq!(config.events.min_poll_ms, 100);
        assert_eq!(config.events.write_concern, WriteConcern::Acknowledged);
        assert_eq!(config.events.script_defer_delay("acme"), Duration::from_millis(250));
        assert_eq!(config.events.script_defer_delay("other"), Duration::from_millis(500));
    }

    #[test]
    fn test_rejects_inverted_poll_bounds() {
        let err = CadenceConfig::parse("[events]\nmin_poll_ms = 500\nmax_poll_ms = 100\n");
        assert!(matches!(err, Err(CadenceError::Config(_))));
    }

    #[test]
    fn test_rejects_unknown_self_endpoint() {
        let err = CadenceConfig::parse(
            "[cluster]\nself_name = \"worker-9\"\nendpoints = [\"worker-0\", \"worker-1\"]\n",
        );
        assert!(matches!(err, Err(CadenceError::Config(_))));
    }

    #[test]
    fn test_console_gate() {
        let mut deployment = DeploymentConfig::default();
        assert!(deployment.allows_console());
        deployment.env = "production".into();
        assert!(deployment.allows_console());
        deployment.domain = "market".into();
        assert!(!deployment.allows_console());
    }
}
