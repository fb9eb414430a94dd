//! Configuration loading from TOML and environment variables.
//!
//! A node reads its configuration from:
//! 1. A TOML config file (default: config/phonendo.toml)
//! 2. Environment variables (override TOML values)
//! 3. CLI flags (override everything, applied in `main`)
//!
//! Environment variable prefix: PHONENDO_. The plain `PORT` and
//! `SERVICE_NAME` variables are honoured as well.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use phonendo_mesh::ReplayPolicy;
use phonendo_network::Multiaddr;
use phonendo_protocol::Role;

/// Top-level node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub verifier: VerifierConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which role this process plays and how it names itself in logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_role")]
    pub role: Role,
    /// Service label. Defaults to the role tag.
    #[serde(default)]
    pub service_name: Option<String>,
}

/// Network layer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address to listen on for P2P connections.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Peers dialled on startup, for networks without multicast.
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
    /// Whether mDNS local discovery is enabled.
    #[serde(default = "default_true")]
    pub mdns_enabled: bool,
    /// Idle connection timeout in seconds.
    #[serde(default = "default_idle_timeout")]
    pub idle_connection_timeout_secs: u64,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Manager pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Delay before a deferred replay pass is retried.
    #[serde(default = "default_replay_backoff")]
    pub replay_backoff_secs: u64,
    /// Retries after the first deferred pass. Unset retries forever.
    #[serde(default)]
    pub replay_max_retries: Option<u32>,
    /// Interval of the synthetic capture generator. Unset disables it.
    #[serde(default)]
    pub synthetic_load_interval_secs: Option<u64>,
}

/// Storage role configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// JSON file holding the record cache.
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,
}

/// Verifier role configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerifierConfig {
    /// PKCS#8 PEM signing key. Generated (and written here) when missing;
    /// kept in memory only when unset.
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "phonendo_mesh=debug,libp2p=info").
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to output JSON-formatted logs.
    #[serde(default)]
    pub json_format: bool,
}

// -- Defaults --

fn default_role() -> Role {
    Role::Manager
}
fn default_listen_addr() -> String {
    "/ip4/0.0.0.0/tcp/0".to_string()
}
fn default_true() -> bool {
    true
}
fn default_idle_timeout() -> u64 {
    300
}
fn default_request_timeout() -> u64 {
    phonendo_protocol::DEFAULT_REQUEST_TIMEOUT_SECS
}
fn default_replay_backoff() -> u64 {
    phonendo_protocol::DEFAULT_REPLAY_BACKOFF_SECS
}
fn default_cache_path() -> PathBuf {
    PathBuf::from("phonendo-cache.json")
}
fn default_log_level() -> String {
    "info".to_string()
}

// -- Trait impls --

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            role: default_role(),
            service_name: None,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            bootstrap_peers: Vec::new(),
            mdns_enabled: true,
            idle_connection_timeout_secs: default_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            replay_backoff_secs: default_replay_backoff(),
            replay_max_retries: None,
            synthetic_load_interval_secs: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_path: default_cache_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)?;
        let config: NodeConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from a TOML file, with environment variable overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, anyhow::Error> {
        let mut config = if let Some(path) = path {
            if path.exists() {
                Self::from_file(path)?
            } else {
                tracing::warn!(
                    path = %path.display(),
                    "Config file not found, using defaults"
                );
                Self::default()
            }
        } else {
            Self::default()
        };

        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Apply environment overrides, reading variables through `var`.
    fn apply_env_overrides<F>(&mut self, var: F) -> Result<(), anyhow::Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = var("PORT") {
            let port: u16 = val
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid PORT {val:?}: {e}"))?;
            self.network.listen_addr = format!("/ip4/127.0.0.1/tcp/{port}");
        }
        if let Some(val) = var("SERVICE_NAME") {
            self.node.service_name = Some(val);
        }
        if let Some(val) = var("PHONENDO_ROLE") {
            self.node.role = val.parse()?;
        }
        if let Some(val) = var("PHONENDO_SERVICE_NAME") {
            self.node.service_name = Some(val);
        }
        if let Some(val) = var("PHONENDO_LISTEN_ADDR") {
            self.network.listen_addr = val;
        }
        if let Some(val) = var("PHONENDO_BOOTSTRAP_PEERS") {
            self.network.bootstrap_peers = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(val) = var("PHONENDO_MDNS_ENABLED") {
            self.network.mdns_enabled = val == "true" || val == "1";
        }
        if let Some(val) = var("PHONENDO_REQUEST_TIMEOUT") {
            if let Ok(secs) = val.parse() {
                self.network.request_timeout_secs = secs;
            }
        }
        if let Some(val) = var("PHONENDO_REPLAY_BACKOFF") {
            if let Ok(secs) = val.parse() {
                self.pipeline.replay_backoff_secs = secs;
            }
        }
        if let Some(val) = var("PHONENDO_REPLAY_MAX_RETRIES") {
            if let Ok(n) = val.parse() {
                self.pipeline.replay_max_retries = Some(n);
            }
        }
        if let Some(val) = var("PHONENDO_SYNTHETIC_LOAD_INTERVAL") {
            if let Ok(secs) = val.parse() {
                self.pipeline.synthetic_load_interval_secs = Some(secs);
            }
        }
        if let Some(val) = var("PHONENDO_CACHE_PATH") {
            self.storage.cache_path = PathBuf::from(val);
        }
        if let Some(val) = var("PHONENDO_KEY_PATH") {
            self.verifier.key_path = Some(PathBuf::from(val));
        }
        if let Some(val) = var("PHONENDO_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Some(val) = var("PHONENDO_LOG_JSON") {
            self.logging.json_format = val == "true" || val == "1";
        }
        Ok(())
    }

    /// Label used in logs. Falls back to the role tag.
    pub fn service_name(&self) -> String {
        self.node
            .service_name
            .clone()
            .unwrap_or_else(|| self.node.role.tag())
    }

    pub fn listen_multiaddr(&self) -> Result<Multiaddr, anyhow::Error> {
        self.network
            .listen_addr
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid listen address {:?}: {}", self.network.listen_addr, e))
    }

    /// Bootstrap addresses, skipping (and logging) the unparsable ones.
    pub fn bootstrap_multiaddrs(&self) -> Vec<Multiaddr> {
        let mut addrs = Vec::new();
        for raw in &self.network.bootstrap_peers {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            match raw.parse::<Multiaddr>() {
                Ok(addr) => addrs.push(addr),
                Err(e) => {
                    tracing::warn!(
                        addr = %raw,
                        error = %e,
                        "Failed to parse bootstrap multiaddress, skipping"
                    );
                }
            }
        }
        addrs
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.network.request_timeout_secs)
    }

    pub fn replay_policy(&self) -> ReplayPolicy {
        ReplayPolicy {
            backoff: Duration::from_secs(self.pipeline.replay_backoff_secs),
            max_retries: self.pipeline.replay_max_retries,
        }
    }

    pub fn synthetic_load_interval(&self) -> Option<Duration> {
        self.pipeline
            .synthetic_load_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.node.role, Role::Manager);
        assert_eq!(config.service_name(), "phonendo_manager");
        assert!(config.network.mdns_enabled);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.replay_policy(), ReplayPolicy::default());
        assert_eq!(config.synthetic_load_interval(), None);
    }

    #[test]
    fn test_parse_toml_sections() {
        let config: NodeConfig = toml::from_str(
            r#"
            [node]
            role = "storage"
            service_name = "shelf"

            [network]
            listen_addr = "/ip4/127.0.0.1/tcp/4100"
            mdns_enabled = false

            [pipeline]
            replay_backoff_secs = 3
            replay_max_retries = 5

            [storage]
            cache_path = "/tmp/cache.json"
            "#,
        )
        .unwrap();
        assert_eq!(config.node.role, Role::Storage);
        assert_eq!(config.service_name(), "shelf");
        assert!(!config.network.mdns_enabled);
        assert_eq!(config.replay_policy().backoff, Duration::from_secs(3));
        assert_eq!(config.replay_policy().max_retries, Some(5));
        assert_eq!(config.storage.cache_path, PathBuf::from("/tmp/cache.json"));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_port_and_service_name_env() {
        let mut config = NodeConfig::default();
        config
            .apply_env_overrides(env(&[("PORT", "4242"), ("SERVICE_NAME", "phonendo_storage")]))
            .unwrap();
        assert_eq!(config.network.listen_addr, "/ip4/127.0.0.1/tcp/4242");
        assert_eq!(config.service_name(), "phonendo_storage");
        assert!(config.listen_multiaddr().is_ok());
    }

    #[test]
    fn test_prefixed_env_wins_over_plain() {
        let mut config = NodeConfig::default();
        config
            .apply_env_overrides(env(&[
                ("PORT", "4242"),
                ("PHONENDO_LISTEN_ADDR", "/ip4/0.0.0.0/tcp/5000"),
                ("PHONENDO_ROLE", "phonendo_verifier"),
                ("PHONENDO_BOOTSTRAP_PEERS", "/ip4/10.0.0.1/tcp/1, ,/ip4/10.0.0.2/tcp/2"),
            ]))
            .unwrap();
        assert_eq!(config.network.listen_addr, "/ip4/0.0.0.0/tcp/5000");
        assert_eq!(config.node.role, Role::Verifier);
        assert_eq!(config.bootstrap_multiaddrs().len(), 2);
    }

    #[test]
    fn test_invalid_port_is_an_error() {
        let mut config = NodeConfig::default();
        assert!(config.apply_env_overrides(env(&[("PORT", "http")])).is_err());
    }

    #[test]
    fn test_zero_load_interval_disables_generator() {
        let mut config = NodeConfig::default();
        config.pipeline.synthetic_load_interval_secs = Some(0);
        assert_eq!(config.synthetic_load_interval(), None);
    }
}
