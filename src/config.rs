//! Node configuration.
//!
//! A single TOML file with one table per subsystem. Every field has a
//! default, so a partial file (or an empty one) loads. On first run, if the
//! file does not exist, a default config with a freshly generated swarm key
//! is written next to the data directory.

use crate::error::ConfigError;
use crate::gossip::GossipConfig;
use crate::network::connection_manager::ConnectionLimits;
use crate::network::pnet::PreSharedKey;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Platform data directory for swarmd
pub fn get_data_dir() -> PathBuf {
    if cfg!(windows) {
        // Windows: %APPDATA%\swarmd
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("swarmd")
    } else {
        // Linux/Mac: ~/.swarmd
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".swarmd")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub pubsub: PubSubConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub name: String,
    /// Base64 protobuf-encoded Ed25519 private key. When absent the key is
    /// loaded from (or generated into) `<data_dir>/identity.key`.
    pub private_key: Option<String>,
    /// Empty means the platform default.
    pub data_dir: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "swarmd".to_string(),
            private_key: None,
            data_dir: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub listen_address: String,
    pub bootstrap_peers: Vec<String>,
    /// Swarm key in key-file format (`/key/swarm/psk/1.0.0/` ...).
    pub swarm_key: String,
    /// Read the swarm key from this file instead of `swarm_key`.
    pub swarm_key_file: Option<String>,
    pub handshake_timeout_secs: u64,
    pub max_connections: usize,
    pub max_inbound: usize,
    pub max_outbound: usize,
    /// Retry interval for bootstrap peers that are not connected.
    pub reconnect_interval_secs: u64,
    /// How long to wait for a peer to supply a requested block.
    pub fetch_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let limits = ConnectionLimits::default();
        Self {
            listen_address: "0.0.0.0:4002".to_string(),
            bootstrap_peers: vec![],
            swarm_key: String::new(),
            swarm_key_file: None,
            handshake_timeout_secs: 10,
            max_connections: limits.max_connections,
            max_inbound: limits.max_inbound,
            max_outbound: limits.max_outbound,
            reconnect_interval_secs: 5,
            fetch_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    pub emit_self: bool,
    pub allow_publish_to_zero_peers: bool,
    pub flood_publish: bool,
    pub max_inbound_streams: usize,
    pub max_outbound_streams: usize,
    pub mesh_n: usize,
    pub mesh_n_low: usize,
    pub mesh_n_high: usize,
    pub gossip_lazy: usize,
    pub heartbeat_interval_ms: u64,
    pub announce_interval_secs: u64,
    pub seen_ttl_secs: u64,
    pub seen_capacity: usize,
    pub message_cache_size: usize,
    pub outbound_queue_size: usize,
    pub max_message_size: usize,
    /// Publishes accepted per peer per second.
    pub publish_rate_limit: u32,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        let gossip = GossipConfig::default();
        Self {
            emit_self: gossip.emit_self,
            allow_publish_to_zero_peers: gossip.allow_publish_to_zero_peers,
            flood_publish: gossip.flood_publish,
            max_inbound_streams: gossip.max_inbound_streams,
            max_outbound_streams: gossip.max_outbound_streams,
            mesh_n: gossip.mesh_n,
            mesh_n_low: gossip.mesh_n_low,
            mesh_n_high: gossip.mesh_n_high,
            gossip_lazy: gossip.gossip_lazy,
            heartbeat_interval_ms: gossip.heartbeat_interval.as_millis() as u64,
            announce_interval_secs: gossip.announce_interval.as_secs(),
            seen_ttl_secs: gossip.seen_ttl.as_secs(),
            seen_capacity: gossip.seen_capacity,
            message_cache_size: gossip.message_cache_size,
            outbound_queue_size: gossip.outbound_queue_size,
            max_message_size: gossip.max_message_size,
            publish_rate_limit: gossip.publish_rate_limit,
        }
    }
}

impl From<&PubSubConfig> for GossipConfig {
    fn from(config: &PubSubConfig) -> Self {
        Self {
            emit_self: config.emit_self,
            allow_publish_to_zero_peers: config.allow_publish_to_zero_peers,
            flood_publish: config.flood_publish,
            max_inbound_streams: config.max_inbound_streams,
            max_outbound_streams: config.max_outbound_streams,
            mesh_n: config.mesh_n,
            mesh_n_low: config.mesh_n_low,
            mesh_n_high: config.mesh_n_high,
            gossip_lazy: config.gossip_lazy,
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            announce_interval: Duration::from_secs(config.announce_interval_secs),
            seen_ttl: Duration::from_secs(config.seen_ttl_secs),
            seen_capacity: config.seen_capacity,
            message_cache_size: config.message_cache_size,
            outbound_queue_size: config.outbound_queue_size,
            max_message_size: config.max_message_size,
            publish_rate_limit: config.publish_rate_limit,
            ..GossipConfig::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// "sled" or "memory"
    pub backend: String,
    pub chunk_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "sled".to_string(),
            chunk_size: crate::content::DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "pretty" or "json"
    pub format: String,
    /// "stdout" or "file"
    pub output: String,
    pub file_path: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            output: "stdout".to_string(),
            file_path: "./logs/swarmd.log".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub file_topic: String,
    pub dag_topic: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10,
            file_topic: "ipfsfilemsg".to_string(),
            dag_topic: "ipfsdagmsg".to_string(),
        }
    }
}

impl Config {
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, or write a fresh default config there (with a newly
    /// generated swarm key) and return it.
    pub fn load_or_create(path: &str) -> Result<Self, ConfigError> {
        if Path::new(path).exists() {
            return Self::load_from_file(path);
        }
        let config = Self::generate();
        config.save_to_file(path)?;
        tracing::info!("📝 Wrote default config to {}", path);
        Ok(config)
    }

    /// Defaults plus a new swarm key. Every node of one private network must
    /// share that key, so copy it before starting the other nodes.
    pub fn generate() -> Self {
        let mut config = Self::default();
        config.network.swarm_key = PreSharedKey::generate().to_swarm_key_file().to_string();
        config
    }

    pub fn save_to_file(&self, path: &str) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                    path: parent.display().to_string(),
                    source,
                })?;
            }
        }
        fs::write(path, contents).map_err(|source| ConfigError::Write {
            path: path.to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: &str| ConfigError::Invalid {
            field,
            reason: reason.to_string(),
        };
        match self.storage.backend.as_str() {
            "sled" | "memory" => {}
            _ => return Err(invalid("storage.backend", "expected \"sled\" or \"memory\"")),
        }
        if self.storage.chunk_size == 0 {
            return Err(invalid("storage.chunk_size", "must be positive"));
        }
        if self.network.handshake_timeout_secs == 0 {
            return Err(invalid("network.handshake_timeout_secs", "must be positive"));
        }
        if self.network.max_inbound > self.network.max_connections
            || self.network.max_outbound > self.network.max_connections
        {
            return Err(invalid(
                "network.max_connections",
                "must be at least max_inbound and max_outbound",
            ));
        }
        let p = &self.pubsub;
        if !(p.mesh_n_low <= p.mesh_n && p.mesh_n <= p.mesh_n_high) {
            return Err(invalid(
                "pubsub.mesh_n",
                "expected mesh_n_low <= mesh_n <= mesh_n_high",
            ));
        }
        if p.heartbeat_interval_ms == 0 {
            return Err(invalid("pubsub.heartbeat_interval_ms", "must be positive"));
        }
        if p.outbound_queue_size == 0 {
            return Err(invalid("pubsub.outbound_queue_size", "must be positive"));
        }
        if self.orchestrator.interval_secs == 0 {
            return Err(invalid("orchestrator.interval_secs", "must be positive"));
        }
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        if self.node.data_dir.is_empty() {
            get_data_dir()
        } else {
            PathBuf::from(&self.node.data_dir)
        }
    }

    /// The private network key, from `swarm_key_file` if set, else inline.
    pub fn psk(&self) -> Result<PreSharedKey, ConfigError> {
        let text = match &self.network.swarm_key_file {
            Some(path) => fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?,
            None => self.network.swarm_key.clone(),
        };
        if text.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "network.swarm_key",
                reason: "no swarm key configured (run with --generate-swarm-key)".to_string(),
            });
        }
        PreSharedKey::parse(&text).map_err(|e| ConfigError::Invalid {
            field: "network.swarm_key",
            reason: e.to_string(),
        })
    }

    pub fn connection_limits(&self) -> ConnectionLimits {
        ConnectionLimits {
            max_connections: self.network.max_connections,
            max_inbound: self.network.max_inbound,
            max_outbound: self.network.max_outbound,
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.network.handshake_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.network.fetch_timeout_secs)
    }

    pub fn gossip_config(&self) -> GossipConfig {
        GossipConfig::from(&self.pubsub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.network.listen_address, "0.0.0.0:4002");
        assert!(!config.pubsub.emit_self);
        assert!(config.pubsub.allow_publish_to_zero_peers);
        assert_eq!(config.pubsub.max_inbound_streams, 64);
        assert_eq!(config.pubsub.max_outbound_streams, 128);
        assert_eq!(config.orchestrator.interval_secs, 10);
        assert_eq!(config.orchestrator.file_topic, "ipfsfilemsg");
        assert_eq!(config.orchestrator.dag_topic, "ipfsdagmsg");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [network]
            listen_address = "127.0.0.1:9000"

            [pubsub]
            emit_self = true
            "#,
        )
        .unwrap();
        assert_eq!(config.network.listen_address, "127.0.0.1:9000");
        assert_eq!(config.network.handshake_timeout_secs, 10);
        assert!(config.pubsub.emit_self);
        assert_eq!(config.pubsub.mesh_n, 6);
        assert_eq!(config.storage.backend, "sled");
    }

    #[test]
    fn test_load_or_create_writes_usable_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("swarmd.toml");
        let path = path.to_str().unwrap();

        let created = Config::load_or_create(path).unwrap();
        let psk = created.psk().unwrap();

        let loaded = Config::load_or_create(path).unwrap();
        assert_eq!(loaded.psk().unwrap().fingerprint(), psk.fingerprint());
        assert_eq!(loaded.network.listen_address, created.network.listen_address);
    }

    #[test]
    fn test_missing_swarm_key() {
        let config = Config::default();
        assert!(matches!(
            config.psk(),
            Err(ConfigError::Invalid { field: "network.swarm_key", .. })
        ));
    }

    #[test]
    fn test_swarm_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("swarm.key");
        let psk = PreSharedKey::generate();
        fs::write(&key_path, psk.to_swarm_key_file().as_bytes()).unwrap();

        let mut config = Config::default();
        config.network.swarm_key_file = Some(key_path.to_str().unwrap().to_string());
        assert_eq!(config.psk().unwrap().fingerprint(), psk.fingerprint());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.storage.backend = "rocksdb".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "storage.backend", .. })
        ));

        let mut config = Config::default();
        config.pubsub.mesh_n_low = 10;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.network.max_inbound = config.network.max_connections + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_gossip_config_mapping() {
        let mut config = Config::default();
        config.pubsub.heartbeat_interval_ms = 250;
        config.pubsub.flood_publish = false;
        let gossip = config.gossip_config();
        assert_eq!(gossip.heartbeat_interval, Duration::from_millis(250));
        assert!(!gossip.flood_publish);
        assert_eq!(gossip.max_inbound_streams, 64);
    }
}
