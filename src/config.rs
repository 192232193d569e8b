//! Node configuration
//!
//! Loaded from a TOML file, then overridden by environment variables:
//!
//! - `MPC_NODE_ID` - partner id of this node
//! - `MPC_NODE_BIND` - HTTP bind address
//! - `MPC_LOG_LEVEL` - trace, debug, info, warn or error
//! - `MPC_LOG_JSON` - "1" or "true" for JSON logs
//! - `MPC_KEY_PASSWORD` - keystore password (never read from the file)

use crate::types::{Party, PartnerId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Read(String, String),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("missing peer address for partner {0}")]
    MissingPeer(PartnerId),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    pub id: PartnerId,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Directory holding the keystore and the used-for registry
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Origins allowed to call the admin routes from a browser
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartySection {
    pub t: usize,
    pub max: usize,
    pub partners: Vec<PartnerId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpcSection {
    /// Deadline for a whole MPC run
    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: u64,
    /// Deadline for one round data request
    #[serde(default = "default_round_timeout")]
    pub round_timeout_secs: u64,
    /// Pause before the single retry of a failed round data request
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

impl Default for MpcSection {
    fn default() -> Self {
        Self {
            run_timeout_secs: default_run_timeout(),
            round_timeout_secs: default_round_timeout(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationSection {
    #[serde(default = "default_confirm_timeout")]
    pub timeout_secs: u64,
    /// Signers refuse requests computed longer ago than this
    #[serde(default = "default_freshness")]
    pub freshness_secs: u64,
    /// Failed partials tolerated before a request is declared failed
    #[serde(default = "default_max_failures")]
    pub max_failures: usize,
}

impl Default for ConfirmationSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_confirm_timeout(),
            freshness_secs: default_freshness(),
            max_failures: default_max_failures(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    /// TTL of DistKeys and nonce batches that are not the active ones
    #[serde(default = "default_key_ttl")]
    pub key_ttl_secs: u64,
    /// TTL of request records and MPC registrations
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            key_ttl_secs: default_key_ttl(),
            session_ttl_secs: default_session_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub party: PartySection,
    /// Partner id -> base URL
    #[serde(default)]
    pub peers: BTreeMap<String, String>,
    #[serde(default)]
    pub mpc: MpcSection,
    #[serde(default)]
    pub confirmation: ConfirmationSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub logging: LoggingSection,
    /// Keystore password, environment only
    #[serde(skip)]
    pub key_password: Option<String>,
}

fn default_bind() -> String {
    "0.0.0.0:9001".to_string()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_run_timeout() -> u64 {
    60
}
fn default_round_timeout() -> u64 {
    10
}
fn default_retry_backoff() -> u64 {
    500
}
fn default_confirm_timeout() -> u64 {
    30
}
fn default_freshness() -> u64 {
    300
}
fn default_max_failures() -> usize {
    3
}
fn default_key_ttl() -> u64 {
    600
}
fn default_session_ttl() -> u64 {
    300
}
fn default_sweep_interval() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".to_string()
}

impl NodeConfig {
    /// Minimal in-process configuration, used by tests and `simulate`
    pub fn local(id: PartnerId, t: usize, partners: Vec<PartnerId>) -> Self {
        Self {
            node: NodeSection {
                id,
                bind: default_bind(),
                data_dir: default_data_dir(),
                cors_origins: Vec::new(),
            },
            party: PartySection {
                t,
                max: partners.len().max(t),
                partners,
            },
            peers: BTreeMap::new(),
            mpc: MpcSection::default(),
            confirmation: ConfirmationSection::default(),
            cache: CacheSection::default(),
            logging: LoggingSection::default(),
            key_password: None,
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Read the file, apply environment overrides and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.display().to_string(), e.to_string()))?;
        let mut config = Self::from_toml_str(&contents)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(id) = env::var("MPC_NODE_ID") {
            self.node.id = id.parse().map_err(|_| {
                ConfigError::InvalidValue("MPC_NODE_ID".into(), format!("not a partner id: {}", id))
            })?;
        }
        if let Ok(bind) = env::var("MPC_NODE_BIND") {
            self.node.bind = bind;
        }
        if let Ok(level) = env::var("MPC_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(json) = env::var("MPC_LOG_JSON") {
            self.logging.json = matches!(json.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Ok(password) = env::var("MPC_KEY_PASSWORD") {
            self.key_password = Some(password);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.party()?;
        let peers = self.peer_urls()?;
        if !peers.is_empty() {
            for id in &self.party.partners {
                if !peers.contains_key(id) {
                    return Err(ConfigError::MissingPeer(*id));
                }
            }
        }
        for (name, value) in [
            ("mpc.run_timeout_secs", self.mpc.run_timeout_secs),
            ("mpc.round_timeout_secs", self.mpc.round_timeout_secs),
            ("confirmation.timeout_secs", self.confirmation.timeout_secs),
            ("cache.sweep_interval_secs", self.cache.sweep_interval_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue(name.into(), "must be positive".into()));
            }
        }
        Ok(())
    }

    pub fn party(&self) -> Result<Party, ConfigError> {
        Party::new(
            self.node.id,
            self.party.t,
            self.party.max,
            self.party.partners.clone(),
        )
        .map_err(|e| ConfigError::InvalidValue("party".into(), e.to_string()))
    }

    /// Peer table keyed by partner id
    pub fn peer_urls(&self) -> Result<BTreeMap<PartnerId, String>, ConfigError> {
        self.peers
            .iter()
            .map(|(id, url)| {
                let id: PartnerId = id.parse().map_err(|_| {
                    let key = format!("peers.{}", id);
                    ConfigError::InvalidValue(key, "key is not a partner id".into())
                })?;
                Ok((id, url.trim_end_matches('/').to_string()))
            })
            .collect()
    }

    pub fn keystore_path(&self) -> PathBuf {
        self.node.data_dir.join(format!("node{}.key.enc", self.node.id))
    }

    pub fn usage_path(&self) -> PathBuf {
        self.node.data_dir.join("used-for.json")
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.mpc.run_timeout_secs)
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_secs(self.mpc.round_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.mpc.retry_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[node]
id = 2
bind = "127.0.0.1:9002"
data_dir = "/tmp/mpc-node-2"

[party]
t = 2
max = 5
partners = [1, 2, 3]

[peers]
1 = "http://127.0.0.1:9001"
2 = "http://127.0.0.1:9002/"
3 = "http://127.0.0.1:9003"

[mpc]
round_timeout_secs = 5

[logging]
level = "debug"
"#;

    #[test]
    fn test_parse_sample() {
        let config = NodeConfig::from_toml_str(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.node.id, 2);
        assert_eq!(config.mpc.round_timeout_secs, 5);
        assert_eq!(config.mpc.run_timeout_secs, 60);
        assert_eq!(config.confirmation.max_failures, 3);
        assert_eq!(config.logging.level, "debug");

        let peers = config.peer_urls().unwrap();
        assert_eq!(peers[&2], "http://127.0.0.1:9002");
        assert_eq!(config.party().unwrap().t, 2);
    }

    #[test]
    fn test_missing_peer_rejected() {
        let mut config = NodeConfig::from_toml_str(SAMPLE).unwrap();
        config.peers.remove("3");
        assert!(matches!(config.validate(), Err(ConfigError::MissingPeer(3))));
    }

    #[test]
    fn test_threshold_above_partners_rejected() {
        let mut config = NodeConfig::from_toml_str(SAMPLE).unwrap();
        config.party.t = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = NodeConfig::local(1, 1, vec![1]);
        config.mpc.run_timeout_secs = 0;
        assert!(config.validate().is_err());
    }
}
