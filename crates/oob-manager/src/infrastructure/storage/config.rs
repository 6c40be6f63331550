//! TOML-based configuration for the fleet manager.
//!
//! # Example file
//!
//! ```toml
//! [manager]
//! log_level = "info"
//!
//! [gate]
//! max_concurrent = 1
//! max_queue_depth = 4
//!
//! [session]
//! cipher_suite_index = 0
//!
//! [[nodes]]
//! id = "rack1-n01"
//! address = "10.1.0.11"
//! username = "admin"
//! password = "admin"
//! vendor = "acme"
//! model = "r740"
//! ```
//!
//! # Serde default values
//!
//! Every field carries `#[serde(default = "some_fn")]`, and every section is
//! optional, so an empty file (or no file at all) yields
//! [`AppConfig::default`].  Older files keep working when new fields are
//! added.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use oob_core::protocol::DEFAULT_PORT;
use oob_core::{BoardType, Credentials, Node, NodeId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::discovery::DiscoveryConfig;
use crate::application::dispatcher::RetryPolicy;
use crate::application::gate::GateConfig;
use crate::infrastructure::boards::ipmi_board::ProfileKind;
use crate::infrastructure::network::connector::LanSettings;
use crate::infrastructure::network::session_manager::SessionSettings;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A node entry carries an address that is not an IP address.
    #[error("node {node}: invalid address {address:?}")]
    InvalidAddress { node: String, address: String },

    /// The values parse but cannot work together.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub gate: GateSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub nodes: Vec<NodeEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManagerConfig {
    /// `tracing` level used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Per-node concurrency limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateSection {
    /// Concurrently executing operations per node (K).
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Callers allowed to wait for a slot; further callers fail as busy.
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,
    /// Liveness probe period; `0` disables keepalive.
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
}

/// Session negotiation and UDP exchange timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    /// Port used for nodes that do not set their own.
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
    #[serde(default = "default_cipher_suite_index")]
    pub cipher_suite_index: usize,
    #[serde(default = "default_true")]
    pub encrypt: bool,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default = "default_retransmits")]
    pub retransmits: u32,
}

/// Retry budget for dispatched operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
}

/// First-contact probing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoverySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_reattempt_wait_ms")]
    pub reattempt_wait_ms: u64,
}

/// One managed node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeEntry {
    pub id: String,
    /// IP address of the management controller.
    pub address: String,
    /// Overrides `[session] udp_port` for this node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub username: String,
    pub password: String,
    pub vendor: String,
    pub model: String,
    /// Built-in capability profile for the board.
    #[serde(default)]
    pub profile: ProfileKind,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_max_concurrent() -> usize {
    1
}
fn default_max_queue_depth() -> usize {
    4
}
fn default_queue_timeout_ms() -> u64 {
    30_000
}
fn default_keepalive_interval_secs() -> u64 {
    60
}
fn default_udp_port() -> u16 {
    DEFAULT_PORT
}
fn default_cipher_suite_index() -> usize {
    0
}
fn default_response_timeout_ms() -> u64 {
    2_000
}
fn default_retransmits() -> u32 {
    2
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1_000
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_max_retry_delay_ms() -> u64 {
    30_000
}
fn default_reattempt_wait_ms() -> u64 {
    5_000
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for GateSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_queue_depth: default_max_queue_depth(),
            queue_timeout_ms: default_queue_timeout_ms(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
        }
    }
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            udp_port: default_udp_port(),
            cipher_suite_index: default_cipher_suite_index(),
            encrypt: default_true(),
            response_timeout_ms: default_response_timeout_ms(),
            retransmits: default_retransmits(),
        }
    }
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
        }
    }
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            reattempt_wait_ms: default_reattempt_wait_ms(),
        }
    }
}

// ── Conversions into runtime settings ─────────────────────────────────────────

impl AppConfig {
    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            max_concurrent: self.gate.max_concurrent,
            max_queue_depth: self.gate.max_queue_depth,
            queue_timeout: Duration::from_millis(self.gate.queue_timeout_ms),
        }
    }

    /// `None` when keepalive is disabled.
    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.gate.keepalive_interval_secs > 0)
            .then(|| Duration::from_secs(self.gate.keepalive_interval_secs))
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            cipher_suite_index: self.session.cipher_suite_index,
            encrypt: self.session.encrypt,
        }
    }

    pub fn lan_settings(&self) -> LanSettings {
        LanSettings {
            response_timeout: Duration::from_millis(self.session.response_timeout_ms),
            retransmits: self.session.retransmits,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.dispatch.max_attempts,
            initial_delay: Duration::from_millis(self.dispatch.retry_delay_ms),
            backoff_factor: self.dispatch.backoff_factor,
            max_delay: Duration::from_millis(self.dispatch.max_retry_delay_ms),
        }
    }

    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            max_attempts: self.discovery.max_attempts,
            reattempt_wait: Duration::from_millis(self.discovery.reattempt_wait_ms),
        }
    }

    /// Rejects values that parse but cannot work.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] for a zero concurrency limit, a backoff factor
    /// below 1 or duplicate node ids; [`ConfigError::InvalidAddress`] for a
    /// node address that is not an IP address.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gate.max_concurrent == 0 {
            return Err(ConfigError::Invalid("gate.max_concurrent must be at least 1".into()));
        }
        let factor = self.dispatch.backoff_factor;
        if factor.is_nan() || factor < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "dispatch.backoff_factor must be at least 1.0, got {factor}"
            )));
        }
        let mut seen = HashSet::new();
        for entry in &self.nodes {
            if !seen.insert(entry.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate node id {:?}", entry.id)));
            }
            entry.socket_addr(self.session.udp_port)?;
        }
        Ok(())
    }

    /// Loads the configuration at `path`, returning the defaults when the
    /// file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] for file-system errors other than "not
    /// found", [`ConfigError::Parse`] if the TOML is malformed, and the
    /// [`AppConfig::validate`] errors.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str::<AppConfig>(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration to `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] for file-system failures or
    /// [`ConfigError::Serialize`] if serialization fails.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl NodeEntry {
    pub fn board(&self) -> BoardType {
        BoardType::new(self.vendor.clone(), self.model.clone())
    }

    /// Controller address, using `default_port` unless the entry sets one.
    pub fn socket_addr(&self, default_port: u16) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self.address.parse().map_err(|_| ConfigError::InvalidAddress {
            node: self.id.clone(),
            address: self.address.clone(),
        })?;
        Ok(SocketAddr::new(ip, self.port.unwrap_or(default_port)))
    }

    pub fn to_node(&self, default_port: u16) -> Result<Node, ConfigError> {
        Ok(Node::new(
            NodeId::new(self.id.clone()),
            self.socket_addr(default_port)?,
            Credentials::new(self.username.clone(), self.password.clone()),
            self.board(),
        ))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
