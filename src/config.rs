// src/config.rs

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::keys::DEFAULT_KDF_MEMORY_KIB;
use crate::types::Peer;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to write config {path}: {source}")]
    Write { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to encode config: {0}")]
    Encode(#[from] toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_addr: String,
    pub bootstrap: bool,
    pub seed_addr: Option<String>,
    pub key_store_dir: PathBuf,
    pub block_store_dir: PathBuf,
    pub chain: String,
    pub auth_pass: String,
    pub balance: u64,
    pub discovery_interval_ms: u64,
    pub proposal_interval_ms: u64,
    pub tx_relay_capacity: usize,
    pub block_relay_capacity: usize,
    pub event_capacity: usize,
    pub seen_capacity: usize,
    /// Consecutive failed exchanges before a peer is dropped; 0 keeps peers forever.
    pub max_peer_failures: u32,
    pub request_timeout_ms: u64,
    pub sync_retries: u32,
    pub sync_batch: usize,
    /// Argon2id memory cost, in KiB, for newly written key files.
    pub key_kdf_memory_kib: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_addr: "127.0.0.1:9000".to_string(),
            bootstrap: false,
            seed_addr: None,
            key_store_dir: PathBuf::from("data/keys"),
            block_store_dir: PathBuf::from("data/blocks"),
            chain: "authority-chain".to_string(),
            auth_pass: String::new(),
            balance: 1_000_000,
            discovery_interval_ms: 10_000,
            proposal_interval_ms: 10_000,
            tx_relay_capacity: 100,
            block_relay_capacity: 10,
            event_capacity: 100,
            seen_capacity: 100_000,
            max_peer_failures: 3,
            request_timeout_ms: 3_000,
            sync_retries: 5,
            sync_batch: 256,
            key_kdf_memory_kib: DEFAULT_KDF_MEMORY_KIB,
        }
    }
}

impl NodeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|source| ConfigError::Write { path: parent.to_path_buf(), source })?;
        }
        let encoded = toml::to_string_pretty(self)?;
        fs::write(path, encoded).map_err(|source| ConfigError::Write { path: path.to_path_buf(), source })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_addr.is_empty() {
            return Err(ConfigError::Invalid("node_addr must be set".into()));
        }
        if !self.bootstrap && self.seed_addr.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::Invalid("a non-bootstrap node needs seed_addr".into()));
        }
        if self.chain.is_empty() {
            return Err(ConfigError::Invalid("chain must be set".into()));
        }
        let nonzero = [
            ("discovery_interval_ms", self.discovery_interval_ms as usize),
            ("proposal_interval_ms", self.proposal_interval_ms as usize),
            ("tx_relay_capacity", self.tx_relay_capacity),
            ("block_relay_capacity", self.block_relay_capacity),
            ("event_capacity", self.event_capacity),
            ("seen_capacity", self.seen_capacity),
            ("request_timeout_ms", self.request_timeout_ms as usize),
            ("sync_batch", self.sync_batch),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }
        if self.key_kdf_memory_kib < 8 {
            return Err(ConfigError::Invalid("key_kdf_memory_kib must be at least 8".into()));
        }
        Ok(())
    }

    pub fn local_peer(&self) -> Peer {
        Peer::new(self.node_addr.clone())
    }

    pub fn seed_peer(&self) -> Option<Peer> {
        self.seed_addr.as_deref().filter(|s| !s.is_empty()).map(Peer::new)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn proposal_interval(&self) -> Duration {
        Duration::from_millis(self.proposal_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
