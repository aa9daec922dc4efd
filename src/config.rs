//! Typed configuration.
//!
//! Layered sources: an optional TOML file, then `LEDGERSCAN_`-prefixed
//! environment variables (`LEDGERSCAN_RPC__URL=...`), then CLI flags
//! applied by the binary. The resulting `Settings` value is passed into
//! the scanner at construction; there is no process-wide config singleton.

use std::time::Duration;

use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::Deserialize;

use crate::types::Network;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub network: Network,
    pub rpc: RpcSettings,
    pub store: StoreSettings,
    pub scanner: ScannerSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            network: Network::Testnet,
            rpc: RpcSettings::default(),
            store: StoreSettings::default(),
            scanner: ScannerSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcSettings {
    pub url: String,
    pub user: String,
    pub password: String,
    pub timeout_secs: u64,
    /// Retries on top of the first attempt for transient failures.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8332".to_string(),
            user: String::new(),
            password: String::new(),
            timeout_secs: 30,
            max_retries: 3,
            backoff_base_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// RocksDB directory; `~` is expanded.
    pub path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: "ledgerscan_db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScannerSettings {
    /// Height scanning starts at on an empty ledger.
    pub start_height: i64,
    /// How many blocks are fetched ahead of processing.
    pub prefetch_depth: usize,
    /// Poll cadence once caught up with the node tip.
    pub poll_interval_secs: u64,
    /// Pause before retrying after transient RPC exhaustion.
    pub retry_pause_secs: u64,
    /// Rollback window: undo retention and the reorg depth bound.
    pub max_rollback_depth: u32,
    /// Attempts for a failing atomic commit before escalating.
    pub commit_retries: u32,
    pub progress_interval_secs: u64,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            start_height: 0,
            prefetch_depth: 3,
            poll_interval_secs: 10,
            retry_pause_secs: 5,
            max_rollback_depth: 100,
            commit_retries: 3,
            progress_interval_secs: 30,
        }
    }
}

impl ScannerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn retry_pause(&self) -> Duration {
        Duration::from_secs(self.retry_pause_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }
}

impl Settings {
    /// Load from an optional TOML file plus environment overrides.
    pub fn load(file: Option<&str>) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(ConfigFile::with_name(file.unwrap_or("ledgerscan")).required(file.is_some()))
            .add_source(Environment::with_prefix("LEDGERSCAN").separator("__"))
            .build()?
            .try_deserialize()
    }
}
