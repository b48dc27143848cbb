//! Application configuration with layered loading.
//!
//! Later layers override earlier ones:
//!
//! 1. Compiled defaults (`Default` impls below)
//! 2. TOML file named by `PROVENANCE_CONFIG` (default `provenance.toml`, optional)
//! 3. `PROVENANCE__<SECTION>__<FIELD>` environment variables
//!
//! ```toml
//! [server]
//! bind_address = "0.0.0.0"
//! port = 8050
//!
//! [source]
//! kind = "rpc"
//! rpc_url = "http://localhost:7545"
//! contract_address = "0x480608b80112000Fd2854EfDb37Bd2e4CbE29F92"
//!
//! [schedule]
//! sync_interval_seconds = 300
//! price_interval_seconds = 3600
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use alloy_primitives::Address;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::indexer::DEFAULT_MAX_DEFERRED_CYCLES;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Directory holding one JSON file per block.
    pub data_dir: PathBuf,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/ledger"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// `SQLite` database file.
    pub database_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/provenance.sqlite"),
        }
    }
}

/// Which [`ChainEventSource`](crate::source::ChainEventSource) the binary reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// JSON snapshot file.
    File,
    /// Contract on a node reachable over JSON-RPC.
    Rpc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    /// JSON snapshot of the chain event log (`kind = "file"`).
    pub snapshot_path: PathBuf,
    /// Node endpoint (`kind = "rpc"`).
    pub rpc_url: String,
    /// Hex address of the provenance contract (`kind = "rpc"`).
    pub contract_address: String,
    pub request_timeout_seconds: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::File,
            snapshot_path: PathBuf::from("data/chain_events.json"),
            rpc_url: "http://localhost:7545".to_string(),
            contract_address: String::new(),
            request_timeout_seconds: 30,
        }
    }
}

impl SourceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self.kind {
            SourceKind::File if self.snapshot_path.as_os_str().is_empty() => Err(
                ConfigError::Message("source.snapshot_path must not be empty".into()),
            ),
            SourceKind::File => Ok(()),
            SourceKind::Rpc => {
                if self.rpc_url.is_empty() {
                    return Err(ConfigError::Message("source.rpc_url must not be empty".into()));
                }
                if self.request_timeout_seconds == 0 {
                    return Err(ConfigError::Message(
                        "source.request_timeout_seconds must be greater than zero".into(),
                    ));
                }
                self.contract_address.parse::<Address>().map(|_| ()).map_err(|e| {
                    ConfigError::Message(format!(
                        "invalid source.contract_address {:?}: {e}",
                        self.contract_address
                    ))
                })
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub sync_interval_seconds: u64,
    pub price_interval_seconds: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            sync_interval_seconds: 300,
            price_interval_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Consecutive deferrals before a missing parent is reported as an error.
    pub max_deferred_cycles: u32,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            max_deferred_cycles: DEFAULT_MAX_DEFERRED_CYCLES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `pretty` or `json`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: "pretty".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub ledger: LedgerConfig,
    pub store: StoreConfig,
    pub source: SourceConfig,
    pub schedule: ScheduleConfig,
    pub indexer: IndexerConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load defaults, then the config file, then environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path =
            std::env::var("PROVENANCE_CONFIG").unwrap_or_else(|_| "provenance.toml".to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let cfg: Self = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("PROVENANCE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schedule.sync_interval_seconds == 0 || self.schedule.price_interval_seconds == 0 {
            return Err(ConfigError::Message(
                "schedule intervals must be greater than zero".into(),
            ));
        }
        if self.indexer.max_deferred_cycles == 0 {
            return Err(ConfigError::Message(
                "indexer.max_deferred_cycles must be greater than zero".into(),
            ));
        }
        for (name, path) in [
            ("ledger.data_dir", &self.ledger.data_dir),
            ("store.database_path", &self.store.database_path),
        ] {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::Message(format!("{name} must not be empty")));
            }
        }
        self.source.validate()?;
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(ConfigError::Message(format!(
                "unknown logging.format {:?}",
                self.logging.format
            )));
        }
        self.socket_addr().map(|_| ())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.server.bind_address, self.server.port)
            .parse()
            .map_err(|e| ConfigError::Message(format!("invalid server address: {e}")))
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.schedule.sync_interval_seconds)
    }

    pub fn price_interval(&self) -> Duration {
        Duration::from_secs(self.schedule.price_interval_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let cfg = AppConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.sync_interval(), Duration::from_secs(300));
        assert_eq!(cfg.price_interval(), Duration::from_secs(3600));
        assert_eq!(cfg.indexer.max_deferred_cycles, 3);
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[server]\nport = 8050\n\n[schedule]\nsync_interval_seconds = 60\n\n[logging]\nformat = \"json\""
        )
        .unwrap();
        let cfg = AppConfig::load_from(file.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.server.port, 8050);
        assert_eq!(cfg.server.bind_address, "127.0.0.1");
        assert_eq!(cfg.sync_interval(), Duration::from_secs(60));
        assert_eq!(cfg.price_interval(), Duration::from_secs(3600));
        assert_eq!(cfg.logging.format, "json");
    }

    #[test]
    fn zero_interval_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.schedule.price_interval_seconds = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rpc_source_needs_a_contract_address() {
        let mut cfg = AppConfig::default();
        cfg.source.kind = SourceKind::Rpc;
        assert!(cfg.validate().is_err());

        cfg.source.contract_address = "0x480608b80112000Fd2854EfDb37Bd2e4CbE29F92".into();
        cfg.validate().unwrap();
    }

    #[test]
    fn rpc_source_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[source]\nkind = \"rpc\"\nrpc_url = \"http://node:8545\"\ncontract_address = \"0x480608b80112000Fd2854EfDb37Bd2e4CbE29F92\""
        )
        .unwrap();
        let cfg = AppConfig::load_from(file.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.source.kind, SourceKind::Rpc);
        assert_eq!(cfg.source.rpc_url, "http://node:8545");
        assert_eq!(cfg.source.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn bad_address_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.server.bind_address = "not an ip".into();
        assert!(cfg.validate().is_err());
    }
}
