//! Configuration for the stream indexer

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Indexer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Service name
    pub service_name: String,

    /// Ledger storage configuration
    pub ledger: stream_ledger::Config,

    /// Replay worker configuration
    pub worker: WorkerConfig,

    /// Stream contract address per blockchain
    pub stream_contracts: BTreeMap<String, String>,

    /// Read API configuration
    pub api: ApiConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            service_name: "stream-indexer".to_string(),
            ledger: stream_ledger::Config::default(),
            worker: WorkerConfig::default(),
            stream_contracts: BTreeMap::new(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Replay worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Tasks drained per poll
    pub batch_size: usize,

    /// Queue poll interval (ms)
    pub poll_interval_ms: u64,

    /// Stale-account reconciliation interval (seconds, 0 disables)
    pub reconcile_interval_secs: u64,

    /// Mailbox capacity
    pub mailbox_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval_ms: 1_000,
            reconcile_interval_secs: 0,
            mailbox_capacity: 64,
        }
    }
}

/// Read API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Page size when the caller gives no limit
    pub default_page_size: usize,

    /// Upper bound on any requested page size
    pub max_page_size: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            default_page_size: 100,
            max_page_size: 1_000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Emit JSON log lines instead of human-readable text
    pub json: bool,
}

impl IndexerConfig {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: IndexerConfig = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = IndexerConfig::default();

        if let Ok(data_dir) = std::env::var("STREAM_INDEXER_DATA_DIR") {
            config.ledger.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(size) = std::env::var("STREAM_INDEXER_BATCH_SIZE") {
            config.worker.batch_size = parse_env("STREAM_INDEXER_BATCH_SIZE", &size)?;
        }

        if let Ok(ms) = std::env::var("STREAM_INDEXER_POLL_INTERVAL_MS") {
            config.worker.poll_interval_ms = parse_env("STREAM_INDEXER_POLL_INTERVAL_MS", &ms)?;
        }

        if let Ok(secs) = std::env::var("STREAM_INDEXER_RECONCILE_INTERVAL_SECS") {
            config.worker.reconcile_interval_secs =
                parse_env("STREAM_INDEXER_RECONCILE_INTERVAL_SECS", &secs)?;
        }

        // Format: "polygon=0xabc,gnosis=0xdef"
        if let Ok(contracts) = std::env::var("STREAM_INDEXER_CONTRACTS") {
            config.stream_contracts = parse_contracts(&contracts)?;
        }

        if let Ok(json) = std::env::var("STREAM_INDEXER_LOG_JSON") {
            config.logging.json = parse_env("STREAM_INDEXER_LOG_JSON", &json)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the worker cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.worker.batch_size == 0 {
            return Err(crate::Error::Config("worker.batch_size must be > 0".to_string()));
        }
        if self.worker.poll_interval_ms == 0 {
            return Err(crate::Error::Config(
                "worker.poll_interval_ms must be > 0".to_string(),
            ));
        }
        if self.api.default_page_size == 0 || self.api.max_page_size == 0 {
            return Err(crate::Error::Config("api page sizes must be > 0".to_string()));
        }
        Ok(())
    }
}

fn parse_env<T>(name: &str, value: &str) -> crate::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| crate::Error::Config(format!("Invalid {}: {}", name, e)))
}

fn parse_contracts(value: &str) -> crate::Result<BTreeMap<String, String>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((chain, address)) if !chain.is_empty() && !address.is_empty() => {
                Ok((chain.to_string(), address.to_string()))
            }
            _ => Err(crate::Error::Config(format!(
                "Invalid STREAM_INDEXER_CONTRACTS entry '{}'",
                entry
            ))),
        })
        .collect()
}
