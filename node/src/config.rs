//! Node configuration with TOML file support.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use saga_stream::ConsumerConfig;
use saga_types::PartyKey;

use crate::NodeError;

/// Configuration for a saga node.
///
/// Can be loaded from a TOML file via [`SagaConfig::from_toml_file`] or
/// built programmatically (e.g. for tests).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SagaConfig {
    /// Data directory for the LMDB environment.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// LMDB map size in bytes.
    #[serde(default = "default_map_size")]
    pub map_size: usize,

    /// Log format: "human" or "json".
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Log level filter: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Whether to expose Prometheus metrics.
    #[serde(default)]
    pub enable_metrics: bool,

    #[serde(default)]
    pub reapers: ReaperConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub sweeper: SweeperConfig,

    #[serde(default)]
    pub search: SearchConfig,
}

/// Worker pool size per reaper kind.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub fragment_workers: usize,
    pub chaincode_workers: usize,
    pub index_workers: usize,
    pub error_workers: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            fragment_workers: 4,
            chaincode_workers: 4,
            index_workers: 4,
            error_workers: 2,
        }
    }
}

/// Upper bounds on collaborator calls, in milliseconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub delivery_ms: u64,
    pub submission_ms: u64,
    pub lookup_ms: u64,
    pub search_ms: u64,
}

impl TimeoutConfig {
    pub fn delivery(&self) -> Duration {
        Duration::from_millis(self.delivery_ms)
    }

    pub fn submission(&self) -> Duration {
        Duration::from_millis(self.submission_ms)
    }

    pub fn lookup(&self) -> Duration {
        Duration::from_millis(self.lookup_ms)
    }

    pub fn search(&self) -> Duration {
        Duration::from_millis(self.search_ms)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            delivery_ms: 10_000,
            submission_ms: 30_000,
            lookup_ms: 10_000,
            search_ms: 10_000,
        }
    }
}

/// Block stream consumption.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Key of the persisted checkpoint row.
    pub consumer_id: String,
    /// Event types (or `type:attribute`) to deliver; empty delivers all.
    pub watch_list: Vec<String>,
    pub chunk_size: u64,
    pub fetch_concurrency: usize,
    /// The chain node's maximum heights per query.
    pub query_limit: u64,
    pub liveness_interval_secs: u64,
    pub reconnect_delay_secs: u64,
}

impl StreamConfig {
    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            watch_list: self.watch_list.clone(),
            chunk_size: self.chunk_size,
            fetch_concurrency: self.fetch_concurrency,
            query_limit: self.query_limit,
            liveness_interval: Duration::from_secs(self.liveness_interval_secs),
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            consumer_id: "scope-stream".into(),
            watch_list: vec![
                "scope_created".into(),
                "scope_updated".into(),
                "scope_ownership".into(),
            ],
            chunk_size: 20,
            fetch_concurrency: 2,
            query_limit: 20,
            liveness_interval_secs: 60,
            reconnect_delay_secs: 5,
        }
    }
}

/// Background recovery of stuck triggers and chain submissions.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub interval_secs: u64,
    /// A CREATED trigger older than this is considered lost.
    pub stale_event_secs: u64,
    pub max_attempts: u32,
    pub pending_tx_timeout_secs: u64,
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_event_secs)
    }

    pub fn pending_tx_timeout(&self) -> Duration {
        Duration::from_secs(self.pending_tx_timeout_secs)
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            stale_event_secs: 120,
            max_attempts: 5,
            pending_tx_timeout_secs: 600,
        }
    }
}

/// Which search index each owning party's documents land in.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub default_index: String,
    /// Party public key (hex) to index name.
    pub party_indexes: BTreeMap<String, String>,
}

impl SearchConfig {
    pub fn index_for(&self, party: &PartyKey) -> &str {
        self.party_indexes
            .get(party.as_str())
            .map(String::as_str)
            .unwrap_or(&self.default_index)
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_index: "scopes".into(),
            party_indexes: BTreeMap::new(),
        }
    }
}

// ── Defaults ───────────────────────────────────────────────────────────

fn default_data_dir() -> PathBuf {
    PathBuf::from("./saga_data")
}

fn default_map_size() -> usize {
    1 << 30
}

fn default_log_format() -> String {
    "human".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// ── Impl ───────────────────────────────────────────────────────────────

impl SagaConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: &str) -> Result<Self, NodeError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| NodeError::Config(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, NodeError> {
        toml::from_str(s).map_err(|e| NodeError::Config(e.to_string()))
    }

    /// Serialize the configuration to a TOML string.
    pub fn to_toml_string(&self) -> Result<String, NodeError> {
        toml::to_string_pretty(self).map_err(|e| NodeError::Config(e.to_string()))
    }
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            map_size: default_map_size(),
            log_format: default_log_format(),
            log_level: default_log_level(),
            enable_metrics: false,
            reapers: ReaperConfig::default(),
            timeouts: TimeoutConfig::default(),
            stream: StreamConfig::default(),
            sweeper: SweeperConfig::default(),
            search: SearchConfig::default(),
        }
    }
}
