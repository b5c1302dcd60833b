use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser, ValueEnum};
use search_sync_core::{FlowKey, IndexSyncOptions, SyncSettings, DEFAULT_SYNC_THRESHOLD};

/// Where the sync flow lease is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LeaseBackend {
    /// Lease records in a directory shared by every worker
    File,
    /// In-process lease, only excludes runs within this process
    Memory,
    /// No lease store; runs without cross-process exclusion
    None,
}

impl fmt::Display for LeaseBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseBackend::File => write!(f, "file"),
            LeaseBackend::Memory => write!(f, "memory"),
            LeaseBackend::None => write!(f, "none"),
        }
    }
}

/// Configuration for the search-sync-meili worker.
#[derive(Parser, Debug, Clone)]
#[command(name = "search-sync-meili")]
#[command(about = "Keeps Meilisearch indexes in step with the message database")]
pub struct Config {
    /// Enable the search feature
    #[arg(
        long,
        env = "SEARCH",
        default_value_t = true,
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub search: bool,

    /// Skip document indexing even when search is enabled
    #[arg(
        long,
        env = "MEILI_NO_SYNC",
        default_value_t = false,
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub meili_no_sync: bool,

    /// Meilisearch base URL (e.g. http://localhost:7700)
    #[arg(long, env = "MEILI_HOST")]
    pub meili_host: Option<String>,

    /// Meilisearch master key
    #[arg(long, env = "MEILI_MASTER_KEY", hide_env_values = true)]
    pub meili_master_key: Option<String>,

    /// Drift above which a collection is fully reindexed
    #[arg(long, env = "MEILI_SYNC_THRESHOLD", default_value_t = DEFAULT_SYNC_THRESHOLD)]
    pub sync_threshold: u64,

    /// SQLite database holding messages and conversations
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://search-sync.db")]
    pub database_url: String,

    /// Lease backend used to keep the sync at most once across workers
    #[arg(long, env = "LEASE_BACKEND", value_enum, default_value_t = LeaseBackend::File)]
    pub lease_backend: LeaseBackend,

    /// Directory for file leases (defaults to a search-sync dir under the system temp dir)
    #[arg(long, env = "LEASE_DIR")]
    pub lease_dir: Option<PathBuf>,

    /// Lease TTL in seconds
    #[arg(long, env = "FLOW_TTL_SECS", default_value = "600")]
    pub flow_ttl_secs: u64,

    /// Delay before recreating missing indexes, in milliseconds
    #[arg(long, env = "RECOVERY_DELAY_MS", default_value = "750")]
    pub recovery_delay_ms: u64,

    /// Seconds between sync checks (0 runs once and exits)
    #[arg(long, env = "SYNC_INTERVAL", default_value = "0")]
    pub interval_secs: u64,

    /// Seconds to wait for Meilisearch to apply an upload
    #[arg(long, env = "MEILI_TASK_TIMEOUT_SECS", default_value = "60")]
    pub task_timeout_secs: u64,

    /// Documents per upload request
    #[arg(long, env = "MEILI_BATCH_SIZE", default_value = "100")]
    pub batch_size: usize,
}

impl Config {
    /// Get the effective lease directory.
    pub fn effective_lease_dir(&self) -> PathBuf {
        self.lease_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("search-sync").join("leases"))
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            indexing_disabled: self.meili_no_sync,
            sync_threshold: self.sync_threshold,
        }
    }

    pub fn index_sync_options(&self) -> IndexSyncOptions {
        IndexSyncOptions {
            search_enabled: self.search,
            flow_key: FlowKey::index_sync(),
            flow_ttl: Duration::from_secs(self.flow_ttl_secs),
            recovery_delay: Duration::from_millis(self.recovery_delay_ms),
        }
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    /// Interval between runs, or `None` to run once.
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
    }
}
