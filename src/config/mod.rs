//! Configuration
//!
//! Sections mirror the engine's components. Values are merged from built-in
//! defaults, the global file, the sync-root file and `SYNCORE__*` environment
//! variables (see [`merge::service::MergeService`]).

pub mod facade;
pub mod merge;
pub mod paths;
pub mod sources;
pub mod sync_root;

pub use facade::ConfigLoader;
pub use paths::xdg_root as xdg;
pub use sync_root::StorageConfig;

use crate::error::SyncError;
use crate::listing::MAX_LISTEN_TIMEOUT;
use crate::logging::LoggingConfig;
use crate::reconciliation::{ConflictPolicy, TargetPlatform};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub propagation: PropagationConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl SyncConfig {
    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), SyncError> {
        let listen = Duration::from_secs(self.remote.listen_timeout_secs);
        if listen.is_zero() || listen > MAX_LISTEN_TIMEOUT {
            return Err(SyncError::ConfigError(format!(
                "remote.listen_timeout_secs must be between 1 and {}, got {}",
                MAX_LISTEN_TIMEOUT.as_secs(),
                self.remote.listen_timeout_secs
            )));
        }
        if self.remote.listing_limit == 0 {
            return Err(SyncError::ConfigError("remote.listing_limit must be positive".to_string()));
        }
        if self.remote.root_id.trim().is_empty() {
            return Err(SyncError::ConfigError("remote.root_id must not be empty".to_string()));
        }
        if self.watcher.channel_capacity == 0 || self.watcher.max_batch_size == 0 {
            return Err(SyncError::ConfigError(
                "watcher.channel_capacity and watcher.max_batch_size must be positive".to_string(),
            ));
        }
        if self.reconciliation.batch_size == 0 {
            return Err(SyncError::ConfigError(
                "reconciliation.batch_size must be positive".to_string(),
            ));
        }
        if self.propagation.max_concurrency == 0 {
            return Err(SyncError::ConfigError(
                "propagation.max_concurrency must be positive".to_string(),
            ));
        }
        if self.sync.tick_interval_secs == 0 {
            return Err(SyncError::ConfigError("sync.tick_interval_secs must be positive".to_string()));
        }
        Ok(())
    }
}

/// Sync root and cycle timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSection {
    /// Local directory kept in agreement with the remote root
    #[serde(default)]
    pub root: Option<PathBuf>,

    /// Seconds between synchronization cycles
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// Force case-(in)sensitive sibling names; unset follows the local platform
    #[serde(default)]
    pub case_sensitive: Option<bool>,
}

fn default_tick_interval() -> u64 {
    30
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            root: None,
            tick_interval_secs: default_tick_interval(),
            case_sensitive: None,
        }
    }
}

/// Drive API access
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub base_url: String,

    /// Bearer token; prefer `SYNCORE__REMOTE__TOKEN` over writing it to a file
    #[serde(default)]
    pub token: Option<String>,

    /// Id of the remote directory paired with the local root
    #[serde(default = "default_remote_root")]
    pub root_id: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Long-poll timeout, below one minute
    #[serde(default = "default_listen_timeout")]
    pub listen_timeout_secs: u64,

    /// Page size for full listings
    #[serde(default = "default_listing_limit")]
    pub listing_limit: usize,
}

fn default_remote_root() -> String {
    "1".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_listen_timeout() -> u64 {
    50
}

fn default_listing_limit() -> usize {
    1000
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token: None,
            root_id: default_remote_root(),
            request_timeout_secs: default_request_timeout(),
            listen_timeout_secs: default_listen_timeout(),
            listing_limit: default_listing_limit(),
        }
    }
}

/// Local change observation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Bound of the watcher → observer channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Debounce window in milliseconds
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Batch window in milliseconds
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,

    /// Maximum events per batch
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Paths never synchronized (glob-like patterns)
    #[serde(default = "default_ignore_patterns")]
    pub ignore_patterns: Vec<String>,
}

fn default_channel_capacity() -> usize {
    10_000
}

fn default_debounce_ms() -> u64 {
    100
}

fn default_batch_window_ms() -> u64 {
    50
}

fn default_max_batch_size() -> usize {
    100
}

fn default_ignore_patterns() -> Vec<String> {
    vec![
        "**/.syncore.toml".to_string(),
        "**/.DS_Store".to_string(),
        "**/*.swp".to_string(),
        "**/.~lock.*".to_string(),
        "**/*.syncore-partial".to_string(),
    ]
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            debounce_ms: default_debounce_ms(),
            batch_window_ms: default_batch_window_ms(),
            max_batch_size: default_max_batch_size(),
            ignore_patterns: default_ignore_patterns(),
        }
    }
}

/// Delta computation and conflict handling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,

    /// Naming rules the remote side must satisfy
    #[serde(default)]
    pub target_platform: TargetPlatform,

    /// Items per operation-generation batch
    #[serde(default = "default_reconciliation_batch")]
    pub batch_size: usize,
}

fn default_reconciliation_batch() -> usize {
    1000
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            conflict_policy: ConflictPolicy::default(),
            target_platform: TargetPlatform::default(),
            batch_size: default_reconciliation_batch(),
        }
    }
}

/// Job execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagationConfig {
    /// Jobs running at once
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Cycles a retryable failure is re-queued for before it is surfaced
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
}

fn default_max_concurrency() -> usize {
    4
}

fn default_retry_limit() -> u32 {
    3
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            retry_limit: default_retry_limit(),
        }
    }
}
