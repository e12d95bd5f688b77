//! Syncore: replica observation and reconciliation for two-way sync
//!
//! Keeps a local directory and a remote drive folder in agreement. Each side
//! is observed into an in-memory [`snapshot::Snapshot`]; every cycle the
//! frozen snapshots are diffed against the [`db`] of the last common state,
//! conflicts are resolved and the resulting operations are propagated.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod listing;
pub mod logging;
pub mod observer;
pub mod propagation;
pub mod reconciliation;
pub mod remote;
pub mod snapshot;
pub mod status;
pub mod tooling;
pub mod types;
pub mod watcher;

pub use config::{ConfigLoader, SyncConfig};
pub use engine::{CycleReport, SyncEngine};
pub use error::{ExitCause, ExitCode, ExitInfo, SyncError};
pub use snapshot::{SharedSnapshot, Snapshot, SnapshotItem};
pub use status::{StatusService, SyncStatus};
pub use types::{NodeId, NodeType, OperationType, ReplicaSide, SyncPath, SyncTime};
