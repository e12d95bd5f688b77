//! Platform file-system watchers
//!
//! Each backend owns a thread (or an OS-managed one) that turns native change
//! notifications into [`WatchEvent`]s and pushes them on a bounded channel. The
//! backends never touch a snapshot; the local observer drains the channel.

pub mod normalize;
pub mod watch_index;

#[cfg(windows)]
mod directory_changes;
#[cfg(target_os = "linux")]
pub(crate) mod inotify_backend;
#[cfg(not(any(target_os = "linux", windows)))]
mod notify_backend;

pub use normalize::{InotifyNormalizer, InotifyOutput, InotifyRecord, WindowsNormalizer};
pub use watch_index::WatchIndex;

use crate::config::WatcherConfig;
use crate::error::{ExitInfo, WatcherError};
use crate::types::OperationType;
use std::path::PathBuf;
use std::sync::mpsc::SyncSender;
use std::time::Duration;

/// Normalized change on an absolute path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub operation: OperationType,
    pub path: PathBuf,
    /// Destination of a Move
    pub destination: Option<PathBuf>,
}

impl WatchEvent {
    pub fn new(operation: OperationType, path: impl Into<PathBuf>) -> Self {
        Self {
            operation,
            path: path.into(),
            destination: None,
        }
    }

    pub fn moved(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        Self {
            operation: OperationType::Move,
            path: from.into(),
            destination: Some(to.into()),
        }
    }
}

/// What a watcher delivers to its observer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherMessage {
    Event(WatchEvent),
    /// Notifications were dropped; the snapshot must be rebuilt
    ChangesLost,
    /// Monitoring stopped on an unrecoverable error
    Fatal { info: ExitInfo, message: String },
}

impl WatcherMessage {
    pub fn fatal(error: &WatcherError) -> Self {
        WatcherMessage::Fatal {
            info: error.exit_info(),
            message: error.to_string(),
        }
    }
}

/// Bound on `start()` waiting for a backend thread to report readiness
pub const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Monitoring of a root and every present and future subdirectory
pub trait PlatformWatcher: Send {
    /// Begin monitoring; returns once the watcher is ready or has failed
    fn start(&mut self) -> Result<(), WatcherError>;

    /// Stop monitoring and release OS handles before returning
    fn stop(&mut self);

    fn is_ready(&self) -> bool;

    /// False once notifications may have been lost since start
    fn is_reliable(&self) -> bool;
}

/// Backend for the platform the process runs on
pub fn platform_watcher(
    root: PathBuf,
    sender: SyncSender<WatcherMessage>,
    config: &WatcherConfig,
) -> Box<dyn PlatformWatcher> {
    #[cfg(target_os = "linux")]
    {
        Box::new(inotify_backend::InotifyWatcher::new(root, sender, config))
    }
    #[cfg(windows)]
    {
        Box::new(directory_changes::DirectoryChangesWatcher::new(root, sender, config))
    }
    #[cfg(not(any(target_os = "linux", windows)))]
    {
        Box::new(notify_backend::NotifyWatcher::new(root, sender, config))
    }
}
