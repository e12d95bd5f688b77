//! Error types
//!
//! Every fallible core operation reports a two-part `{ExitCode, ExitCause}` pair
//! through [`ExitInfo`]. Module errors carry the details and map onto that pair
//! so the user-facing layer can tell fatal causes apart.

use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// First half of the exit taxonomy: which subsystem failed and how badly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitCode {
    Ok,
    Unknown,
    NetworkError,
    InvalidToken,
    DataError,
    DbError,
    BackError,
    SystemError,
    FatalError,
    InconsistencyError,
    NoWritePermission,
    RateLimited,
    InvalidSync,
    OperationCanceled,
    LogicError,
}

/// Second half of the exit taxonomy: the specific cause
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitCause {
    Unknown,
    NotEnoughINotifyWatches,
    SyncDirAccessError,
    SyncDirDoesntExist,
    FileAccessError,
    FileLocked,
    NotFound,
    NotEnoughDiskSpace,
    QuotaExceeded,
    ApiError,
    Http5xx,
    ConnectionFailed,
    InvalidArgument,
    InvalidName,
    InvalidSnapshot,
    ChangesLost,
    UnexpectedEof,
    DbAccessError,
    DependencyCycle,
    WatcherStartFailed,
}

/// How the engine reacts to a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Requeue with backoff, no user interruption
    Transient,
    /// Abort the current cycle, surface a diagnostic, retry next cycle
    Environmental,
    /// Skip the offending record and continue
    Data,
    /// Quarantine the affected subtree
    Invariant,
}

/// Two-part exit status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: ExitCode,
    pub cause: ExitCause,
}

impl ExitInfo {
    pub const OK: ExitInfo = ExitInfo::new(ExitCode::Ok, ExitCause::Unknown);

    pub const fn new(code: ExitCode, cause: ExitCause) -> Self {
        Self { code, cause }
    }

    pub fn is_ok(&self) -> bool {
        self.code == ExitCode::Ok
    }

    pub fn class(&self) -> ErrorClass {
        match (self.code, self.cause) {
            (ExitCode::NetworkError, _) | (ExitCode::RateLimited, _) => ErrorClass::Transient,
            (ExitCode::BackError, ExitCause::Http5xx) => ErrorClass::Transient,
            (_, ExitCause::FileLocked) => ErrorClass::Transient,
            (ExitCode::DataError, _) => ErrorClass::Data,
            (ExitCode::InconsistencyError, _) | (ExitCode::LogicError, _) => {
                ErrorClass::Invariant
            }
            _ => ErrorClass::Environmental,
        }
    }

    /// Whether a failed job with this status should be re-queued for the next cycle
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

impl Default for ExitInfo {
    fn default() -> Self {
        Self::OK
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{:?}, {:?}}}", self.code, self.cause)
    }
}

/// Snapshot structure violations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("Item not found: {0}")]
    NotFound(NodeId),

    #[error("Parent {parent_id} of item {id} does not exist")]
    MissingParent { id: NodeId, parent_id: NodeId },

    #[error("Moving {id} under {parent_id} would create a cycle")]
    Cycle { id: NodeId, parent_id: NodeId },

    #[error("Name '{name}' already used by {existing} under {parent_id}")]
    NameClash {
        parent_id: NodeId,
        name: String,
        existing: NodeId,
    },

    #[error("Root item cannot be {0}")]
    RootImmutable(&'static str),

    #[error("Invalid item {id}: {reason}")]
    InvalidItem { id: NodeId, reason: String },

    #[error("Snapshot is not valid, a full rebuild is required")]
    Invalidated,
}

impl SnapshotError {
    pub fn exit_info(&self) -> ExitInfo {
        match self {
            SnapshotError::NotFound(_) => ExitInfo::new(ExitCode::DataError, ExitCause::NotFound),
            SnapshotError::InvalidItem { .. } | SnapshotError::NameClash { .. } => {
                ExitInfo::new(ExitCode::DataError, ExitCause::InvalidName)
            }
            SnapshotError::Invalidated => {
                ExitInfo::new(ExitCode::DataError, ExitCause::InvalidSnapshot)
            }
            SnapshotError::MissingParent { .. }
            | SnapshotError::Cycle { .. }
            | SnapshotError::RootImmutable(_) => {
                ExitInfo::new(ExitCode::InconsistencyError, ExitCause::InvalidSnapshot)
            }
        }
    }
}

/// Remote listing parse and protocol errors
#[derive(Debug, Error)]
pub enum ListingError {
    #[error("Invalid {column} value '{value}' on line {line}")]
    InvalidNumber {
        column: &'static str,
        value: String,
        line: usize,
    },

    #[error("Negative size '{value}' on line {line}")]
    NegativeSize { value: String, line: usize },

    #[error("End of stream inside a quoted value starting on line {line}")]
    UnexpectedEof { line: usize },

    #[error("Missing listing header")]
    MissingHeader,

    #[error("Listing ended without the end-of-file marker")]
    Truncated,

    #[error("Invalid incremental listing payload: {0}")]
    InvalidPayload(String),

    #[error("I/O error while reading listing: {0}")]
    Io(#[from] io::Error),
}

impl ListingError {
    pub fn exit_info(&self) -> ExitInfo {
        match self {
            ListingError::UnexpectedEof { .. } | ListingError::Truncated => {
                ExitInfo::new(ExitCode::NetworkError, ExitCause::UnexpectedEof)
            }
            ListingError::Io(_) => ExitInfo::new(ExitCode::NetworkError, ExitCause::ConnectionFailed),
            _ => ExitInfo::new(ExitCode::BackError, ExitCause::ApiError),
        }
    }
}

/// Platform watcher failures
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("Not enough inotify watches for {path}; raise fs.inotify.max_user_watches")]
    NotEnoughWatches { path: PathBuf },

    #[error("Cannot access sync directory {path}: {source}")]
    AccessDenied { path: PathBuf, source: io::Error },

    #[error("Sync directory {0} does not exist")]
    MissingRoot(PathBuf),

    #[error("Watcher did not become ready within {0:?}")]
    ReadyTimeout(std::time::Duration),

    #[error("Watcher backend error: {0}")]
    Backend(String),

    #[error("I/O error in watcher: {0}")]
    Io(#[from] io::Error),
}

impl WatcherError {
    pub fn exit_info(&self) -> ExitInfo {
        match self {
            WatcherError::NotEnoughWatches { .. } => {
                ExitInfo::new(ExitCode::SystemError, ExitCause::NotEnoughINotifyWatches)
            }
            WatcherError::AccessDenied { .. } => {
                ExitInfo::new(ExitCode::InvalidSync, ExitCause::SyncDirAccessError)
            }
            WatcherError::MissingRoot(_) => {
                ExitInfo::new(ExitCode::InvalidSync, ExitCause::SyncDirDoesntExist)
            }
            WatcherError::ReadyTimeout(_) | WatcherError::Backend(_) => {
                ExitInfo::new(ExitCode::SystemError, ExitCause::WatcherStartFailed)
            }
            WatcherError::Io(e) => classify_io_error(e),
        }
    }
}

/// Sync database errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Database node {0} not found")]
    NodeNotFound(u64),

    #[error("Database is inconsistent: {0}")]
    Inconsistent(String),
}

impl StorageError {
    pub fn exit_info(&self) -> ExitInfo {
        match self {
            StorageError::NodeNotFound(_) | StorageError::Inconsistent(_) => {
                ExitInfo::new(ExitCode::DbError, ExitCause::InvalidSnapshot)
            }
            _ => ExitInfo::new(ExitCode::DbError, ExitCause::DbAccessError),
        }
    }
}

/// Top-level engine error
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Listing(#[from] ListingError),

    #[error(transparent)]
    Watcher(#[from] WatcherError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("I/O error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Dependency cycle between {0} pending operations")]
    DependencyCycle(usize),

    #[error("Cycle aborted: {0}")]
    Aborted(String),

    #[error("{info}: {message}")]
    Exit { info: ExitInfo, message: String },
}

impl SyncError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SyncError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn exit(info: ExitInfo, message: impl Into<String>) -> Self {
        SyncError::Exit {
            info,
            message: message.into(),
        }
    }

    /// Two-part status for this error
    pub fn exit_info(&self) -> ExitInfo {
        match self {
            SyncError::ConfigError(_) => ExitInfo::new(ExitCode::FatalError, ExitCause::InvalidArgument),
            SyncError::Snapshot(e) => e.exit_info(),
            SyncError::Listing(e) => e.exit_info(),
            SyncError::Watcher(e) => e.exit_info(),
            SyncError::Storage(e) => e.exit_info(),
            SyncError::Io { source, .. } => classify_io_error(source),
            SyncError::Http { status, .. } => classify_http_status(*status),
            SyncError::Network(_) => {
                ExitInfo::new(ExitCode::NetworkError, ExitCause::ConnectionFailed)
            }
            SyncError::DependencyCycle(_) => {
                ExitInfo::new(ExitCode::LogicError, ExitCause::DependencyCycle)
            }
            SyncError::Aborted(_) => ExitInfo::new(ExitCode::OperationCanceled, ExitCause::Unknown),
            SyncError::Exit { info, .. } => *info,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.exit_info().is_retryable()
    }
}

/// Map a local I/O error onto the exit taxonomy by OS error code
pub fn classify_io_error(error: &io::Error) -> ExitInfo {
    if let Some(code) = error.raw_os_error() {
        if is_disk_full(code) {
            return ExitInfo::new(ExitCode::SystemError, ExitCause::NotEnoughDiskSpace);
        }
        if is_busy(code) {
            return ExitInfo::new(ExitCode::SystemError, ExitCause::FileLocked);
        }
    }

    match error.kind() {
        io::ErrorKind::PermissionDenied => {
            ExitInfo::new(ExitCode::SystemError, ExitCause::FileAccessError)
        }
        io::ErrorKind::NotFound => ExitInfo::new(ExitCode::DataError, ExitCause::NotFound),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut => {
            ExitInfo::new(ExitCode::SystemError, ExitCause::FileLocked)
        }
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => {
            ExitInfo::new(ExitCode::SystemError, ExitCause::InvalidName)
        }
        _ => ExitInfo::new(ExitCode::SystemError, ExitCause::Unknown),
    }
}

/// Map an HTTP status onto the exit taxonomy
pub fn classify_http_status(status: u16) -> ExitInfo {
    match status {
        401 => ExitInfo::new(ExitCode::InvalidToken, ExitCause::ApiError),
        403 => ExitInfo::new(ExitCode::InvalidSync, ExitCause::SyncDirAccessError),
        404 => ExitInfo::new(ExitCode::DataError, ExitCause::NotFound),
        429 => ExitInfo::new(ExitCode::RateLimited, ExitCause::ApiError),
        507 => ExitInfo::new(ExitCode::BackError, ExitCause::QuotaExceeded),
        500..=599 => ExitInfo::new(ExitCode::BackError, ExitCause::Http5xx),
        400..=499 => ExitInfo::new(ExitCode::BackError, ExitCause::ApiError),
        _ => ExitInfo::new(ExitCode::Unknown, ExitCause::Unknown),
    }
}

#[cfg(unix)]
fn is_disk_full(code: i32) -> bool {
    code == libc::ENOSPC || code == libc::EDQUOT
}

#[cfg(windows)]
fn is_disk_full(code: i32) -> bool {
    // ERROR_HANDLE_DISK_FULL, ERROR_DISK_FULL
    code == 39 || code == 112
}

#[cfg(not(any(unix, windows)))]
fn is_disk_full(_code: i32) -> bool {
    false
}

#[cfg(unix)]
fn is_busy(code: i32) -> bool {
    code == libc::EBUSY || code == libc::ETXTBSY
}

#[cfg(windows)]
fn is_busy(code: i32) -> bool {
    // ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION
    code == 32 || code == 33
}

#[cfg(not(any(unix, windows)))]
fn is_busy(_code: i32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forbidden_is_sync_dir_access_error() {
        let info = classify_http_status(403);
        assert_eq!(info, ExitInfo::new(ExitCode::InvalidSync, ExitCause::SyncDirAccessError));
        assert!(!info.is_retryable());
    }

    #[test]
    fn test_server_errors_are_retryable() {
        assert!(classify_http_status(503).is_retryable());
        assert!(classify_http_status(429).is_retryable());
        assert!(!classify_http_status(404).is_retryable());
    }

    #[test]
    fn test_permission_denied_is_file_access_error() {
        let err = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(
            classify_io_error(&err),
            ExitInfo::new(ExitCode::SystemError, ExitCause::FileAccessError)
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_disk_full_by_os_code() {
        let err = io::Error::from_raw_os_error(libc::ENOSPC);
        assert_eq!(classify_io_error(&err).cause, ExitCause::NotEnoughDiskSpace);
    }

    #[test]
    fn test_not_enough_watches_cause() {
        let err = WatcherError::NotEnoughWatches {
            path: PathBuf::from("/sync"),
        };
        assert_eq!(
            err.exit_info(),
            ExitInfo::new(ExitCode::SystemError, ExitCause::NotEnoughINotifyWatches)
        );
    }

    #[test]
    fn test_exit_info_display() {
        let info = ExitInfo::new(ExitCode::InvalidSync, ExitCause::SyncDirAccessError);
        assert_eq!(info.to_string(), "{InvalidSync, SyncDirAccessError}");
    }
}
