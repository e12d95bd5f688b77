//! VFS status layer
//!
//! Placeholder/hydration state as seen by the platform integration, plus the
//! transient "syncing" flag and progress the jobs set while they run. Paths are
//! relative to the sync root.

use crate::error::SyncError;
use crate::remote::TransferProgress;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VfsStatus {
    pub is_placeholder: bool,
    pub is_hydrated: bool,
    pub is_syncing: bool,
    /// Percent, 0..=100
    pub progress: u8,
}

impl Default for VfsStatus {
    /// A plain, fully present file
    fn default() -> Self {
        Self {
            is_placeholder: false,
            is_hydrated: true,
            is_syncing: false,
            progress: 0,
        }
    }
}

pub trait Vfs: Send + Sync {
    fn status(&self, path: &Path) -> VfsStatus;

    fn force_status(&self, path: &Path, status: VfsStatus) -> Result<(), SyncError>;
}

/// Plain files: everything is hydrated and status updates are dropped
#[derive(Debug, Default)]
pub struct NoVfs;

impl Vfs for NoVfs {
    fn status(&self, _path: &Path) -> VfsStatus {
        VfsStatus::default()
    }

    fn force_status(&self, _path: &Path, _status: VfsStatus) -> Result<(), SyncError> {
        Ok(())
    }
}

/// In-memory status table over plain files, read by status queries
#[derive(Debug, Default)]
pub struct StatusTracker {
    statuses: RwLock<HashMap<PathBuf, VfsStatus>>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Paths currently being synchronized
    pub fn syncing(&self) -> Vec<(PathBuf, u8)> {
        let mut syncing: Vec<_> = self
            .statuses
            .read()
            .iter()
            .filter(|(_, status)| status.is_syncing)
            .map(|(path, status)| (path.clone(), status.progress))
            .collect();
        syncing.sort();
        syncing
    }
}

impl Vfs for StatusTracker {
    fn status(&self, path: &Path) -> VfsStatus {
        self.statuses.read().get(path).copied().unwrap_or_default()
    }

    fn force_status(&self, path: &Path, status: VfsStatus) -> Result<(), SyncError> {
        let mut statuses = self.statuses.write();
        if status == VfsStatus::default() {
            statuses.remove(path);
        } else {
            statuses.insert(path.to_path_buf(), status);
        }
        Ok(())
    }
}

/// Marks a path syncing for the guard's lifetime.
///
/// The flag is cleared exactly once, on the final path, when the guard is
/// finished or dropped, including on early return.
pub struct SyncingGuard {
    vfs: Arc<dyn Vfs>,
    path: PathBuf,
    cleared: bool,
}

impl SyncingGuard {
    pub fn begin(vfs: Arc<dyn Vfs>, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut status = vfs.status(&path);
        status.is_syncing = true;
        status.progress = 0;
        if let Err(e) = vfs.force_status(&path, status) {
            warn!(path = %path.display(), error = %e, "Failed to mark path syncing");
        }
        Self {
            vfs,
            path,
            cleared: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn progress(&self, percent: u8) {
        set_progress(self.vfs.as_ref(), &self.path, percent);
    }

    /// Callback for a transfer of `total` bytes; updates the status only when
    /// the percentage changes
    pub fn transfer_progress(&self, total: u64) -> TransferProgress {
        let vfs = Arc::clone(&self.vfs);
        let path = self.path.clone();
        let last = AtomicU8::new(0);
        Arc::new(move |transferred: u64| {
            let percent = if total == 0 {
                100
            } else {
                (transferred.min(total) * 100 / total) as u8
            };
            if last.swap(percent, Ordering::Relaxed) != percent {
                set_progress(vfs.as_ref(), &path, percent);
            }
        })
    }

    /// The item now lives at `path` (after a rename or move)
    pub fn retarget(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if path == self.path {
            return;
        }
        let _ = self.vfs.force_status(&self.path, VfsStatus::default());
        let mut status = self.vfs.status(&path);
        status.is_syncing = true;
        let _ = self.vfs.force_status(&path, status);
        self.path = path;
    }

    pub fn finish(mut self) {
        self.clear();
    }

    fn clear(&mut self) {
        if self.cleared {
            return;
        }
        self.cleared = true;
        let mut status = self.vfs.status(&self.path);
        status.is_syncing = false;
        status.progress = 0;
        if let Err(e) = self.vfs.force_status(&self.path, status) {
            warn!(path = %self.path.display(), error = %e, "Failed to clear syncing flag");
        }
    }
}

fn set_progress(vfs: &dyn Vfs, path: &Path, percent: u8) {
    let mut status = vfs.status(path);
    status.is_syncing = true;
    status.progress = percent.min(100);
    let _ = vfs.force_status(path, status);
}

impl Drop for SyncingGuard {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Counts how often a path leaves the syncing state
    #[derive(Default)]
    struct CountingVfs {
        inner: StatusTracker,
        clears: AtomicUsize,
    }

    impl Vfs for CountingVfs {
        fn status(&self, path: &Path) -> VfsStatus {
            self.inner.status(path)
        }

        fn force_status(&self, path: &Path, status: VfsStatus) -> Result<(), SyncError> {
            if !status.is_syncing && self.inner.status(path).is_syncing {
                self.clears.fetch_add(1, Ordering::SeqCst);
            }
            self.inner.force_status(path, status)
        }
    }

    #[test]
    fn test_guard_clears_final_path_exactly_once() {
        let vfs = Arc::new(CountingVfs::default());
        {
            let mut guard = SyncingGuard::begin(vfs.clone(), "a/old.txt");
            assert!(vfs.status(Path::new("a/old.txt")).is_syncing);
            guard.retarget("b/new.txt");
            assert!(!vfs.status(Path::new("a/old.txt")).is_syncing);
            assert!(vfs.status(Path::new("b/new.txt")).is_syncing);
            guard.finish();
        }
        assert!(!vfs.status(Path::new("b/new.txt")).is_syncing);
        // one clear for the old path on retarget, one for the final path
        assert_eq!(vfs.clears.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_guard_clears_on_early_return() {
        fn failing_job(vfs: Arc<dyn Vfs>) -> Result<(), SyncError> {
            let _guard = SyncingGuard::begin(vfs, "x.txt");
            Err(SyncError::Aborted("network down".to_string()))
        }
        let tracker = Arc::new(StatusTracker::new());
        assert!(failing_job(tracker.clone()).is_err());
        assert!(tracker.syncing().is_empty());
    }

    #[test]
    fn test_transfer_progress_reports_percent_changes() {
        let tracker = Arc::new(StatusTracker::new());
        let guard = SyncingGuard::begin(tracker.clone(), "video.mp4");
        let progress = guard.transfer_progress(400);

        progress(100);
        assert_eq!(tracker.syncing(), vec![(PathBuf::from("video.mp4"), 25)]);
        progress(101);
        assert_eq!(tracker.status(Path::new("video.mp4")).progress, 25);
        progress(500);
        assert_eq!(tracker.status(Path::new("video.mp4")).progress, 100);

        guard.finish();
        assert!(tracker.syncing().is_empty());
    }

    #[test]
    fn test_empty_transfer_is_complete() {
        let tracker = Arc::new(StatusTracker::new());
        let guard = SyncingGuard::begin(tracker.clone(), "empty.txt");
        (guard.transfer_progress(0))(0);
        assert_eq!(tracker.status(Path::new("empty.txt")).progress, 100);
    }

    #[test]
    fn test_no_vfs_reports_hydrated_files() {
        let status = NoVfs.status(Path::new("any"));
        assert!(status.is_hydrated && !status.is_placeholder && !status.is_syncing);
    }
}
