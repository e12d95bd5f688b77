//! Transfer progress reported through the virtual file system

use super::support::{test_config, FakeDrive, ROOT_ID};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use syncore::db::SledSyncDb;
use syncore::error::SyncError;
use syncore::propagation::{StatusTracker, Vfs, VfsStatus};
use syncore::SyncEngine;
use tempfile::TempDir;

/// Status table that keeps every syncing update it receives
#[derive(Default)]
struct RecordingVfs {
    tracker: StatusTracker,
    updates: Mutex<Vec<(PathBuf, u8)>>,
}

impl RecordingVfs {
    fn progress_of(&self, path: &str) -> Vec<u8> {
        self.updates
            .lock()
            .iter()
            .filter(|(p, _)| p == Path::new(path))
            .map(|(_, progress)| *progress)
            .collect()
    }
}

impl Vfs for RecordingVfs {
    fn status(&self, path: &Path) -> VfsStatus {
        self.tracker.status(path)
    }

    fn force_status(&self, path: &Path, status: VfsStatus) -> Result<(), SyncError> {
        if status.is_syncing {
            self.updates.lock().push((path.to_path_buf(), status.progress));
        }
        self.tracker.force_status(path, status)
    }
}

fn engine(root: &TempDir, drive: &FakeDrive, vfs: Arc<RecordingVfs>) -> SyncEngine {
    let db = Arc::new(SledSyncDb::temporary().unwrap());
    SyncEngine::with_vfs(test_config(root.path()), drive.api(), db, vfs).unwrap()
}

#[tokio::test]
async fn download_progress_increases_per_chunk() {
    let root = TempDir::new().unwrap();
    let drive = FakeDrive::new();
    drive.add_file(ROOT_ID, "report.pdf", b"%PDF-1.7", 1_600_000_000);
    let vfs = Arc::new(RecordingVfs::default());
    let mut engine = engine(&root, &drive, Arc::clone(&vfs));

    let report = engine.run_cycle().await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(vfs.progress_of("report.pdf"), vec![0, 50, 100]);
    assert!(vfs.tracker.syncing().is_empty());
}

#[tokio::test]
async fn upload_progress_increases_per_chunk() {
    let root = TempDir::new().unwrap();
    fs::write(root.path().join("notes.txt"), b"0123456789").unwrap();
    let drive = FakeDrive::new();
    let vfs = Arc::new(RecordingVfs::default());
    let mut engine = engine(&root, &drive, Arc::clone(&vfs));

    engine.run_cycle().await.unwrap();
    assert_eq!(vfs.progress_of("notes.txt"), vec![0, 40, 80, 100]);

    fs::write(root.path().join("notes.txt"), b"01234567").unwrap();
    let file = drive.find(ROOT_ID, "notes.txt").unwrap();
    engine.run_cycle().await.unwrap();
    assert_eq!(drive.content(&file.id).unwrap(), b"01234567");
    assert_eq!(vfs.progress_of("notes.txt"), vec![0, 40, 80, 100, 0, 50, 100]);
    assert!(vfs.tracker.syncing().is_empty());
}
