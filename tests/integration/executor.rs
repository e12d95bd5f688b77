//! Propagation failures: retry accounting and dependency skipping

use super::support::{test_config, FakeDrive, ROOT_ID};
use std::fs;
use std::sync::Arc;
use syncore::db::SledSyncDb;
use syncore::error::{ExitCause, ExitCode, ExitInfo};
use syncore::SyncEngine;
use tempfile::TempDir;

fn engine(root: &TempDir, drive: &FakeDrive) -> SyncEngine {
    let db = Arc::new(SledSyncDb::temporary().unwrap());
    SyncEngine::new(test_config(root.path()), drive.api(), db).unwrap()
}

#[tokio::test]
async fn transient_upload_failure_is_retried_next_cycle() {
    let root = TempDir::new().unwrap();
    fs::write(root.path().join("photo.jpg"), b"jpeg").unwrap();
    let drive = FakeDrive::new();
    drive.fail(
        "upload",
        1,
        ExitInfo::new(ExitCode::NetworkError, ExitCause::ConnectionFailed),
    );
    let mut engine = engine(&root, &drive);

    let first = engine.run_cycle().await.unwrap();
    assert_eq!(first.failed, 1);
    let failures = engine.state().failures;
    assert_eq!(failures.len(), 1);
    assert!(failures[0].will_retry);
    assert!(drive.find(ROOT_ID, "photo.jpg").is_none());

    let second = engine.run_cycle().await.unwrap();
    assert_eq!(second.completed, 1);
    assert_eq!(second.failed, 0);
    assert!(drive.find(ROOT_ID, "photo.jpg").is_some());
}

#[tokio::test]
async fn children_of_a_failed_directory_are_skipped() {
    let root = TempDir::new().unwrap();
    fs::create_dir(root.path().join("album")).unwrap();
    fs::write(root.path().join("album").join("1.jpg"), b"one").unwrap();
    fs::write(root.path().join("album").join("2.jpg"), b"two").unwrap();
    let drive = FakeDrive::new();
    drive.fail(
        "create_directory",
        1,
        ExitInfo::new(ExitCode::BackError, ExitCause::ApiError),
    );
    let mut engine = engine(&root, &drive);

    let report = engine.run_cycle().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.skipped, 2);
    assert_eq!(report.completed, 0);
    assert!(!engine.state().failures[0].will_retry);
    assert!(drive.calls().iter().all(|call| !call.starts_with("upload")));
    assert_eq!(drive.len(), 0);
}

#[tokio::test]
async fn permanent_failures_are_not_attempted_again() {
    let root = TempDir::new().unwrap();
    fs::write(root.path().join("locked.bin"), b"data").unwrap();
    let drive = FakeDrive::new();
    drive.fail(
        "upload",
        1,
        ExitInfo::new(ExitCode::BackError, ExitCause::QuotaExceeded),
    );
    let mut engine = engine(&root, &drive);

    let first = engine.run_cycle().await.unwrap();
    assert_eq!(first.failed, 1);

    let second = engine.run_cycle().await.unwrap();
    assert_eq!(second.failed, 0);
    assert_eq!(second.skipped, 1);
    let uploads = drive.calls().iter().filter(|call| call.starts_with("upload")).count();
    assert_eq!(uploads, 1);
}

#[tokio::test]
async fn stopped_engine_skips_pending_jobs() {
    let root = TempDir::new().unwrap();
    fs::write(root.path().join("a.txt"), b"a").unwrap();
    let drive = FakeDrive::new();
    let mut engine = engine(&root, &drive);
    engine.stop();

    let report = engine.run_cycle().await.unwrap();
    assert_eq!(report.completed, 0);
    assert_eq!(report.skipped, 1);
    assert_eq!(drive.len(), 0);
}
