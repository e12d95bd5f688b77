//! Full cycles against a temporary sync root and the in-memory drive

use super::support::{test_config, FakeDrive, ROOT_ID};
use std::fs;
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use syncore::db::{SledSyncDb, SyncDbStore};
use syncore::status::SyncStatus;
use syncore::types::OperationType;
use syncore::SyncEngine;
use tempfile::TempDir;

fn engine(root: &TempDir, drive: &FakeDrive) -> (SyncEngine, Arc<SledSyncDb>) {
    let db = Arc::new(SledSyncDb::temporary().unwrap());
    let engine = SyncEngine::new(test_config(root.path()), drive.api(), Arc::clone(&db)).unwrap();
    (engine, db)
}

#[tokio::test]
async fn local_file_is_uploaded_once() {
    let root = TempDir::new().unwrap();
    fs::write(root.path().join("notes.txt"), b"hello").unwrap();
    let drive = FakeDrive::new();
    let (mut engine, db) = engine(&root, &drive);

    let report = engine.run_cycle().await.unwrap();
    assert_eq!(report.operations.get(&OperationType::Create), Some(&1));
    assert_eq!(report.completed, 1);
    assert_eq!(report.failed, 0);

    let uploaded = drive.find(ROOT_ID, "notes.txt").unwrap();
    assert_eq!(drive.content(&uploaded.id).unwrap(), b"hello");
    // root pair plus the file
    assert_eq!(db.all().unwrap().len(), 2);

    let second = engine.run_cycle().await.unwrap();
    assert_eq!(second.total_operations(), 0);
}

#[tokio::test]
async fn remote_tree_is_downloaded_with_its_timestamps() {
    let root = TempDir::new().unwrap();
    let drive = FakeDrive::new();
    let docs = drive.add_dir(ROOT_ID, "docs");
    drive.add_file(&docs, "report.pdf", b"%PDF-1.7", 1_600_000_000);
    let (mut engine, _db) = engine(&root, &drive);

    let report = engine.run_cycle().await.unwrap();
    assert_eq!(report.operations.get(&OperationType::Create), Some(&2));
    assert_eq!(report.completed, 2);

    let path = root.path().join("docs").join("report.pdf");
    assert_eq!(fs::read(&path).unwrap(), b"%PDF-1.7");
    let modified = fs::metadata(&path).unwrap().modified().unwrap();
    assert_eq!(modified.duration_since(UNIX_EPOCH).unwrap().as_secs(), 1_600_000_000);
    assert!(!root.path().join("docs").join("report.pdf.syncore-partial").exists());

    let second = engine.run_cycle().await.unwrap();
    assert_eq!(second.total_operations(), 0);
}

#[tokio::test]
async fn remote_rename_is_applied_locally() {
    let root = TempDir::new().unwrap();
    let drive = FakeDrive::new();
    let id = drive.add_file(ROOT_ID, "draft.txt", b"v1", 1_600_000_000);
    let (mut engine, _db) = engine(&root, &drive);
    engine.run_cycle().await.unwrap();
    assert!(root.path().join("draft.txt").exists());

    drive.rename_external(&id, "final.txt");
    let report = engine.run_cycle().await.unwrap();
    assert_eq!(report.operations.get(&OperationType::Move), Some(&1));
    assert!(!root.path().join("draft.txt").exists());
    assert_eq!(fs::read(root.path().join("final.txt")).unwrap(), b"v1");
}

#[tokio::test]
async fn local_delete_removes_the_remote_copy() {
    let root = TempDir::new().unwrap();
    let drive = FakeDrive::new();
    drive.add_file(ROOT_ID, "old.log", b"log", 1_600_000_000);
    let (mut engine, db) = engine(&root, &drive);
    engine.run_cycle().await.unwrap();

    fs::remove_file(root.path().join("old.log")).unwrap();
    let report = engine.run_cycle().await.unwrap();
    assert_eq!(report.operations.get(&OperationType::Delete), Some(&1));
    assert!(drive.find(ROOT_ID, "old.log").is_none());
    assert_eq!(db.all().unwrap().len(), 1);
}

#[tokio::test]
async fn remote_edit_is_downloaded() {
    let root = TempDir::new().unwrap();
    let drive = FakeDrive::new();
    let id = drive.add_file(ROOT_ID, "todo.md", b"- one", 1_600_000_000);
    let (mut engine, _db) = engine(&root, &drive);
    engine.run_cycle().await.unwrap();

    drive.edit_external(&id, b"- one\n- two", 1_600_000_500);
    let report = engine.run_cycle().await.unwrap();
    assert_eq!(report.operations.get(&OperationType::Edit), Some(&1));
    assert_eq!(fs::read(root.path().join("todo.md")).unwrap(), b"- one\n- two");

    let second = engine.run_cycle().await.unwrap();
    assert_eq!(second.total_operations(), 0);
}

#[tokio::test]
async fn local_name_swap_is_propagated() {
    let root = TempDir::new().unwrap();
    fs::write(root.path().join("a.txt"), b"AAA").unwrap();
    fs::write(root.path().join("b.txt"), b"BBB").unwrap();
    let drive = FakeDrive::new();
    let (mut engine, _db) = engine(&root, &drive);
    engine.run_cycle().await.unwrap();

    fs::rename(root.path().join("a.txt"), root.path().join("swap.tmp")).unwrap();
    fs::rename(root.path().join("b.txt"), root.path().join("a.txt")).unwrap();
    fs::rename(root.path().join("swap.tmp"), root.path().join("b.txt")).unwrap();

    let report = engine.run_cycle().await.unwrap();
    assert_eq!(report.operations.get(&OperationType::Move), Some(&2));
    assert_eq!(report.failed, 0);
    assert_eq!(report.skipped, 0);

    let a = drive.find(ROOT_ID, "a.txt").unwrap();
    let b = drive.find(ROOT_ID, "b.txt").unwrap();
    assert_eq!(drive.content(&a.id).unwrap(), b"BBB");
    assert_eq!(drive.content(&b.id).unwrap(), b"AAA");
    assert_eq!(drive.len(), 2);

    let second = engine.run_cycle().await.unwrap();
    assert_eq!(second.total_operations(), 0);
}

#[tokio::test]
async fn remote_name_swap_is_applied_locally() {
    let root = TempDir::new().unwrap();
    let drive = FakeDrive::new();
    let a = drive.add_file(ROOT_ID, "a.txt", b"AAA", 1_600_000_000);
    let b = drive.add_file(ROOT_ID, "b.txt", b"BBB", 1_600_000_000);
    let (mut engine, _db) = engine(&root, &drive);
    engine.run_cycle().await.unwrap();

    drive.rename_external(&a, "swap.tmp");
    drive.rename_external(&b, "a.txt");
    drive.rename_external(&a, "b.txt");

    let report = engine.run_cycle().await.unwrap();
    assert_eq!(report.failed, 0);
    assert_eq!(fs::read(root.path().join("a.txt")).unwrap(), b"BBB");
    assert_eq!(fs::read(root.path().join("b.txt")).unwrap(), b"AAA");
    assert_eq!(fs::read_dir(root.path()).unwrap().count(), 2);

    let second = engine.run_cycle().await.unwrap();
    assert_eq!(second.total_operations(), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn names_the_remote_cannot_store_are_reported_not_propagated() {
    let root = TempDir::new().unwrap();
    fs::write(root.path().join("ok.txt"), b"ok").unwrap();
    fs::write(root.path().join("report:v2.txt"), b"x").unwrap();
    let drive = FakeDrive::new();
    let (mut engine, _db) = engine(&root, &drive);

    let report = engine.run_cycle().await.unwrap();
    assert_eq!(report.unsyncable, 1);
    assert_eq!(report.completed, 1);
    assert!(drive.find(ROOT_ID, "ok.txt").is_some());
    assert!(drive.find(ROOT_ID, "report:v2.txt").is_none());

    let status = engine.status_service();
    let path = engine.root().join("report:v2.txt");
    assert!(matches!(status.sync_status(&path), SyncStatus::Unsyncable { .. }));
}

#[tokio::test]
async fn status_service_reports_synced_items() {
    let root = TempDir::new().unwrap();
    fs::write(root.path().join("a.txt"), b"a").unwrap();
    let drive = FakeDrive::new();
    let (mut engine, _db) = engine(&root, &drive);
    engine.run_cycle().await.unwrap();

    let status = engine.status_service();
    let path = engine.root().join("a.txt");
    assert!(status.is_watched(&path));
    assert_eq!(status.sync_status(&path), SyncStatus::UpToDate);
    assert_eq!(status.sync_status(std::path::Path::new("/elsewhere/x")), SyncStatus::Unknown);
}
