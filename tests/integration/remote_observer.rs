//! Remote snapshot maintenance from full and incremental listings

use super::support::{FakeDrive, ROOT_ID};
use std::path::PathBuf;
use std::sync::Arc;
use syncore::config::RemoteConfig;
use syncore::db::{SledSyncDb, SyncDbStore};
use syncore::error::{ExitCause, ExitCode, ExitInfo};
use syncore::observer::RemoteObserver;
use syncore::snapshot::SharedSnapshot;

fn observer(drive: &FakeDrive) -> (RemoteObserver, Arc<SledSyncDb>) {
    let db = Arc::new(SledSyncDb::temporary().unwrap());
    let config = RemoteConfig {
        root_id: ROOT_ID.to_string(),
        ..RemoteConfig::default()
    };
    let snapshot = SharedSnapshot::new(RemoteObserver::empty_snapshot(ROOT_ID));
    let db_store: Arc<dyn SyncDbStore> = db.clone();
    (RemoteObserver::new(drive.api(), db_store, snapshot, &config), db)
}

#[tokio::test]
async fn first_refresh_explores_and_stores_the_cursor() {
    let drive = FakeDrive::new();
    let music = drive.add_dir(ROOT_ID, "music");
    let track = drive.add_file(&music, "track.flac", b"flac", 1_650_000_000);
    let (mut observer, db) = observer(&drive);

    observer.refresh().await.unwrap();
    let snapshot = observer.snapshot().read();
    assert!(snapshot.is_valid());
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot.path(&track).unwrap().0, PathBuf::from("music/track.flac"));
    drop(snapshot);
    assert_eq!(db.cursor().unwrap().as_deref(), Some("2"));
    assert_eq!(observer.cursor(), Some("2"));
}

#[tokio::test]
async fn later_refreshes_replay_actions() {
    let drive = FakeDrive::new();
    let id = drive.add_file(ROOT_ID, "a.txt", b"a", 1_650_000_000);
    let (mut observer, _db) = observer(&drive);
    observer.refresh().await.unwrap();

    drive.rename_external(&id, "b.txt");
    let added = drive.add_file(ROOT_ID, "c.txt", b"c", 1_650_000_100);
    let applied = observer.refresh().await.unwrap();
    assert_eq!(applied, 2);

    let snapshot = observer.snapshot().read();
    assert_eq!(snapshot.get(&id).unwrap().name, "b.txt");
    assert!(snapshot.contains(&added));
    assert_eq!(
        drive.calls().iter().filter(|call| call.starts_with("full_listing")).count(),
        1
    );
}

#[tokio::test]
async fn listing_failure_leaves_the_snapshot_invalid() {
    let drive = FakeDrive::new();
    drive.add_file(ROOT_ID, "a.txt", b"a", 1_650_000_000);
    drive.fail(
        "full_listing",
        1,
        ExitInfo::new(ExitCode::NetworkError, ExitCause::ConnectionFailed),
    );
    let (mut observer, _db) = observer(&drive);

    let error = observer.refresh().await.unwrap_err();
    assert!(error.is_retryable());
    assert!(!observer.snapshot().is_valid());

    observer.refresh().await.unwrap();
    assert!(observer.snapshot().is_valid());
    assert_eq!(observer.snapshot().read().len(), 1);
}

#[tokio::test]
async fn invalidated_snapshot_is_relisted() {
    let drive = FakeDrive::new();
    drive.add_file(ROOT_ID, "a.txt", b"a", 1_650_000_000);
    let (mut observer, _db) = observer(&drive);
    observer.refresh().await.unwrap();

    observer.snapshot().invalidate();
    observer.refresh().await.unwrap();
    assert!(observer.snapshot().is_valid());
    assert_eq!(
        drive.calls().iter().filter(|call| call.starts_with("full_listing")).count(),
        2
    );
}
