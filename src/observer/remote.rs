//! Remote observer
//!
//! Builds the remote snapshot from a full listing, then keeps it current by
//! replaying the actions reported after the stored cursor. Any action that
//! cannot be applied invalidates the snapshot and forces a new full listing.

use crate::config::RemoteConfig;
use crate::db::SyncDbStore;
use crate::error::{SnapshotError, SyncError};
use crate::listing::{clamp_listen_timeout, ListingAction};
use crate::remote::RemoteApi;
use crate::snapshot::{BuildReport, NameCaseRule, SharedSnapshot, Snapshot, SnapshotBuilder};
use crate::types::{NodeId, ReplicaSide};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// RemoteObserver: listing ingestion for the remote replica
pub struct RemoteObserver {
    api: Arc<dyn RemoteApi>,
    db: Arc<dyn SyncDbStore>,
    snapshot: SharedSnapshot,
    root_id: NodeId,
    listen_timeout: Duration,
    cursor: Option<String>,
}

impl RemoteObserver {
    pub fn new(
        api: Arc<dyn RemoteApi>,
        db: Arc<dyn SyncDbStore>,
        snapshot: SharedSnapshot,
        config: &RemoteConfig,
    ) -> Self {
        Self {
            api,
            db,
            snapshot,
            root_id: config.root_id.clone(),
            listen_timeout: clamp_listen_timeout(Duration::from_secs(config.listen_timeout_secs)),
            cursor: None,
        }
    }

    /// Empty, invalid snapshot for a remote root
    pub fn empty_snapshot(root_id: impl Into<NodeId>) -> Snapshot {
        Snapshot::new(ReplicaSide::Remote, root_id, NameCaseRule::Sensitive)
    }

    pub fn snapshot(&self) -> &SharedSnapshot {
        &self.snapshot
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    /// Rebuild the snapshot from a full listing
    pub async fn explore(&mut self) -> Result<BuildReport, SyncError> {
        let started = Instant::now();
        self.snapshot.invalidate();
        let listing = self.api.full_listing(&self.root_id).await?;

        let mut builder = SnapshotBuilder::new(Self::empty_snapshot(self.root_id.clone()));
        builder.extend(listing.items);
        let (mut snapshot, report) = builder.finish();
        snapshot.set_valid(true);
        let items = snapshot.len();
        self.snapshot.replace(snapshot);

        self.db.set_cursor(&listing.cursor)?;
        self.cursor = Some(listing.cursor);
        info!(
            items,
            ignored = listing.ignored,
            quarantined = report.quarantined(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Explored remote tree"
        );
        Ok(report)
    }

    /// Bring the snapshot up to date. Returns the number of actions applied.
    pub async fn refresh(&mut self) -> Result<usize, SyncError> {
        let cursor = match (&self.cursor, self.snapshot.is_valid()) {
            (Some(cursor), true) => cursor.clone(),
            _ => {
                let report = self.explore().await?;
                return Ok(report.inserted);
            }
        };

        let mut cursor = cursor;
        let mut applied = 0usize;
        loop {
            let response = self.api.continue_listing(&cursor).await?;
            if let Err(e) = self.apply_actions(&response.actions) {
                warn!(error = %e, "Remote changes could not be applied, relisting");
                let report = self.explore().await?;
                return Ok(report.inserted);
            }
            applied += response.actions.len();
            cursor = response.cursor;
            self.db.set_cursor(&cursor)?;
            self.cursor = Some(cursor.clone());
            if !response.has_more {
                break;
            }
        }
        if applied > 0 {
            debug!(actions = applied, "Applied remote changes");
        }
        Ok(applied)
    }

    /// Long-poll until the server reports changes or the timeout elapses
    pub async fn wait_for_changes(&self) -> Result<bool, SyncError> {
        let cursor = match &self.cursor {
            Some(cursor) => cursor,
            None => return Ok(true),
        };
        Ok(self.api.listen(cursor, self.listen_timeout).await?.has_changes)
    }

    fn apply_actions(&self, actions: &[ListingAction]) -> Result<(), SnapshotError> {
        let mut snapshot = self.snapshot.write();
        for action in actions {
            let item = action.file.to_item();
            if item.id == *snapshot.root_id() {
                continue;
            }
            if action.action.is_removal() {
                if snapshot.contains(&item.id) {
                    snapshot.remove(&item.id)?;
                }
                continue;
            }
            if !snapshot.contains(&item.parent_id) {
                // Moved or created outside the synchronized tree
                if snapshot.contains(&item.id) {
                    snapshot.remove(&item.id)?;
                }
                debug!(id = %item.id, parent_id = %item.parent_id, "Ignoring change outside the sync root");
                continue;
            }
            if let Some(existing) = snapshot.find_child(&item.parent_id, &item.name).map(|found| found.id.clone()) {
                if existing != item.id && !snapshot.is_ancestor_or_self(&existing, &item.parent_id) {
                    // The previous holder of the name is gone; a removal follows
                    snapshot.remove(&existing)?;
                }
            }
            snapshot.upsert(item)?;
        }
        Ok(())
    }
}
