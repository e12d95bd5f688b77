//! Propagation jobs
//!
//! A job applies one [`PendingOperation`] to its target replica and records
//! the result in the sync database. Jobs read items from the snapshots the
//! cycle was reconciled against; the live shared snapshots are updated after
//! a replica changes so the next cycle does not see the change twice.

use super::vfs::{SyncingGuard, Vfs};
use crate::db::{self, DbNode, SyncDbStore, ROOT_DB_ID};
use crate::error::{ExitCause, ExitCode, ExitInfo, SyncError};
use crate::observer::local::local_item;
use crate::reconciliation::{OperationEffect, PendingOperation};
use crate::remote::{RemoteApi, TransferProgress};
use crate::snapshot::{SharedSnapshot, Snapshot, SnapshotItem};
use crate::types::{OperationType, ReplicaSide, SyncTime};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Suffix of in-flight downloads; ignored by the local observer
pub const PARTIAL_SUFFIX: &str = ".syncore-partial";

/// Everything a job may touch
pub struct JobContext {
    pub local_root: PathBuf,
    pub remote: Arc<dyn RemoteApi>,
    pub db: Arc<dyn SyncDbStore>,
    pub vfs: Arc<dyn Vfs>,
    pub local_snapshot: SharedSnapshot,
    pub remote_snapshot: SharedSnapshot,
}

/// Snapshots the operations were generated from
#[derive(Clone)]
pub struct CycleSnapshots {
    pub local: Arc<Snapshot>,
    pub remote: Arc<Snapshot>,
}

impl CycleSnapshots {
    pub fn side(&self, side: ReplicaSide) -> &Snapshot {
        match side {
            ReplicaSide::Local => &self.local,
            ReplicaSide::Remote => &self.remote,
        }
    }
}

fn missing(what: impl Into<String>) -> SyncError {
    SyncError::exit(ExitInfo::new(ExitCode::DataError, ExitCause::NotFound), what)
}

fn to_system_time(value: SyncTime) -> SystemTime {
    if value >= 0 {
        UNIX_EPOCH + Duration::from_secs(value as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(value.unsigned_abs())
    }
}

/// Set a file's modification time to a replica timestamp
pub fn set_modified(path: &Path, value: SyncTime) -> io::Result<()> {
    let file = std::fs::OpenOptions::new().write(true).open(path)?;
    file.set_modified(to_system_time(value))
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(PARTIAL_SUFFIX);
    destination.with_file_name(name)
}

/// Job: one operation bound to its context
pub struct Job {
    op: PendingOperation,
    ctx: Arc<JobContext>,
    snapshots: CycleSnapshots,
}

impl Job {
    pub fn new(op: PendingOperation, ctx: Arc<JobContext>, snapshots: CycleSnapshots) -> Self {
        Self { op, ctx, snapshots }
    }

    pub fn operation(&self) -> &PendingOperation {
        &self.op
    }

    pub async fn run(self) -> Result<(), SyncError> {
        debug!(operation = %self.op, "Running job");
        match (self.op.kind, self.op.effect) {
            (OperationType::Create, OperationEffect::Apply) => self.create().await,
            (OperationType::Create, OperationEffect::DbOnly) => self.pair_existing(),
            (OperationType::Edit, OperationEffect::Apply) => self.edit().await,
            (OperationType::Edit, OperationEffect::DbOnly) => self.refresh_signature(),
            (OperationType::Delete, OperationEffect::Apply) => self.delete().await,
            (OperationType::Delete, OperationEffect::DbOnly) => self.forget(),
            (OperationType::Move, OperationEffect::Apply) => self.apply_move().await,
            (OperationType::Move, OperationEffect::DbOnly) => self.record_move(),
            (OperationType::Move, OperationEffect::Detach) => self.detach().await,
            (OperationType::Move, OperationEffect::Stage) => self.stage_move().await,
            (OperationType::Rights, _) => self.rights().await,
            (kind, effect) => Err(SyncError::exit(
                ExitInfo::new(ExitCode::LogicError, ExitCause::Unknown),
                format!("no job for {} with effect {:?}", kind, effect),
            )),
        }
    }

    fn db(&self) -> &dyn SyncDbStore {
        self.ctx.db.as_ref()
    }

    fn source_item(&self) -> Result<&SnapshotItem, SyncError> {
        self.snapshots
            .side(self.op.source_side)
            .get(&self.op.item_id)
            .ok_or_else(|| missing(format!("{} item {} is gone", self.op.source_side, self.op.item_id)))
    }

    fn pair(&self) -> Result<DbNode, SyncError> {
        let db_id = self
            .op
            .db_id
            .ok_or_else(|| missing(format!("operation {} has no pairing", self.op.id)))?;
        self.db()
            .get(db_id)?
            .ok_or_else(|| missing(format!("pairing {} is gone", db_id)))
    }

    /// Pair holding the source item's current parent
    fn parent_pair(&self, item: &SnapshotItem) -> Result<DbNode, SyncError> {
        let snapshot = self.snapshots.side(self.op.source_side);
        let parent = if item.parent_id == *snapshot.root_id() {
            self.db().get(ROOT_DB_ID)?
        } else {
            self.db().get_by_id(self.op.source_side, &item.parent_id)?
        };
        parent.ok_or_else(|| missing(format!("parent {} of {} is not synchronized", item.parent_id, item.id)))
    }

    fn side_id<'n>(node: &'n DbNode, side: ReplicaSide) -> Result<&'n str, SyncError> {
        node.id(side)
            .map(String::as_str)
            .ok_or_else(|| missing(format!("pairing {} has no {} id", node.db_id, side)))
    }

    fn local_path(&self, db_id: u64) -> Result<PathBuf, SyncError> {
        Ok(self.ctx.local_root.join(self.db().path(db_id, ReplicaSide::Local)?))
    }

    fn shared(&self, side: ReplicaSide) -> &SharedSnapshot {
        match side {
            ReplicaSide::Local => &self.ctx.local_snapshot,
            ReplicaSide::Remote => &self.ctx.remote_snapshot,
        }
    }

    fn observe(&self, side: ReplicaSide, item: SnapshotItem) {
        if let Err(e) = self.shared(side).write().upsert(item) {
            debug!(side = %side, error = %e, "Snapshot not updated after job, the observer will catch up");
        }
    }

    fn forget_observed(&self, side: ReplicaSide, id: &str) {
        let _ = self.shared(side).write().remove(id);
    }

    fn guard(&self, relative: impl Into<PathBuf>) -> SyncingGuard {
        SyncingGuard::begin(Arc::clone(&self.ctx.vfs), relative)
    }

    fn read_local(path: &Path, parent_id: &str) -> Result<SnapshotItem, SyncError> {
        local_item(path, parent_id).map_err(|e| SyncError::io(path, e))
    }

    fn hash_of(path: &Path, item: &SnapshotItem) -> Option<String> {
        if item.is_dir() {
            return None;
        }
        db::content_hash(path).ok()
    }

    /// Download a remote file next to `destination`, then move it in place
    async fn fetch(
        &self,
        remote_id: &str,
        destination: &Path,
        last_modified: SyncTime,
        progress: TransferProgress,
    ) -> Result<(), SyncError> {
        let partial = partial_path(destination);
        if let Err(e) = self.ctx.remote.download(remote_id, &partial, progress).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }
        tokio::fs::rename(&partial, destination)
            .await
            .map_err(|e| SyncError::io(destination, e))?;
        set_modified(destination, last_modified).map_err(|e| SyncError::io(destination, e))
    }

    async fn create(&self) -> Result<(), SyncError> {
        let item = self.source_item()?.clone();
        let parent = self.parent_pair(&item)?;
        let target = self.op.target_side;
        let guard = self.guard(self.op.path.clone());
        let progress = guard.transfer_progress(item.size.max(0) as u64);

        let (local, remote, local_path) = match target {
            ReplicaSide::Remote => {
                let parent_id = Self::side_id(&parent, ReplicaSide::Remote)?;
                let local_path = self.ctx.local_root.join(&self.op.path);
                let created = if item.is_dir() {
                    self.ctx.remote.create_directory(parent_id, &self.op.name).await?
                } else {
                    self.ctx
                        .remote
                        .upload(parent_id, &self.op.name, &local_path, item.last_modified, progress)
                        .await?
                };
                let remote = created.to_item();
                self.observe(ReplicaSide::Remote, remote.clone());
                (item, remote, local_path)
            }
            ReplicaSide::Local => {
                let parent_id = Self::side_id(&parent, ReplicaSide::Local)?.to_string();
                let destination = self.local_path(parent.db_id)?.join(&self.op.name);
                if item.is_dir() {
                    tokio::fs::create_dir(&destination)
                        .await
                        .map_err(|e| SyncError::io(&destination, e))?;
                } else {
                    self.fetch(&item.id, &destination, item.last_modified, progress).await?;
                }
                let local = Self::read_local(&destination, &parent_id)?;
                self.observe(ReplicaSide::Local, local.clone());
                (local, item, destination)
            }
        };

        let content_hash = Self::hash_of(&local_path, &local);
        match self.op.db_id {
            Some(db_id) => {
                let mut node = self.pair()?;
                let created = match target {
                    ReplicaSide::Local => &local,
                    ReplicaSide::Remote => &remote,
                };
                node.set_id(target, created.id.clone());
                node.set_name(target, &created.name);
                node.set_last_modified(ReplicaSide::Local, local.last_modified);
                node.set_last_modified(ReplicaSide::Remote, remote.last_modified);
                node.size = remote.size;
                node.content_hash = content_hash;
                self.db().update(&node)?;
                debug!(db_id, "Completed pairing");
            }
            None => {
                let mut node = DbNode::from_items(parent.db_id, &local, &remote);
                node.content_hash = content_hash;
                self.db().insert(node)?;
            }
        }
        guard.finish();
        info!(path = %self.op.path.display(), target = %target, "Created");
        Ok(())
    }

    /// Record a pairing for items created identically on both sides
    fn pair_existing(&self) -> Result<(), SyncError> {
        let item = self.source_item()?;
        let other_id = self
            .op
            .pair_with
            .as_deref()
            .ok_or_else(|| missing(format!("operation {} has nothing to pair with", self.op.id)))?;
        let other = self
            .snapshots
            .side(self.op.target_side)
            .get(other_id)
            .ok_or_else(|| missing(format!("{} item {} is gone", self.op.target_side, other_id)))?;
        let parent = self.parent_pair(item)?;
        let node = match self.op.source_side {
            ReplicaSide::Local => DbNode::from_items(parent.db_id, item, other),
            ReplicaSide::Remote => DbNode::from_items(parent.db_id, other, item),
        };
        let db_id = self.db().insert(node)?;
        debug!(db_id, path = %self.op.path.display(), "Paired items created on both sides");
        Ok(())
    }

    async fn edit(&self) -> Result<(), SyncError> {
        let item = self.source_item()?.clone();
        let mut node = self.pair()?;
        let guard = self.guard(self.op.path.clone());
        let progress = guard.transfer_progress(item.size.max(0) as u64);
        let local_path = self.local_path(node.db_id)?;

        match self.op.target_side {
            ReplicaSide::Remote => {
                let remote_id = Self::side_id(&node, ReplicaSide::Remote)?.to_string();
                let updated = self
                    .ctx
                    .remote
                    .upload_replace(&remote_id, &local_path, item.last_modified, progress)
                    .await?
                    .to_item();
                node.last_modified_local = item.last_modified;
                node.last_modified_remote = updated.last_modified;
                node.size = updated.size;
                node.created_at = updated.created_at;
                self.observe(ReplicaSide::Remote, updated);
            }
            ReplicaSide::Local => {
                self.fetch(&item.id, &local_path, item.last_modified, progress).await?;
                let parent_id = self
                    .ctx
                    .local_snapshot
                    .read()
                    .get(Self::side_id(&node, ReplicaSide::Local)?)
                    .map(|current| current.parent_id.clone());
                let parent_id = match parent_id {
                    Some(parent_id) => parent_id,
                    None => self.parent_pair(&item).and_then(|parent| {
                        Self::side_id(&parent, ReplicaSide::Local).map(str::to_string)
                    })?,
                };
                let local = Self::read_local(&local_path, &parent_id)?;
                node.last_modified_local = local.last_modified;
                node.last_modified_remote = item.last_modified;
                node.size = item.size;
                if Some(&local.id) != node.local_id.as_ref() {
                    // Replaced by rename, the inode changed
                    node.set_id(ReplicaSide::Local, local.id.clone());
                }
                self.observe(ReplicaSide::Local, local);
            }
        }
        node.content_hash = db::content_hash(&local_path).ok();
        self.db().update(&node)?;
        guard.finish();
        info!(path = %self.op.path.display(), target = %self.op.target_side, "Updated content");
        Ok(())
    }

    /// Both sides already agree; store their current signatures
    fn refresh_signature(&self) -> Result<(), SyncError> {
        let mut node = self.pair()?;
        for side in [ReplicaSide::Local, ReplicaSide::Remote] {
            if let Some(item) = node.id(side).and_then(|id| self.snapshots.side(side).get(id)) {
                node.set_last_modified(side, item.last_modified);
                if side == ReplicaSide::Remote {
                    node.size = item.size;
                }
            }
        }
        if !node.is_dir() {
            node.content_hash = db::content_hash(&self.local_path(node.db_id)?).ok();
        }
        self.db().update(&node)?;
        Ok(())
    }

    async fn delete(&self) -> Result<(), SyncError> {
        let node = self.pair()?;
        match self.op.target_side {
            ReplicaSide::Remote => {
                let remote_id = Self::side_id(&node, ReplicaSide::Remote)?.to_string();
                match self.ctx.remote.delete(&remote_id).await {
                    Ok(()) => {}
                    Err(e) if e.exit_info().cause == ExitCause::NotFound => {
                        debug!(remote_id = %remote_id, "Already deleted remotely");
                    }
                    Err(e) => return Err(e),
                }
                self.forget_observed(ReplicaSide::Remote, &remote_id);
            }
            ReplicaSide::Local => {
                let path = self.local_path(node.db_id)?;
                let removed = if node.is_dir() {
                    tokio::fs::remove_dir_all(&path).await
                } else {
                    tokio::fs::remove_file(&path).await
                };
                match removed {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(SyncError::io(&path, e)),
                }
                if let Some(local_id) = node.local_id.as_deref() {
                    self.forget_observed(ReplicaSide::Local, local_id);
                }
            }
        }
        self.db().remove_subtree(node.db_id)?;
        info!(path = %self.op.path.display(), target = %self.op.target_side, "Deleted");
        Ok(())
    }

    fn forget(&self) -> Result<(), SyncError> {
        let db_id = match self.op.db_id {
            Some(db_id) => db_id,
            None => return Ok(()),
        };
        let removed = self.db().remove_subtree(db_id)?;
        debug!(db_id, removed = removed.len(), "Forgot pairings");
        Ok(())
    }

    async fn apply_move(&self) -> Result<(), SyncError> {
        let item = self.source_item()?.clone();
        let mut node = self.pair()?;
        let destination = self.parent_pair(&item)?;
        let target = self.op.target_side;
        let mut guard = self.guard(self.db().path(node.db_id, ReplicaSide::Local)?);

        match target {
            ReplicaSide::Remote => {
                let remote_id = Self::side_id(&node, ReplicaSide::Remote)?.to_string();
                let mut moved = None;
                if destination.db_id != node.parent_db_id {
                    let parent_id = Self::side_id(&destination, ReplicaSide::Remote)?;
                    moved = Some(self.ctx.remote.move_item(&remote_id, parent_id).await?);
                }
                if node.remote_name != self.op.name {
                    moved = Some(self.ctx.remote.rename(&remote_id, &self.op.name).await?);
                }
                if let Some(moved) = moved {
                    self.observe(ReplicaSide::Remote, moved.to_item());
                }
            }
            ReplicaSide::Local => {
                let from = self.local_path(node.db_id)?;
                let to = self.local_path(destination.db_id)?.join(&self.op.name);
                tokio::fs::rename(&from, &to)
                    .await
                    .map_err(|e| SyncError::io(&from, e))?;
                let parent_id = Self::side_id(&destination, ReplicaSide::Local)?;
                let local = Self::read_local(&to, parent_id)?;
                self.observe(ReplicaSide::Local, local);
            }
        }

        node.parent_db_id = destination.db_id;
        node.set_name(self.op.source_side, &item.name);
        node.set_name(target, &self.op.name);
        self.db().update(&node)?;
        guard.retarget(self.op.path.clone());
        guard.finish();
        info!(path = %self.op.path.display(), target = %target, "Moved");
        Ok(())
    }

    /// Park an item under a temporary name in its current parent so another
    /// move can take its name
    async fn stage_move(&self) -> Result<(), SyncError> {
        let mut node = self.pair()?;
        let target = self.op.target_side;
        match target {
            ReplicaSide::Remote => {
                let remote_id = Self::side_id(&node, ReplicaSide::Remote)?.to_string();
                let renamed = self.ctx.remote.rename(&remote_id, &self.op.name).await?;
                self.observe(ReplicaSide::Remote, renamed.to_item());
            }
            ReplicaSide::Local => {
                let from = self.local_path(node.db_id)?;
                let to = from.with_file_name(&self.op.name);
                tokio::fs::rename(&from, &to)
                    .await
                    .map_err(|e| SyncError::io(&from, e))?;
                let parent = self
                    .db()
                    .get(node.parent_db_id)?
                    .ok_or_else(|| missing(format!("pairing {} is gone", node.parent_db_id)))?;
                let local = Self::read_local(&to, Self::side_id(&parent, ReplicaSide::Local)?)?;
                self.observe(ReplicaSide::Local, local);
            }
        }
        // Only the target side changed; the source name stays as last synced
        node.set_name(target, &self.op.name);
        self.db().update(&node)?;
        debug!(path = %self.op.path.display(), staged = %self.op.name, target = %target, "Moved aside");
        Ok(())
    }

    /// Both sides moved to the same place; update the pairing only
    fn record_move(&self) -> Result<(), SyncError> {
        let item = self.source_item()?;
        let mut node = self.pair()?;
        let destination = self.parent_pair(item)?;
        node.parent_db_id = destination.db_id;
        for side in [ReplicaSide::Local, ReplicaSide::Remote] {
            if let Some(current) = node.id(side).and_then(|id| self.snapshots.side(side).get(id)) {
                let name = current.name.clone();
                node.set_name(side, &name);
            }
        }
        self.db().update(&node)?;
        Ok(())
    }

    /// Rename an item on its own replica and drop that side of its pairing
    async fn detach(&self) -> Result<(), SyncError> {
        let item = self.source_item()?.clone();
        let side = self.op.source_side;
        match side {
            ReplicaSide::Local => {
                let from = self.ctx.local_root.join(&self.op.path);
                let to = from.with_file_name(&self.op.name);
                tokio::fs::rename(&from, &to)
                    .await
                    .map_err(|e| SyncError::io(&from, e))?;
                let renamed = Self::read_local(&to, &item.parent_id)?;
                self.observe(ReplicaSide::Local, renamed);
            }
            ReplicaSide::Remote => {
                let renamed = self.ctx.remote.rename(&item.id, &self.op.name).await?;
                self.observe(ReplicaSide::Remote, renamed.to_item());
            }
        }
        if self.op.db_id.is_some() {
            let mut node = self.pair()?;
            node.clear_id(side);
            self.db().update(&node)?;
        }
        info!(side = %side, from = %item.name, to = %self.op.name, "Kept conflicting copy");
        Ok(())
    }

    /// Remote write capability reflected on the local file
    async fn rights(&self) -> Result<(), SyncError> {
        let item = self.source_item()?.clone();
        let mut node = self.pair()?;
        let path = self.local_path(node.db_id)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| SyncError::io(&path, e))?;
        let mut permissions = metadata.permissions();
        #[allow(clippy::permissions_set_readonly_false)]
        permissions.set_readonly(!item.can_write);
        tokio::fs::set_permissions(&path, permissions)
            .await
            .map_err(|e| SyncError::io(&path, e))?;
        node.can_write = item.can_write;
        self.db().update(&node)?;
        debug!(path = %path.display(), can_write = item.can_write, "Applied rights");
        Ok(())
    }
}
