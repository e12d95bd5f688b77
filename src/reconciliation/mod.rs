//! Reconciliation
//!
//! Turns the delta between the two snapshots and the sync database into a
//! finite list of [`PendingOperation`]s. One call runs the cycle's phases in
//! order: platform-inconsistency check, conflict detection, conflict
//! resolution and operation generation. Exploration happens before, in the
//! observers; this module only reads frozen snapshots.

pub mod changes;
pub mod conflict;
pub mod operation;
pub mod platform;

pub use changes::{detect_changes, ContentProbe, LocalContentProbe, PairChange, SideChanges, SignatureOnly};
pub use conflict::{
    conflict_name, ConflictKind, ConflictPolicy, ConflictReport, ConflictSink, LogConflictSink,
    RecordingConflictSink, Resolution,
};
pub use operation::{OperationEffect, PairKey, PendingOperation};
pub use platform::{check_name, InvalidNameReason, TargetPlatform, UnsyncableItem};

use crate::config::ReconciliationConfig;
use crate::db::{DbIndex, DbNode, ROOT_DB_ID};
use crate::error::{SnapshotError, SyncError};
use crate::snapshot::{NameCaseRule, Snapshot, SnapshotItem};
use crate::types::{NodeId, OperationType, ReplicaSide, SyncPath};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};

/// Result of one reconciliation pass
#[derive(Debug, Clone, Default)]
pub struct ReconciliationOutcome {
    pub operations: Vec<PendingOperation>,
    pub conflicts: Vec<ConflictReport>,
    pub unsyncable: Vec<UnsyncableItem>,
}

/// A delete cancelled in favor of recreating the other side's version
#[derive(Debug, Clone)]
struct Recreation {
    deleting: ReplicaSide,
    db_id: u64,
    kind: ConflictKind,
    /// Items of the surviving side to recreate, parents first
    items: Vec<NodeId>,
}

/// Reconciler: one pass over frozen snapshots and the database
pub struct Reconciler<'a> {
    local: &'a Snapshot,
    remote: &'a Snapshot,
    db: &'a DbIndex,
    config: &'a ReconciliationConfig,
    sink: &'a dyn ConflictSink,
    local_probe: &'a dyn ContentProbe,
    now: DateTime<Utc>,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        local: &'a Snapshot,
        remote: &'a Snapshot,
        db: &'a DbIndex,
        config: &'a ReconciliationConfig,
        sink: &'a dyn ConflictSink,
    ) -> Self {
        Self {
            local,
            remote,
            db,
            config,
            sink,
            local_probe: &SignatureOnly,
            now: Utc::now(),
        }
    }

    /// Hash local files to tell touched files from edited ones
    pub fn with_content_probe(mut self, probe: &'a dyn ContentProbe) -> Self {
        self.local_probe = probe;
        self
    }

    /// Clock used for conflict suffixes
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn reconcile(&self) -> Result<ReconciliationOutcome, SyncError> {
        for snapshot in [self.local, self.remote] {
            if !snapshot.is_valid() {
                return Err(SnapshotError::Invalidated.into());
            }
        }

        // Platform-inconsistency check: local names must fit the remote's rules
        // and remote names the local file system's.
        let (mut unsyncable, local_excluded) =
            platform::check_snapshot(self.local, self.config.target_platform);
        let (remote_unsyncable, remote_excluded) =
            platform::check_snapshot(self.remote, TargetPlatform::local());
        unsyncable.extend(remote_unsyncable);
        for item in &unsyncable {
            info!(side = %item.side, path = %item.path.display(), reason = %item.reason, "Item is unsyncable");
        }

        // Conflict detection
        let local_changes = detect_changes(self.local, self.db, &local_excluded, self.local_probe);
        let remote_changes = detect_changes(self.remote, self.db, &remote_excluded, &SignatureOnly);
        info!(
            local = local_changes.len(),
            remote = remote_changes.len(),
            "Change detection complete"
        );

        let mut generation = Generation::new(self, local_excluded, remote_excluded);
        generation.complete_half_pairs();
        let recreations = generation.plan_recreations(&local_changes, &remote_changes);
        generation.process_pairs(&local_changes, &remote_changes);
        generation.emit_recreations(recreations);
        generation.process_creates(&local_changes, &remote_changes);

        info!(
            operations = generation.ops.len(),
            conflicts = generation.conflicts.len(),
            unsyncable = unsyncable.len(),
            "Reconciliation complete"
        );
        Ok(ReconciliationOutcome {
            operations: generation.ops,
            conflicts: generation.conflicts,
            unsyncable,
        })
    }
}

/// Mutable state of operation generation
struct Generation<'r, 'a> {
    r: &'r Reconciler<'a>,
    ops: Vec<PendingOperation>,
    conflicts: Vec<ConflictReport>,
    excluded: [HashSet<NodeId>; 2],
    /// Keys of items without a usable pairing this cycle
    keys: HashMap<(ReplicaSide, NodeId), PairKey>,
    next_key: u32,
    handled_pairs: HashSet<u64>,
    handled_items: HashSet<(ReplicaSide, NodeId)>,
    move_ops: HashMap<u64, usize>,
    /// Directory keys some Create provides this cycle
    provided: HashSet<PairKey>,
    compare_rule: NameCaseRule,
}

fn side_index(side: ReplicaSide) -> usize {
    match side {
        ReplicaSide::Local => 0,
        ReplicaSide::Remote => 1,
    }
}

impl<'r, 'a> Generation<'r, 'a> {
    fn new(r: &'r Reconciler<'a>, local_excluded: HashSet<NodeId>, remote_excluded: HashSet<NodeId>) -> Self {
        let compare_rule = if r.local.case_rule() == NameCaseRule::Insensitive
            || r.remote.case_rule() == NameCaseRule::Insensitive
        {
            NameCaseRule::Insensitive
        } else {
            NameCaseRule::Sensitive
        };
        Self {
            r,
            ops: Vec::new(),
            conflicts: Vec::new(),
            excluded: [local_excluded, remote_excluded],
            keys: HashMap::new(),
            next_key: 0,
            handled_pairs: HashSet::new(),
            handled_items: HashSet::new(),
            move_ops: HashMap::new(),
            provided: HashSet::new(),
            compare_rule,
        }
    }

    fn snapshot(&self, side: ReplicaSide) -> &'a Snapshot {
        match side {
            ReplicaSide::Local => self.r.local,
            ReplicaSide::Remote => self.r.remote,
        }
    }

    fn is_excluded(&self, side: ReplicaSide, id: &str) -> bool {
        self.excluded[side_index(side)].contains(id)
    }

    fn item(&self, side: ReplicaSide, id: &str) -> Option<&'a SnapshotItem> {
        self.snapshot(side).get(id)
    }

    fn path(&self, side: ReplicaSide, id: &str) -> SyncPath {
        self.snapshot(side)
            .path(id)
            .map(|(path, _)| path)
            .unwrap_or_default()
    }

    fn fresh_key(&mut self) -> PairKey {
        let key = PairKey::New(self.next_key);
        self.next_key += 1;
        key
    }

    /// Pair identity of an item: root, a key assigned this cycle, its pairing, or a new key
    fn pair_key(&mut self, side: ReplicaSide, id: &str) -> PairKey {
        if id == self.snapshot(side).root_id().as_str() {
            return PairKey::Db(ROOT_DB_ID);
        }
        if let Some(key) = self.keys.get(&(side, id.to_string())) {
            return *key;
        }
        if let Some(node) = self.r.db.by_id(side, id) {
            return PairKey::Db(node.db_id);
        }
        let key = self.fresh_key();
        self.keys.insert((side, id.to_string()), key);
        key
    }

    fn push(&mut self, mut op: PendingOperation) -> usize {
        op.id = self.ops.len();
        if op.kind == OperationType::Create && op.is_dir() {
            self.provided.insert(op.node);
        }
        debug!(operation = %op, "Generated operation");
        self.ops.push(op);
        self.ops.len() - 1
    }

    fn report(&mut self, kind: ConflictKind, path: SyncPath, winner: ReplicaSide, resolution: Resolution) {
        let report = ConflictReport {
            kind,
            path,
            winner,
            resolution,
        };
        self.r.sink.report(&report);
        self.conflicts.push(report);
    }

    fn create_op(&mut self, source: ReplicaSide, item: &SnapshotItem, db_id: Option<u64>) -> PendingOperation {
        let node = match db_id {
            Some(db_id) => PairKey::Db(db_id),
            None => self.pair_key(source, &item.id),
        };
        PendingOperation {
            id: 0,
            kind: OperationType::Create,
            effect: OperationEffect::Apply,
            source_side: source,
            target_side: source.other(),
            item_id: item.id.clone(),
            node_type: item.node_type,
            db_id,
            node,
            parent: self.pair_key(source, &item.parent_id),
            name: item.name.clone(),
            previous: None,
            pair_with: None,
            path: self.path(source, &item.id),
            depends_on: Vec::new(),
        }
    }

    fn pair_op(&self, kind: OperationType, source: ReplicaSide, node: &DbNode, effect: OperationEffect) -> PendingOperation {
        let target = source.other();
        PendingOperation {
            id: 0,
            kind,
            effect,
            source_side: source,
            target_side: target,
            item_id: node.id(source).cloned().unwrap_or_default(),
            node_type: node.node_type,
            db_id: Some(node.db_id),
            node: PairKey::Db(node.db_id),
            parent: PairKey::Db(node.parent_db_id),
            name: node.name(target).to_string(),
            previous: None,
            pair_with: None,
            path: self.r.db.path(node.db_id, source),
            depends_on: Vec::new(),
        }
    }

    fn move_op(&mut self, source: ReplicaSide, item: &SnapshotItem, node: &DbNode, effect: OperationEffect) -> PendingOperation {
        let target = source.other();
        let mut op = self.pair_op(OperationType::Move, source, node, effect);
        op.parent = self.pair_key(source, &item.parent_id);
        op.name = item.name.clone();
        op.previous = Some((PairKey::Db(node.parent_db_id), node.name(target).to_string()));
        op.path = self.path(source, &item.id);
        op
    }

    /// Rename an item in place on its own side, dropping that side of its pairing
    fn detach_op(&mut self, side: ReplicaSide, item: &SnapshotItem, db_id: Option<u64>) -> PendingOperation {
        let parent = self.pair_key(side, &item.parent_id);
        let node = match db_id {
            Some(db_id) => PairKey::Db(db_id),
            None => self.pair_key(side, &item.id),
        };
        PendingOperation {
            id: 0,
            kind: OperationType::Move,
            effect: OperationEffect::Detach,
            source_side: side,
            target_side: side,
            item_id: item.id.clone(),
            node_type: item.node_type,
            db_id,
            node,
            parent,
            name: conflict_name(&item.name, self.r.now),
            previous: Some((parent, item.name.clone())),
            pair_with: None,
            path: self.path(side, &item.id),
            depends_on: Vec::new(),
        }
    }

    /// Pairs that lost one side (an interrupted conflict resolution) get the
    /// surviving side recreated.
    fn complete_half_pairs(&mut self) {
        let db = self.r.db;
        for node in db.nodes() {
            if node.db_id == ROOT_DB_ID {
                continue;
            }
            let source = match (&node.local_id, &node.remote_id) {
                (Some(_), None) => ReplicaSide::Local,
                (None, Some(_)) => ReplicaSide::Remote,
                _ => continue,
            };
            self.handled_pairs.insert(node.db_id);
            let id = match node.id(source) {
                Some(id) => id.clone(),
                None => continue,
            };
            if self.is_excluded(source, &id) {
                continue;
            }
            if let Some(item) = self.item(source, &id) {
                let op = self.create_op(source, item, Some(node.db_id));
                self.push(op);
                self.handled_items.insert((source, id));
            }
        }
    }

    /// Conflict resolution for deletes that meet changes on the other side
    fn plan_recreations(&mut self, local: &SideChanges, remote: &SideChanges) -> Vec<Recreation> {
        let mut recreations = Vec::new();
        for (deleting, other_changes, deleting_changes) in [
            (ReplicaSide::Local, remote, local),
            (ReplicaSide::Remote, local, remote),
        ] {
            let surviving = deleting.other();
            let surviving_snapshot = self.snapshot(surviving);
            let deleting_snapshot = self.snapshot(deleting);

            // Surviving-side items carrying changes that must not be lost
            let mut active: Vec<NodeId> = other_changes
                .creates
                .iter()
                .filter(|id| !self.is_excluded(surviving, id))
                .cloned()
                .collect();
            for (db_id, change) in &other_changes.pairs {
                if change.is_active() {
                    if let Some(id) = self.r.db.get(*db_id).and_then(|node| node.id(surviving)) {
                        active.push(id.clone());
                    }
                }
            }

            // Top-down so an enclosing recreation absorbs nested ones
            let mut candidates: Vec<(usize, u64)> = deleting_changes
                .pairs
                .iter()
                .filter(|(db_id, change)| change.deleted && !other_changes.pair(**db_id).deleted)
                .map(|(db_id, _)| (self.r.db.path(*db_id, deleting).components().count(), *db_id))
                .collect();
            candidates.sort_unstable();

            for (_, db_id) in candidates {
                if self.handled_pairs.contains(&db_id) {
                    continue;
                }
                let node = match self.r.db.get(db_id) {
                    Some(node) => node,
                    None => continue,
                };
                let surviving_id = match node.id(surviving) {
                    Some(id) if surviving_snapshot.contains(id) => id.clone(),
                    _ => continue,
                };
                if self.is_excluded(surviving, &surviving_id) {
                    continue;
                }

                let own = other_changes.pair(db_id);
                let kind = if own.edited {
                    ConflictKind::EditDelete
                } else if own.moved {
                    ConflictKind::MoveDelete
                } else if node.is_dir()
                    && active.iter().any(|id| {
                        id != &surviving_id && surviving_snapshot.is_ancestor_or_self(&surviving_id, id)
                    })
                {
                    ConflictKind::ParentDelete
                } else {
                    continue;
                };

                // Items still alive on the deleting side were moved out before the
                // delete; they keep their pairing and are not recreated.
                let mut items = Vec::new();
                let mut skipped_roots: Vec<NodeId> = Vec::new();
                for id in surviving_snapshot.subtree(&surviving_id) {
                    if skipped_roots
                        .iter()
                        .any(|root| surviving_snapshot.is_ancestor_or_self(root, &id))
                    {
                        continue;
                    }
                    let alive_elsewhere = self
                        .r
                        .db
                        .by_id(surviving, &id)
                        .and_then(|pair| pair.id(deleting))
                        .map(|deleting_id| deleting_snapshot.contains(deleting_id))
                        .unwrap_or(false);
                    if alive_elsewhere || self.is_excluded(surviving, &id) {
                        skipped_roots.push(id);
                        continue;
                    }
                    items.push(id);
                }

                for pair_id in self.r.db.subtree(db_id) {
                    let alive = self
                        .r
                        .db
                        .get(pair_id)
                        .and_then(|pair| pair.id(deleting))
                        .map(|id| deleting_snapshot.contains(id))
                        .unwrap_or(false);
                    if !alive {
                        self.handled_pairs.insert(pair_id);
                    }
                }
                for id in &items {
                    self.handled_items.insert((surviving, id.clone()));
                    let key = self.fresh_key();
                    self.keys.insert((surviving, id.clone()), key);
                }
                recreations.push(Recreation {
                    deleting,
                    db_id,
                    kind,
                    items,
                });
            }
        }
        recreations
    }

    fn process_pairs(&mut self, local: &SideChanges, remote: &SideChanges) {
        let db_ids: Vec<u64> = local
            .pairs
            .keys()
            .chain(remote.pairs.keys())
            .copied()
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .filter(|db_id| !self.handled_pairs.contains(db_id))
            .collect();

        let total = db_ids.len();
        let batch_size = self.r.config.batch_size.max(1);
        for (index, batch) in db_ids.chunks(batch_size).enumerate() {
            for db_id in batch {
                self.process_pair(*db_id, local.pair(*db_id), remote.pair(*db_id));
            }
            info!(
                processed = (index * batch_size + batch.len()).min(total),
                total,
                operations = self.ops.len(),
                "Generated operations for changed pairs"
            );
        }
    }

    fn process_pair(&mut self, db_id: u64, l: PairChange, r: PairChange) {
        let node = match self.r.db.get(db_id) {
            Some(node) => node,
            None => return,
        };

        // Both deleted: nothing left to propagate
        if l.deleted && r.deleted {
            if !(l.nested_delete && r.nested_delete) {
                let op = self.pair_op(OperationType::Delete, ReplicaSide::Local, node, OperationEffect::DbOnly);
                self.push(op);
            }
            return;
        }
        for (deleting, change) in [(ReplicaSide::Local, l), (ReplicaSide::Remote, r)] {
            if change.deleted {
                // Surviving-side changes would have planned a recreation
                if !change.nested_delete {
                    let op = self.pair_op(OperationType::Delete, deleting, node, OperationEffect::Apply);
                    self.push(op);
                }
                return;
            }
        }

        let local_item = node.local_id.as_deref().and_then(|id| self.item(ReplicaSide::Local, id));
        let remote_item = node.remote_id.as_deref().and_then(|id| self.item(ReplicaSide::Remote, id));
        let (local_item, remote_item) = match (local_item, remote_item) {
            (Some(local_item), Some(remote_item)) => (local_item, remote_item),
            _ => return,
        };

        // Moves
        if l.moved && r.moved {
            let local_parent = self.pair_key(ReplicaSide::Local, &local_item.parent_id);
            let remote_parent = self.pair_key(ReplicaSide::Remote, &remote_item.parent_id);
            let path = self.path(ReplicaSide::Local, &local_item.id);
            if local_parent == remote_parent
                && self.compare_rule.same_name(&local_item.name, &remote_item.name)
            {
                let op = self.move_op(ReplicaSide::Local, local_item, node, OperationEffect::DbOnly);
                let id = self.push(op);
                self.move_ops.insert(db_id, id);
                self.report(ConflictKind::MoveMove, path, ReplicaSide::Remote, Resolution::AlreadyInSync);
            } else {
                let winner = self.r.config.conflict_policy.winner(local_item, remote_item);
                let winner_item = match winner {
                    ReplicaSide::Local => local_item,
                    ReplicaSide::Remote => remote_item,
                };
                let op = self.move_op(winner, winner_item, node, OperationEffect::Apply);
                let id = self.push(op);
                self.move_ops.insert(db_id, id);
                self.report(ConflictKind::MoveMove, path, winner, Resolution::WinnerMoveApplied);
            }
        } else if l.moved || r.moved {
            let (source, item) = if l.moved {
                (ReplicaSide::Local, local_item)
            } else {
                (ReplicaSide::Remote, remote_item)
            };
            let op = self.move_op(source, item, node, OperationEffect::Apply);
            let id = self.push(op);
            self.move_ops.insert(db_id, id);
        }

        // Content
        if l.edited && r.edited {
            let path = self.path(ReplicaSide::Local, &local_item.id);
            if local_item.size == remote_item.size && local_item.last_modified == remote_item.last_modified {
                let op = self.pair_op(OperationType::Edit, ReplicaSide::Remote, node, OperationEffect::DbOnly);
                self.push(op);
                self.report(ConflictKind::EditEdit, path, ReplicaSide::Remote, Resolution::AlreadyInSync);
            } else {
                let winner = self.r.config.conflict_policy.winner(local_item, remote_item);
                let (winner_item, loser_item) = match winner {
                    ReplicaSide::Local => (local_item, remote_item),
                    ReplicaSide::Remote => (remote_item, local_item),
                };
                let detach = self.detach_op(winner.other(), loser_item, Some(db_id));
                let renamed_to = detach.name.clone();
                let detach_id = self.push(detach);
                let mut create = self.create_op(winner, winner_item, Some(db_id));
                create.depends_on.push(detach_id);
                self.push(create);
                self.report(ConflictKind::EditEdit, path, winner, Resolution::KeptBoth { renamed_to });
            }
        } else if l.edited || r.edited {
            let source = if l.edited { ReplicaSide::Local } else { ReplicaSide::Remote };
            let op = self.pair_op(OperationType::Edit, source, node, OperationEffect::Apply);
            self.push(op);
        } else if l.touched || r.touched {
            let source = if l.touched { ReplicaSide::Local } else { ReplicaSide::Remote };
            let op = self.pair_op(OperationType::Edit, source, node, OperationEffect::DbOnly);
            self.push(op);
        }

        if r.rights {
            let op = self.pair_op(OperationType::Rights, ReplicaSide::Remote, node, OperationEffect::Apply);
            self.push(op);
        }
    }

    fn emit_recreations(&mut self, recreations: Vec<Recreation>) {
        for recreation in recreations {
            let node = match self.r.db.get(recreation.db_id) {
                Some(node) => node,
                None => continue,
            };
            let surviving = recreation.deleting.other();
            let path = self.r.db.path(recreation.db_id, surviving);

            let mut forget = self.pair_op(OperationType::Delete, recreation.deleting, node, OperationEffect::DbOnly);
            // Pairs moved out of the subtree must leave it before it is forgotten
            for pair_id in self.r.db.subtree(recreation.db_id) {
                if let Some(move_id) = self.move_ops.get(&pair_id) {
                    forget.depends_on.push(*move_id);
                }
            }
            let forget_id = self.push(forget);

            for id in &recreation.items {
                if let Some(item) = self.item(surviving, id) {
                    let mut create = self.create_op(surviving, item, None);
                    create.depends_on.push(forget_id);
                    self.push(create);
                }
            }
            self.report(recreation.kind, path, surviving, Resolution::Recreated);
        }
    }

    fn sorted_creates(&self, changes: &SideChanges) -> Vec<&'a SnapshotItem> {
        let side = changes.side;
        let mut items: Vec<(usize, &'a SnapshotItem)> = changes
            .creates
            .iter()
            .filter(|id| !self.handled_items.contains(&(side, (*id).clone())))
            .filter_map(|id| self.item(side, id))
            .map(|item| (self.path(side, &item.id).components().count(), item))
            .collect();
        items.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.name.cmp(&b.1.name)));
        items.into_iter().map(|(_, item)| item).collect()
    }

    fn process_creates(&mut self, local: &SideChanges, remote: &SideChanges) {
        let local_items = self.sorted_creates(local);
        let remote_items = self.sorted_creates(remote);

        // Register local creates by destination slot
        let mut slots: HashMap<(PairKey, String), &'a SnapshotItem> = HashMap::new();
        for item in &local_items {
            self.pair_key(ReplicaSide::Local, &item.id);
            let parent = self.pair_key(ReplicaSide::Local, &item.parent_id);
            slots.insert((parent, self.compare_rule.key(&item.name)), *item);
        }

        // Match remote creates against them
        let mut skipped: HashSet<(ReplicaSide, NodeId)> = HashSet::new();
        let mut remote_pending = Vec::new();
        for item in remote_items {
            if skipped.contains(&(ReplicaSide::Remote, item.id.clone())) {
                continue;
            }
            let parent = self.pair_key(ReplicaSide::Remote, &item.parent_id);
            let slot = (parent, self.compare_rule.key(&item.name));
            let local_item = match slots.get(&slot) {
                Some(local_item) if !skipped.contains(&(ReplicaSide::Local, local_item.id.clone())) => *local_item,
                _ => {
                    remote_pending.push(item);
                    continue;
                }
            };
            let path = self.path(ReplicaSide::Local, &local_item.id);

            if local_item.is_dir() && item.is_dir() {
                let key = self.pair_key(ReplicaSide::Local, &local_item.id);
                self.keys.insert((ReplicaSide::Remote, item.id.clone()), key);
                let mut op = self.create_op(ReplicaSide::Local, local_item, None);
                op.effect = OperationEffect::DbOnly;
                op.pair_with = Some(item.id.clone());
                self.push(op);
                skipped.insert((ReplicaSide::Local, local_item.id.clone()));
                self.report(ConflictKind::CreateCreate, path, ReplicaSide::Remote, Resolution::Merged);
                continue;
            }

            let winner = self.r.config.conflict_policy.winner(local_item, item);
            let (winner_item, loser_item) = match winner {
                ReplicaSide::Local => (local_item, item),
                ReplicaSide::Remote => (item, local_item),
            };
            let loser = winner.other();
            // The renamed loser is picked up as a fresh create next cycle
            for id in self.snapshot(loser).subtree(&loser_item.id) {
                skipped.insert((loser, id));
            }
            let detach = self.detach_op(loser, loser_item, None);
            let renamed_to = detach.name.clone();
            let detach_id = self.push(detach);
            let mut create = self.create_op(winner, winner_item, None);
            create.depends_on.push(detach_id);
            self.push(create);
            skipped.insert((winner, winner_item.id.clone()));
            self.report(ConflictKind::CreateCreate, path, winner, Resolution::KeptBoth { renamed_to });
        }

        for (side, items) in [(ReplicaSide::Local, local_items), (ReplicaSide::Remote, remote_pending)] {
            for item in items {
                if skipped.contains(&(side, item.id.clone())) {
                    continue;
                }
                let parent = self.pair_key(side, &item.parent_id);
                if matches!(parent, PairKey::New(_)) && !self.provided.contains(&parent) {
                    debug!(side = %side, id = %item.id, "Parent is not created this cycle, deferring");
                    for id in self.snapshot(side).subtree(&item.id) {
                        skipped.insert((side, id));
                    }
                    continue;
                }
                let op = self.create_op(side, item, None);
                self.push(op);
            }
        }
    }
}

/// Group operations by kind, for logs and the CLI
pub fn summarize(operations: &[PendingOperation]) -> BTreeMap<OperationType, usize> {
    let mut summary = BTreeMap::new();
    for op in operations {
        *summary.entry(op.kind).or_insert(0) += 1;
    }
    summary
}
