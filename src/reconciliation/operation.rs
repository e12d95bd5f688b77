//! Pending operations produced by reconciliation.

use crate::types::{NodeId, NodeType, OperationType, ReplicaSide, SyncPath};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a synchronized pair within one cycle: an existing database
/// pairing, or one that this cycle's operations will create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PairKey {
    Db(u64),
    New(u32),
}

/// What executing an operation touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationEffect {
    /// Side effect on the target replica, then a database update
    Apply,
    /// Database update only; both replicas already agree
    DbOnly,
    /// Rename on the item's own replica and drop its side of the pairing
    Detach,
    /// Rename on the target replica to a temporary name in the current
    /// parent; the final move follows as a separate operation
    Stage,
}

/// PendingOperation: one confirmed delta, living for one propagation cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: usize,
    pub kind: OperationType,
    pub effect: OperationEffect,
    pub source_side: ReplicaSide,
    pub target_side: ReplicaSide,
    /// Id of the item on the source side
    pub item_id: NodeId,
    pub node_type: NodeType,
    /// Existing pairing, if any
    pub db_id: Option<u64>,
    pub node: PairKey,
    /// Destination parent for Create and Move, current parent otherwise
    pub parent: PairKey,
    /// Name on the target side after the operation
    pub name: String,
    /// Origin of a Move
    pub previous: Option<(PairKey, String)>,
    /// Target-side id to pair with, for directories created on both sides
    pub pair_with: Option<NodeId>,
    /// Source-side path, for logging and status
    pub path: SyncPath,
    pub depends_on: Vec<usize>,
}

impl PendingOperation {
    pub fn is_dir(&self) -> bool {
        self.node_type.is_dir()
    }
}

impl fmt::Display for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} {} {} -> {} ({:?})",
            self.id,
            self.kind,
            self.path.display(),
            self.source_side,
            self.target_side,
            self.effect
        )
    }
}
