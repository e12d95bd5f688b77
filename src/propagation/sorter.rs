//! Operation sorter
//!
//! Orders a cycle's operations so every operation runs after the ones it
//! needs. Constraints come from the operations themselves (explicit
//! `depends_on`) and from the tree:
//!
//! - a directory must exist before anything is created or moved into it
//! - a child is deleted before its parent
//! - an item moved out of a directory leaves before the directory is deleted
//! - a name is freed (delete, move away) before it is taken (create, move in)
//!
//! The order is a stable topological sort: among ready operations the lowest
//! id goes first, so the output is deterministic.
//!
//! Moves that wait on each other's names (a swap, or a longer rotation) are
//! broken up: one of them is first renamed to a temporary name in its current
//! parent, and the final move runs once the others are done.

use crate::error::SyncError;
use crate::reconciliation::{OperationEffect, PairKey, PendingOperation};
use crate::snapshot::NameCaseRule;
use crate::types::{OperationType, ReplicaSide};
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use tracing::{debug, error};

/// Name slot on one replica: (side, parent, name key)
type Slot = (ReplicaSide, PairKey, String);

/// Case rules used to compare names on each replica
#[derive(Debug, Clone, Copy)]
pub struct SortRules {
    pub local: NameCaseRule,
    pub remote: NameCaseRule,
}

impl SortRules {
    fn key(&self, side: ReplicaSide, name: &str) -> String {
        match side {
            ReplicaSide::Local => self.local.key(name),
            ReplicaSide::Remote => self.remote.key(name),
        }
    }
}

impl Default for SortRules {
    fn default() -> Self {
        Self {
            local: NameCaseRule::for_local_platform(),
            remote: NameCaseRule::Sensitive,
        }
    }
}

fn touches_replica(op: &PendingOperation) -> bool {
    op.effect != OperationEffect::DbOnly
}

/// Slot an operation vacates on its target replica
fn freed_slot(op: &PendingOperation, rules: &SortRules) -> Option<Slot> {
    if !touches_replica(op) {
        return None;
    }
    match op.kind {
        OperationType::Delete => Some((op.target_side, op.parent, rules.key(op.target_side, &op.name))),
        OperationType::Move => op
            .previous
            .as_ref()
            .map(|(parent, name)| (op.target_side, *parent, rules.key(op.target_side, name))),
        _ => None,
    }
}

/// Slot an operation occupies on its target replica
fn taken_slot(op: &PendingOperation, rules: &SortRules) -> Option<Slot> {
    if !touches_replica(op) {
        return None;
    }
    match op.kind {
        OperationType::Create | OperationType::Move => {
            Some((op.target_side, op.parent, rules.key(op.target_side, &op.name)))
        }
        _ => None,
    }
}

/// Infix of the temporary name an item holds while a cycle of moves resolves
pub const STAGING_INFIX: &str = ".syncore-move-";

/// Result of one ordering attempt
enum Ordering {
    Sorted {
        order: Vec<usize>,
        predecessors: Vec<BTreeSet<usize>>,
    },
    Stuck(Vec<usize>),
}

/// Sort `operations` and fill each one's `depends_on` with its direct
/// predecessors. Fails with [`SyncError::DependencyCycle`] when the
/// constraints cannot be satisfied even after staging moves.
pub fn sort_operations(
    mut operations: Vec<PendingOperation>,
    rules: &SortRules,
) -> Result<Vec<PendingOperation>, SyncError> {
    let mut staged = 0usize;
    loop {
        match order_operations(&operations, rules) {
            Ordering::Sorted { order, predecessors } => {
                if staged > 0 {
                    debug!(staged, "Broke move cycles with temporary names");
                }
                return Ok(apply_order(operations, order, predecessors));
            }
            Ordering::Stuck(stuck) => match stageable_move(&operations, &stuck, rules) {
                Some(index) if staged < operations.len() => {
                    stage_move(&mut operations, index);
                    staged += 1;
                }
                _ => {
                    error!(stuck = stuck.len(), total = operations.len(), "Pending operations form a dependency cycle");
                    return Err(SyncError::DependencyCycle(stuck.len()));
                }
            },
        }
    }
}

fn order_operations(operations: &[PendingOperation], rules: &SortRules) -> Ordering {
    let count = operations.len();
    let position: HashMap<usize, usize> = operations
        .iter()
        .enumerate()
        .map(|(index, op)| (op.id, index))
        .collect();

    // predecessors[i]: indexes that must run before i
    let mut predecessors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); count];

    let mut dir_creates: HashMap<PairKey, Vec<usize>> = HashMap::new();
    let mut deletes: HashMap<(ReplicaSide, PairKey), Vec<usize>> = HashMap::new();
    let frees = freed_slots(operations, rules);
    for (index, op) in operations.iter().enumerate() {
        if op.kind == OperationType::Create && op.is_dir() {
            dir_creates.entry(op.node).or_default().push(index);
        }
        if op.kind == OperationType::Delete && touches_replica(op) {
            deletes.entry((op.target_side, op.node)).or_default().push(index);
        }
    }

    for (index, op) in operations.iter().enumerate() {
        for dependency in &op.depends_on {
            match position.get(dependency) {
                Some(&before) if before != index => {
                    predecessors[index].insert(before);
                }
                Some(_) => {}
                None => debug!(operation = %op, dependency, "Dependency is not part of this cycle"),
            }
        }

        // Parent directory first
        if matches!(op.kind, OperationType::Create | OperationType::Move) {
            for &before in dir_creates.get(&op.parent).into_iter().flatten() {
                if before != index {
                    predecessors[index].insert(before);
                }
            }
        }

        if touches_replica(op) {
            // Children and leaving items before the parent's delete
            let vacated_parent = match op.kind {
                OperationType::Delete => Some(op.parent),
                OperationType::Move => op.previous.as_ref().map(|(parent, _)| *parent),
                _ => None,
            };
            if let Some(parent) = vacated_parent {
                for &after in deletes.get(&(op.target_side, parent)).into_iter().flatten() {
                    if after != index {
                        predecessors[after].insert(index);
                    }
                }
            }
        }

        // Free the name before taking it; an item never waits on itself
        if let Some(slot) = taken_slot(op, rules) {
            for &before in frees.get(&slot).into_iter().flatten() {
                if before != index && operations[before].node != op.node {
                    predecessors[index].insert(before);
                }
            }
        }
    }

    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); count];
    let mut pending: Vec<usize> = vec![0; count];
    for (index, before) in predecessors.iter().enumerate() {
        pending[index] = before.len();
        for &b in before {
            successors[b].push(index);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = pending
        .iter()
        .enumerate()
        .filter(|(_, n)| **n == 0)
        .map(|(index, _)| Reverse(index))
        .collect();
    let mut order = Vec::with_capacity(count);
    while let Some(Reverse(index)) = ready.pop() {
        order.push(index);
        for &next in &successors[index] {
            pending[next] -= 1;
            if pending[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    if order.len() < count {
        let stuck = (0..count).filter(|index| pending[*index] > 0).collect();
        return Ordering::Stuck(stuck);
    }
    Ordering::Sorted { order, predecessors }
}

fn freed_slots(operations: &[PendingOperation], rules: &SortRules) -> HashMap<Slot, Vec<usize>> {
    let mut frees: HashMap<Slot, Vec<usize>> = HashMap::new();
    for (index, op) in operations.iter().enumerate() {
        if let Some(slot) = freed_slot(op, rules) {
            frees.entry(slot).or_default().push(index);
        }
    }
    frees
}

/// First stuck move whose destination name is held by another stuck operation
fn stageable_move(operations: &[PendingOperation], stuck: &[usize], rules: &SortRules) -> Option<usize> {
    let frees = freed_slots(operations, rules);
    stuck.iter().copied().find(|&index| {
        let op = &operations[index];
        if op.kind != OperationType::Move || op.effect != OperationEffect::Apply || op.previous.is_none() {
            return false;
        }
        taken_slot(op, rules)
            .and_then(|slot| frees.get(&slot))
            .map(|holders| {
                holders
                    .iter()
                    .any(|holder| operations[*holder].node != op.node && stuck.contains(holder))
            })
            .unwrap_or(false)
    })
}

/// Split the move at `index` into a rename to a temporary name in its origin
/// parent, followed by the original move from that temporary name
fn stage_move(operations: &mut Vec<PendingOperation>, index: usize) {
    let stage_id = operations.iter().map(|op| op.id).max().map_or(0, |id| id + 1);
    let op = &mut operations[index];
    let Some((origin, origin_name)) = op.previous.clone() else {
        return;
    };
    let staged_name = format!("{}{}{}", origin_name, STAGING_INFIX, stage_id);

    let mut stage = op.clone();
    stage.id = stage_id;
    stage.effect = OperationEffect::Stage;
    stage.parent = origin;
    stage.name = staged_name.clone();

    debug!(operation = %op, staged = %staged_name, "Staging move to break a cycle");
    op.previous = Some((origin, staged_name));
    op.depends_on.push(stage_id);
    operations.push(stage);
}

fn apply_order(
    operations: Vec<PendingOperation>,
    order: Vec<usize>,
    predecessors: Vec<BTreeSet<usize>>,
) -> Vec<PendingOperation> {
    let ids: Vec<usize> = operations.iter().map(|op| op.id).collect();
    let mut slots: Vec<Option<PendingOperation>> = operations.into_iter().map(Some).collect();
    let mut sorted = Vec::with_capacity(order.len());
    for index in order {
        if let Some(mut op) = slots[index].take() {
            op.depends_on = predecessors[index].iter().map(|&before| ids[before]).collect();
            sorted.push(op);
        }
    }
    sorted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeType;
    use std::path::PathBuf;

    fn op(id: usize, kind: OperationType, node: PairKey, parent: PairKey, name: &str) -> PendingOperation {
        PendingOperation {
            id,
            kind,
            effect: OperationEffect::Apply,
            source_side: ReplicaSide::Local,
            target_side: ReplicaSide::Remote,
            item_id: format!("l{}", id),
            node_type: NodeType::File,
            db_id: None,
            node,
            parent,
            name: name.to_string(),
            previous: None,
            pair_with: None,
            path: PathBuf::from(name),
            depends_on: Vec::new(),
        }
    }

    fn rules() -> SortRules {
        SortRules {
            local: NameCaseRule::Sensitive,
            remote: NameCaseRule::Sensitive,
        }
    }

    fn ids(ops: &[PendingOperation]) -> Vec<usize> {
        ops.iter().map(|op| op.id).collect()
    }

    #[test]
    fn test_directory_created_before_content() {
        let file = op(0, OperationType::Create, PairKey::New(1), PairKey::New(0), "f.txt");
        let mut dir = op(1, OperationType::Create, PairKey::New(0), PairKey::Db(1), "d");
        dir.node_type = NodeType::Directory;

        let sorted = sort_operations(vec![file, dir], &rules()).unwrap();
        assert_eq!(ids(&sorted), vec![1, 0]);
        assert_eq!(sorted[1].depends_on, vec![1]);
    }

    #[test]
    fn test_child_and_moved_out_item_leave_before_parent_delete() {
        let parent_delete = op(0, OperationType::Delete, PairKey::Db(5), PairKey::Db(1), "d");
        let child_delete = op(1, OperationType::Delete, PairKey::Db(6), PairKey::Db(5), "c");
        let mut move_out = op(2, OperationType::Move, PairKey::Db(7), PairKey::Db(1), "m");
        move_out.previous = Some((PairKey::Db(5), "m".to_string()));

        let sorted = sort_operations(vec![parent_delete, child_delete, move_out], &rules()).unwrap();
        assert_eq!(ids(&sorted), vec![1, 2, 0]);
    }

    #[test]
    fn test_name_freed_before_taken() {
        let create = op(0, OperationType::Create, PairKey::New(0), PairKey::Db(1), "a.txt");
        let mut rename = op(1, OperationType::Move, PairKey::Db(3), PairKey::Db(1), "b.txt");
        rename.previous = Some((PairKey::Db(1), "a.txt".to_string()));

        let sorted = sort_operations(vec![create, rename], &rules()).unwrap();
        assert_eq!(ids(&sorted), vec![1, 0]);
    }

    #[test]
    fn test_case_insensitive_slots_collide() {
        let create = op(0, OperationType::Create, PairKey::New(0), PairKey::Db(1), "README.md");
        let delete = op(1, OperationType::Delete, PairKey::Db(3), PairKey::Db(1), "readme.md");
        let insensitive = SortRules {
            local: NameCaseRule::Insensitive,
            remote: NameCaseRule::Insensitive,
        };

        assert_eq!(ids(&sort_operations(vec![create.clone(), delete.clone()], &insensitive).unwrap()), vec![1, 0]);
        assert_eq!(ids(&sort_operations(vec![create, delete], &rules()).unwrap()), vec![0, 1]);
    }

    fn rename(id: usize, node: u64, from: &str, to: &str) -> PendingOperation {
        let mut op = op(id, OperationType::Move, PairKey::Db(node), PairKey::Db(1), to);
        op.previous = Some((PairKey::Db(1), from.to_string()));
        op
    }

    #[test]
    fn test_swapped_names_go_through_a_temporary_name() {
        let a = rename(0, 2, "a", "b");
        let b = rename(1, 3, "b", "a");

        let sorted = sort_operations(vec![a, b], &rules()).unwrap();
        assert_eq!(ids(&sorted), vec![2, 1, 0]);

        let stage = &sorted[0];
        assert_eq!(stage.effect, OperationEffect::Stage);
        assert_eq!(stage.node, PairKey::Db(2));
        assert_eq!(stage.parent, PairKey::Db(1));
        assert_eq!(stage.name, format!("a{}2", STAGING_INFIX));
        assert_eq!(stage.previous, Some((PairKey::Db(1), "a".to_string())));

        assert_eq!(sorted[1].depends_on, vec![2]);
        let last = &sorted[2];
        assert_eq!(last.name, "b");
        assert_eq!(last.previous, Some((PairKey::Db(1), format!("a{}2", STAGING_INFIX))));
        assert_eq!(last.depends_on, vec![1, 2]);
    }

    #[test]
    fn test_rotation_of_three_names_needs_one_stage() {
        let ops = vec![rename(0, 2, "a", "b"), rename(1, 3, "b", "c"), rename(2, 4, "c", "a")];

        let sorted = sort_operations(ops, &rules()).unwrap();
        let stages: Vec<_> = sorted.iter().filter(|op| op.effect == OperationEffect::Stage).collect();
        assert_eq!(stages.len(), 1);
        assert_eq!(sorted.len(), 4);
        assert_eq!(sorted[0].effect, OperationEffect::Stage);
    }

    #[test]
    fn test_cycle_without_moves_is_reported() {
        let mut first = op(0, OperationType::Edit, PairKey::Db(2), PairKey::Db(1), "x");
        first.depends_on.push(1);
        let mut second = op(1, OperationType::Edit, PairKey::Db(3), PairKey::Db(1), "y");
        second.depends_on.push(0);

        match sort_operations(vec![first, second], &rules()) {
            Err(SyncError::DependencyCycle(stuck)) => assert_eq!(stuck, 2),
            other => panic!("expected a dependency cycle, got {:?}", other.map(|ops| ids(&ops))),
        }
    }

    #[test]
    fn test_depends_on_keeps_real_ids() {
        let create = op(7, OperationType::Create, PairKey::New(0), PairKey::Db(1), "a.txt");
        let rename = rename(9, 3, "a.txt", "b.txt");

        let sorted = sort_operations(vec![create, rename], &rules()).unwrap();
        assert_eq!(ids(&sorted), vec![9, 7]);
        assert_eq!(sorted[1].depends_on, vec![9]);
    }

    #[test]
    fn test_explicit_dependencies_and_stable_order() {
        let first = op(0, OperationType::Edit, PairKey::Db(2), PairKey::Db(1), "x");
        let mut second = op(1, OperationType::Edit, PairKey::Db(3), PairKey::Db(1), "y");
        second.depends_on.push(2);
        let third = op(2, OperationType::Edit, PairKey::Db(4), PairKey::Db(1), "z");

        let sorted = sort_operations(vec![first, second, third], &rules()).unwrap();
        assert_eq!(ids(&sorted), vec![0, 2, 1]);
    }

    #[test]
    fn test_db_only_operations_do_not_hold_slots() {
        let create = op(0, OperationType::Create, PairKey::New(0), PairKey::Db(1), "a");
        let mut forget = op(1, OperationType::Delete, PairKey::Db(3), PairKey::Db(1), "a");
        forget.effect = OperationEffect::DbOnly;

        let sorted = sort_operations(vec![create, forget], &rules()).unwrap();
        assert_eq!(ids(&sorted), vec![0, 1]);
    }
}
