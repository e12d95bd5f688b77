//! Snapshot builder
//!
//! Listings and directory walks deliver items in arbitrary order. The builder
//! buffers items whose parent has not been seen yet and inserts them once it
//! shows up; whatever cannot be attached is quarantined in the report.

use super::{Snapshot, SnapshotItem};
use crate::error::SnapshotError;
use crate::types::NodeId;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Items that could not be inserted, by reason
#[derive(Debug, Default, Clone)]
pub struct BuildReport {
    pub inserted: usize,
    pub duplicates: Vec<NodeId>,
    pub orphans: Vec<NodeId>,
    pub rejected: Vec<(NodeId, SnapshotError)>,
}

impl BuildReport {
    pub fn quarantined(&self) -> usize {
        self.duplicates.len() + self.orphans.len() + self.rejected.len()
    }

    pub fn is_clean(&self) -> bool {
        self.quarantined() == 0
    }
}

/// SnapshotBuilder: order-independent bulk insertion
pub struct SnapshotBuilder {
    snapshot: Snapshot,
    pending: HashMap<NodeId, Vec<SnapshotItem>>,
    report: BuildReport,
}

impl SnapshotBuilder {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            snapshot,
            pending: HashMap::new(),
            report: BuildReport::default(),
        }
    }

    /// Add one item; it is inserted now if its parent is known, later otherwise
    pub fn push(&mut self, item: SnapshotItem) {
        if self.snapshot.contains(&item.id) {
            warn!(id = %item.id, "Duplicate item id in listing, keeping first occurrence");
            self.report.duplicates.push(item.id);
            return;
        }
        if !self.snapshot.contains(&item.parent_id) {
            self.pending.entry(item.parent_id.clone()).or_default().push(item);
            return;
        }

        let mut ready = vec![item];
        while let Some(next) = ready.pop() {
            let id = next.id.clone();
            match self.snapshot.upsert(next) {
                Ok(_) => {
                    self.report.inserted += 1;
                    if let Some(waiting) = self.pending.remove(&id) {
                        ready.extend(waiting);
                    }
                }
                Err(e) => {
                    debug!(id = %id, error = %e, "Item rejected during snapshot build");
                    self.report.rejected.push((id, e));
                }
            }
        }
    }

    pub fn extend(&mut self, items: impl IntoIterator<Item = SnapshotItem>) {
        for item in items {
            self.push(item);
        }
    }

    /// Finish the build. Items still waiting for a parent are orphans; this includes
    /// every member of a parent cycle, since none of them can ever reach the root.
    pub fn finish(mut self) -> (Snapshot, BuildReport) {
        for (_, waiting) in self.pending.drain() {
            for item in waiting {
                self.report.orphans.push(item.id);
            }
        }
        self.report.orphans.sort();
        if !self.report.is_clean() {
            warn!(
                inserted = self.report.inserted,
                duplicates = self.report.duplicates.len(),
                orphans = self.report.orphans.len(),
                rejected = self.report.rejected.len(),
                "Snapshot built with quarantined items"
            );
        }
        (self.snapshot, self.report)
    }
}
