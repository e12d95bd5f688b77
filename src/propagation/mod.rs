//! Propagation
//!
//! Executes the operations reconciliation generated: the [`sorter`] orders
//! them, the [`executor`] runs each as a [`job::Job`] against the target
//! replica, and the [`vfs`] layer reports which items are being synchronized.

pub mod executor;
pub mod job;
pub mod sorter;
pub mod vfs;

pub use executor::{Executor, JobFailure, PropagationReport};
pub use job::{set_modified, CycleSnapshots, Job, JobContext, PARTIAL_SUFFIX};
pub use sorter::{sort_operations, SortRules};
pub use vfs::{NoVfs, StatusTracker, SyncingGuard, Vfs, VfsStatus};
