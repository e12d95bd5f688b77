//! Observers
//!
//! Each replica has one observer, the only writer of that replica's snapshot.
//! The [`local`] observer explores the sync root and follows the platform
//! watcher; the [`remote`] observer ingests listings and long-polls for
//! changes.

pub mod ignore;
pub mod local;
pub mod remote;

pub use ignore::IgnoreMatcher;
pub use local::{explore, local_file_id, local_item, local_root_id, LocalObserver, ObserverState};
pub use remote::RemoteObserver;
