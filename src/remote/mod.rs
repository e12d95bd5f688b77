//! Remote drive API
//!
//! The observer and the propagation jobs talk to the server through
//! [`RemoteApi`]; [`HttpRemoteApi`] is the reqwest implementation.

mod http;

pub use http::HttpRemoteApi;

use crate::error::SyncError;
use crate::listing::{ContinueResponse, FullListing, ListenResponse, RemoteFile};
use crate::types::SyncTime;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Called with the number of bytes transferred so far
pub type TransferProgress = Arc<dyn Fn(u64) + Send + Sync>;

/// Operations the sync core needs from the server
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Complete recursive listing of a directory, with the cursor to continue from
    async fn full_listing(&self, directory_id: &str) -> Result<FullListing, SyncError>;

    /// Changes after `cursor`
    async fn continue_listing(&self, cursor: &str) -> Result<ContinueResponse, SyncError>;

    /// Block until something changes after `cursor` or the timeout elapses
    async fn listen(&self, cursor: &str, timeout: Duration) -> Result<ListenResponse, SyncError>;

    async fn create_directory(&self, parent_id: &str, name: &str) -> Result<RemoteFile, SyncError>;

    /// Upload a new file
    async fn upload(
        &self,
        parent_id: &str,
        name: &str,
        source: &Path,
        last_modified: SyncTime,
        progress: TransferProgress,
    ) -> Result<RemoteFile, SyncError>;

    /// Replace the content of an existing file
    async fn upload_replace(
        &self,
        file_id: &str,
        source: &Path,
        last_modified: SyncTime,
        progress: TransferProgress,
    ) -> Result<RemoteFile, SyncError>;

    /// Write the content of a file to `destination`
    async fn download(&self, file_id: &str, destination: &Path, progress: TransferProgress) -> Result<(), SyncError>;

    async fn move_item(&self, file_id: &str, destination_parent_id: &str) -> Result<RemoteFile, SyncError>;

    async fn rename(&self, file_id: &str, name: &str) -> Result<RemoteFile, SyncError>;

    async fn delete(&self, file_id: &str) -> Result<(), SyncError>;
}
