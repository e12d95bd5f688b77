//! In-memory drive used in place of the HTTP API

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use syncore::error::{ExitCause, ExitCode, ExitInfo, SyncError};
use syncore::listing::{
    ActionKind, Capabilities, ContinueResponse, FullListing, ListenResponse, ListingAction,
    RemoteFile,
};
use syncore::remote::{RemoteApi, TransferProgress};
use syncore::types::SyncTime;

pub const ROOT_ID: &str = "1";

/// Transfers report progress once per chunk of this many bytes
pub const CHUNK_SIZE: usize = 4;

fn report_chunks(content: &[u8], progress: &TransferProgress) {
    let mut transferred = 0u64;
    progress(0);
    for chunk in content.chunks(CHUNK_SIZE) {
        transferred += chunk.len() as u64;
        progress(transferred);
    }
}

#[derive(Default)]
struct DriveState {
    files: HashMap<String, RemoteFile>,
    contents: HashMap<String, Vec<u8>>,
    actions: Vec<ListingAction>,
    next_id: u64,
    /// operation name → failures still to inject
    failures: HashMap<&'static str, (u32, ExitInfo)>,
    calls: Vec<String>,
}

/// FakeDrive: a remote tree held in memory, with an action log for cursors
#[derive(Clone, Default)]
pub struct FakeDrive {
    state: Arc<Mutex<DriveState>>,
}

impl FakeDrive {
    pub fn new() -> Self {
        let drive = Self::default();
        drive.state.lock().next_id = 100;
        drive
    }

    pub fn api(&self) -> Arc<dyn RemoteApi> {
        Arc::new(self.clone())
    }

    /// Make the next `times` calls of `operation` fail with `info`
    pub fn fail(&self, operation: &'static str, times: u32, info: ExitInfo) {
        self.state.lock().failures.insert(operation, (times, info));
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// Add a directory as if another client created it
    pub fn add_dir(&self, parent_id: &str, name: &str) -> String {
        let mut state = self.state.lock();
        let file = Self::new_file(&mut state, parent_id, name, "dir", 0, 1_700_000_000);
        state.actions.push(ListingAction {
            action: ActionKind::FileCreate,
            file: file.clone(),
        });
        file.id
    }

    /// Add a file as if another client uploaded it
    pub fn add_file(&self, parent_id: &str, name: &str, content: &[u8], last_modified: SyncTime) -> String {
        let mut state = self.state.lock();
        let file = Self::new_file(&mut state, parent_id, name, "file", content.len() as i64, last_modified);
        state.contents.insert(file.id.clone(), content.to_vec());
        state.actions.push(ListingAction {
            action: ActionKind::FileCreate,
            file: file.clone(),
        });
        file.id
    }

    pub fn find(&self, parent_id: &str, name: &str) -> Option<RemoteFile> {
        self.state
            .lock()
            .files
            .values()
            .find(|file| file.parent_id == parent_id && file.name == name)
            .cloned()
    }

    pub fn content(&self, id: &str) -> Option<Vec<u8>> {
        self.state.lock().contents.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().files.len()
    }

    fn new_file(
        state: &mut DriveState,
        parent_id: &str,
        name: &str,
        kind: &str,
        size: i64,
        last_modified: SyncTime,
    ) -> RemoteFile {
        state.next_id += 1;
        let file = RemoteFile {
            id: state.next_id.to_string(),
            parent_id: parent_id.to_string(),
            name: name.to_string(),
            kind: kind.to_string(),
            size: Some(size),
            created_at: Some(last_modified),
            last_modified_at: Some(last_modified),
            capabilities: Some(Capabilities { can_write: true }),
            is_link: Some(false),
        };
        state.files.insert(file.id.clone(), file.clone());
        file
    }

    fn enter(&self, operation: &'static str, detail: &str) -> Result<(), SyncError> {
        let mut state = self.state.lock();
        state.calls.push(format!("{} {}", operation, detail));
        if let Some((remaining, info)) = state.failures.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SyncError::exit(*info, format!("injected {} failure", operation)));
            }
        }
        Ok(())
    }

    fn not_found(id: &str) -> SyncError {
        SyncError::exit(
            ExitInfo::new(ExitCode::DataError, ExitCause::NotFound),
            format!("no remote file {}", id),
        )
    }

    fn is_below(state: &DriveState, id: &str, ancestor: &str) -> bool {
        let mut current = id.to_string();
        for _ in 0..=state.files.len() {
            if current == ancestor {
                return true;
            }
            match state.files.get(&current) {
                Some(file) => current = file.parent_id.clone(),
                None => return false,
            }
        }
        false
    }
}

#[async_trait]
impl RemoteApi for FakeDrive {
    async fn full_listing(&self, directory_id: &str) -> Result<FullListing, SyncError> {
        self.enter("full_listing", directory_id)?;
        let state = self.state.lock();
        let items = state
            .files
            .values()
            .filter(|file| file.id != directory_id && Self::is_below(&state, &file.id, directory_id))
            .map(RemoteFile::to_item)
            .collect();
        Ok(FullListing {
            cursor: state.actions.len().to_string(),
            items,
            ignored: 0,
        })
    }

    async fn continue_listing(&self, cursor: &str) -> Result<ContinueResponse, SyncError> {
        self.enter("continue_listing", cursor)?;
        let state = self.state.lock();
        let from: usize = cursor.parse().unwrap_or(0).min(state.actions.len());
        Ok(ContinueResponse {
            cursor: state.actions.len().to_string(),
            has_more: false,
            actions: state.actions[from..].to_vec(),
        })
    }

    async fn listen(&self, cursor: &str, _timeout: Duration) -> Result<ListenResponse, SyncError> {
        let from: usize = cursor.parse().unwrap_or(0);
        let has_changes = self.state.lock().actions.len() > from;
        if !has_changes {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok(ListenResponse { has_changes })
    }

    async fn create_directory(&self, parent_id: &str, name: &str) -> Result<RemoteFile, SyncError> {
        self.enter("create_directory", name)?;
        Ok(self.add_dir_returning(parent_id, name))
    }

    async fn upload(
        &self,
        parent_id: &str,
        name: &str,
        source: &Path,
        last_modified: SyncTime,
        progress: TransferProgress,
    ) -> Result<RemoteFile, SyncError> {
        self.enter("upload", name)?;
        let content = std::fs::read(source).map_err(|e| SyncError::io(source, e))?;
        report_chunks(&content, &progress);
        let id = self.add_file(parent_id, name, &content, last_modified);
        self.state
            .lock()
            .files
            .get(&id)
            .cloned()
            .ok_or_else(|| Self::not_found(&id))
    }

    async fn upload_replace(
        &self,
        file_id: &str,
        source: &Path,
        last_modified: SyncTime,
        progress: TransferProgress,
    ) -> Result<RemoteFile, SyncError> {
        self.enter("upload_replace", file_id)?;
        let content = std::fs::read(source).map_err(|e| SyncError::io(source, e))?;
        report_chunks(&content, &progress);
        let mut state = self.state.lock();
        let file = state.files.get_mut(file_id).ok_or_else(|| Self::not_found(file_id))?;
        file.size = Some(content.len() as i64);
        file.last_modified_at = Some(last_modified);
        let file = file.clone();
        state.contents.insert(file_id.to_string(), content);
        state.actions.push(ListingAction {
            action: ActionKind::FileEdit,
            file: file.clone(),
        });
        Ok(file)
    }

    async fn download(&self, file_id: &str, destination: &Path, progress: TransferProgress) -> Result<(), SyncError> {
        self.enter("download", file_id)?;
        let content = self.content(file_id).ok_or_else(|| Self::not_found(file_id))?;
        report_chunks(&content, &progress);
        tokio::fs::write(destination, content)
            .await
            .map_err(|e| SyncError::io(destination, e))
    }

    async fn move_item(&self, file_id: &str, destination_parent_id: &str) -> Result<RemoteFile, SyncError> {
        self.enter("move_item", file_id)?;
        let mut state = self.state.lock();
        let file = state.files.get_mut(file_id).ok_or_else(|| Self::not_found(file_id))?;
        file.parent_id = destination_parent_id.to_string();
        let file = file.clone();
        state.actions.push(ListingAction {
            action: ActionKind::FileMoveIn,
            file: file.clone(),
        });
        Ok(file)
    }

    async fn rename(&self, file_id: &str, name: &str) -> Result<RemoteFile, SyncError> {
        self.enter("rename", file_id)?;
        let mut state = self.state.lock();
        let parent_id = state
            .files
            .get(file_id)
            .map(|file| file.parent_id.clone())
            .ok_or_else(|| Self::not_found(file_id))?;
        let taken = state
            .files
            .values()
            .any(|other| other.id != file_id && other.parent_id == parent_id && other.name == name);
        if taken {
            return Err(SyncError::exit(
                ExitInfo::new(ExitCode::BackError, ExitCause::ApiError),
                format!("{} already exists", name),
            ));
        }
        let file = state.files.get_mut(file_id).ok_or_else(|| Self::not_found(file_id))?;
        file.name = name.to_string();
        let file = file.clone();
        state.actions.push(ListingAction {
            action: ActionKind::FileRename,
            file: file.clone(),
        });
        Ok(file)
    }

    async fn delete(&self, file_id: &str) -> Result<(), SyncError> {
        self.enter("delete", file_id)?;
        let mut state = self.state.lock();
        let file = state.files.get(file_id).cloned().ok_or_else(|| Self::not_found(file_id))?;
        let doomed: Vec<String> = state
            .files
            .keys()
            .filter(|id| Self::is_below(&state, id, file_id))
            .cloned()
            .collect();
        for id in doomed {
            state.files.remove(&id);
            state.contents.remove(&id);
        }
        state.actions.push(ListingAction {
            action: ActionKind::FileDelete,
            file,
        });
        Ok(())
    }
}

impl FakeDrive {
    fn add_dir_returning(&self, parent_id: &str, name: &str) -> RemoteFile {
        let id = self.add_dir(parent_id, name);
        self.state.lock().files[&id].clone()
    }

    /// Rename a file as if another client did it
    pub fn rename_external(&self, file_id: &str, name: &str) {
        let mut state = self.state.lock();
        if let Some(file) = state.files.get_mut(file_id) {
            file.name = name.to_string();
            let file = file.clone();
            state.actions.push(ListingAction {
                action: ActionKind::FileRename,
                file,
            });
        }
    }

    /// Replace content as if another client edited the file
    pub fn edit_external(&self, file_id: &str, content: &[u8], last_modified: SyncTime) {
        let mut state = self.state.lock();
        if let Some(file) = state.files.get_mut(file_id) {
            file.size = Some(content.len() as i64);
            file.last_modified_at = Some(last_modified);
            let file = file.clone();
            state.contents.insert(file_id.to_string(), content.to_vec());
            state.actions.push(ListingAction {
                action: ActionKind::FileEdit,
                file,
            });
        }
    }
}

/// Config for a temporary sync root backed by the fake drive
pub fn test_config(root: &Path) -> syncore::SyncConfig {
    let mut config = syncore::SyncConfig::default();
    config.sync.root = Some(root.to_path_buf());
    config.remote.root_id = ROOT_ID.to_string();
    config.propagation.max_concurrency = 2;
    config.propagation.retry_limit = 2;
    config
}
