//! Local observer
//!
//! Owns the local snapshot. A full walk of the sync root builds it; a platform
//! watcher then feeds batches of normalized events that are applied in order
//! under the snapshot's write lock. Lost notifications trigger a rescan.

use super::ignore::IgnoreMatcher;
use crate::config::WatcherConfig;
use crate::error::{ExitInfo, SyncError, WatcherError};
use crate::snapshot::{BuildReport, NameCaseRule, SharedSnapshot, Snapshot, SnapshotBuilder, SnapshotItem};
use crate::types::{NodeId, NodeType, OperationType, ReplicaSide, SyncTime};
use crate::watcher::{platform_watcher, PlatformWatcher, WatchEvent, WatcherMessage};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Stable id of a local file: the inode number
#[cfg(unix)]
pub fn local_file_id(_path: &Path, metadata: &Metadata) -> io::Result<NodeId> {
    use std::os::unix::fs::MetadataExt;
    Ok(metadata.ino().to_string())
}

/// Stable id of a local file: the NTFS file index
#[cfg(windows)]
pub fn local_file_id(path: &Path, _metadata: &Metadata) -> io::Result<NodeId> {
    use std::os::windows::fs::OpenOptionsExt;
    use std::os::windows::io::AsRawHandle;
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::Storage::FileSystem::{
        GetFileInformationByHandle, BY_HANDLE_FILE_INFORMATION, FILE_FLAG_BACKUP_SEMANTICS,
        FILE_FLAG_OPEN_REPARSE_POINT,
    };

    let file = std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(FILE_FLAG_BACKUP_SEMANTICS.0 | FILE_FLAG_OPEN_REPARSE_POINT.0)
        .open(path)?;
    let mut info = BY_HANDLE_FILE_INFORMATION::default();
    // SAFETY: the handle is open for the duration of the call
    unsafe { GetFileInformationByHandle(HANDLE(file.as_raw_handle()), &mut info) }
        .map_err(|e| io::Error::from_raw_os_error(e.code().0))?;
    Ok((((info.nFileIndexHigh as u64) << 32) | info.nFileIndexLow as u64).to_string())
}

#[cfg(not(any(unix, windows)))]
pub fn local_file_id(path: &Path, _metadata: &Metadata) -> io::Result<NodeId> {
    Ok(blake3::hash(path.to_string_lossy().as_bytes()).to_hex()[..16].to_string())
}

fn seconds(time: io::Result<SystemTime>) -> SyncTime {
    match time {
        Ok(time) => match time.duration_since(UNIX_EPOCH) {
            Ok(after) => after.as_secs() as SyncTime,
            Err(before) => -(before.duration().as_secs() as SyncTime),
        },
        Err(_) => 0,
    }
}

/// Snapshot item for a path on disk, not following symlinks
pub fn local_item(path: &Path, parent_id: &str) -> io::Result<SnapshotItem> {
    let metadata = std::fs::symlink_metadata(path)?;
    let id = local_file_id(path, &metadata)?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let node_type = if metadata.is_dir() {
        NodeType::Directory
    } else {
        NodeType::File
    };
    let mut item = SnapshotItem::new(id, parent_id, name, node_type)
        .with_size(if metadata.is_dir() { 0 } else { metadata.len() as i64 })
        .with_times(seconds(metadata.created()), seconds(metadata.modified()))
        .with_can_write(!metadata.permissions().readonly());
    item.is_link = metadata.file_type().is_symlink();
    Ok(item)
}

/// Id of the sync root directory
pub fn local_root_id(root: &Path) -> Result<NodeId, SyncError> {
    let metadata = std::fs::metadata(root).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            SyncError::from(WatcherError::MissingRoot(root.to_path_buf()))
        } else {
            SyncError::from(WatcherError::AccessDenied {
                path: root.to_path_buf(),
                source: e,
            })
        }
    })?;
    local_file_id(root, &metadata).map_err(|e| SyncError::io(root, e))
}

/// Walk `root` into a fresh, valid snapshot
pub fn explore(
    root: &Path,
    case_rule: NameCaseRule,
    ignore: &IgnoreMatcher,
) -> Result<(Snapshot, BuildReport), SyncError> {
    let started = Instant::now();
    let root_id = local_root_id(root)?;
    let mut builder = SnapshotBuilder::new(Snapshot::new(ReplicaSide::Local, root_id.clone(), case_rule));
    let mut ids: HashMap<PathBuf, NodeId> = HashMap::new();
    ids.insert(root.to_path_buf(), root_id);

    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            entry
                .path()
                .strip_prefix(root)
                .map(|relative| !ignore.is_ignored(relative))
                .unwrap_or(false)
        });
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable entry during exploration");
                continue;
            }
        };
        let parent_id = match entry.path().parent().and_then(|parent| ids.get(parent)) {
            Some(id) => id.clone(),
            None => continue,
        };
        match local_item(entry.path(), &parent_id) {
            Ok(item) => {
                if item.is_dir() {
                    ids.insert(entry.path().to_path_buf(), item.id.clone());
                }
                builder.push(item);
            }
            Err(e) => warn!(path = %entry.path().display(), error = %e, "Cannot stat entry"),
        }
    }

    let (mut snapshot, report) = builder.finish();
    snapshot.set_valid(true);
    info!(
        items = snapshot.len(),
        quarantined = report.quarantined(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Explored local tree"
    );
    Ok((snapshot, report))
}

/// Ordered event batcher with per-path edit debouncing
pub(crate) struct EventBatcher {
    debounce: Duration,
    max_batch_size: usize,
    ignore: IgnoreMatcher,
    root: PathBuf,
    pending: Vec<WatchEvent>,
    last_edit: HashMap<PathBuf, Instant>,
}

impl EventBatcher {
    pub(crate) fn new(root: PathBuf, config: &WatcherConfig) -> Self {
        Self {
            debounce: Duration::from_millis(config.debounce_ms),
            max_batch_size: config.max_batch_size.max(1),
            ignore: IgnoreMatcher::new(&config.ignore_patterns),
            root,
            pending: Vec::new(),
            last_edit: HashMap::new(),
        }
    }

    fn ignored(&self, path: &Path) -> bool {
        path.strip_prefix(&self.root)
            .map(|relative| self.ignore.is_ignored(relative))
            .unwrap_or(true)
    }

    /// Queue an event; returns true when the batch is full
    pub(crate) fn add_event(&mut self, event: WatchEvent) -> bool {
        let source_ignored = self.ignored(&event.path);
        let event = match (&event.destination, event.operation) {
            // Renamed from an ignored name (e.g. a finished download): a create
            (Some(destination), OperationType::Move) if source_ignored => {
                if self.ignored(destination) {
                    return false;
                }
                WatchEvent::new(OperationType::Create, destination.clone())
            }
            (Some(destination), OperationType::Move) if self.ignored(destination) => {
                WatchEvent::new(OperationType::Delete, event.path.clone())
            }
            _ if source_ignored => return false,
            _ => event,
        };

        if event.operation == OperationType::Edit {
            let now = Instant::now();
            let recent = self
                .last_edit
                .get(&event.path)
                .map(|last| now.duration_since(*last) < self.debounce)
                .unwrap_or(false);
            let already_queued = self
                .pending
                .iter()
                .rev()
                .find(|queued| queued.path == event.path || queued.destination.as_ref() == Some(&event.path))
                .map(|queued| queued.operation == OperationType::Edit)
                .unwrap_or(false);
            self.last_edit.insert(event.path.clone(), now);
            if recent && already_queued {
                return false;
            }
        }

        self.pending.push(event);
        self.pending.len() >= self.max_batch_size
    }

    pub(crate) fn take_batch(&mut self) -> Vec<WatchEvent> {
        self.last_edit.clear();
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Applies batches of events to the shared snapshot
struct EventApplier {
    root: PathBuf,
    snapshot: SharedSnapshot,
    ignore: IgnoreMatcher,
}

/// What the caller must do after a batch
enum Applied {
    Done,
    Rescan,
}

/// Disk state read for one event, applied later under the write lock
#[derive(Debug)]
enum Change {
    /// Current item at a path, plus the content of a directory the
    /// snapshot does not know yet
    Upsert {
        relative: PathBuf,
        item: SnapshotItem,
        content: Vec<SnapshotItem>,
    },
    Remove {
        relative: PathBuf,
    },
}

impl EventApplier {
    fn relative(&self, path: &Path) -> Option<PathBuf> {
        path.strip_prefix(&self.root).ok().map(Path::to_path_buf)
    }

    fn apply(&self, events: Vec<WatchEvent>) -> Applied {
        match self.stage(events) {
            Ok(changes) => self.commit(changes),
            Err(reason) => {
                warn!(reason = %reason, "Cannot read event targets, rescanning");
                Applied::Rescan
            }
        }
    }

    /// Stat every event target and walk new directories; no write lock is held
    fn stage(&self, events: Vec<WatchEvent>) -> Result<Vec<Change>, String> {
        let mut changes = Vec::with_capacity(events.len());
        for event in events {
            match event.operation {
                OperationType::Create | OperationType::Edit | OperationType::Rights => {
                    changes.extend(self.read_path(&event.path)?);
                }
                OperationType::Delete => changes.extend(self.remove(&event.path)),
                OperationType::Move => match &event.destination {
                    Some(destination) => {
                        changes.extend(self.read_path(destination)?);
                        // The source name may still be indexed if the id changed
                        if std::fs::symlink_metadata(&event.path).is_err() {
                            changes.extend(self.remove(&event.path));
                        }
                    }
                    None => changes.extend(self.remove(&event.path)),
                },
                OperationType::None => {}
            }
        }
        Ok(changes)
    }

    fn remove(&self, path: &Path) -> Option<Change> {
        self.relative(path).map(|relative| Change::Remove { relative })
    }

    fn read_path(&self, path: &Path) -> Result<Option<Change>, String> {
        let relative = match self.relative(path) {
            Some(relative) => relative,
            None => return Ok(None),
        };
        // Parent id is resolved when the change is applied
        let item = match local_item(path, "") {
            Ok(item) => item,
            // Gone again; a delete event follows
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(format!("{}: {}", path.display(), e)),
        };
        let content = if item.is_dir() && !self.snapshot.read().contains(&item.id) {
            self.scan_content(path, &item.id)
        } else {
            Vec::new()
        };
        Ok(Some(Change::Upsert { relative, item, content }))
    }

    /// Content created before the directory was watched
    fn scan_content(&self, dir: &Path, dir_id: &str) -> Vec<SnapshotItem> {
        let mut ids: HashMap<PathBuf, NodeId> = HashMap::new();
        ids.insert(dir.to_path_buf(), dir_id.to_string());
        let mut content = Vec::new();
        let walker = WalkDir::new(dir)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                entry
                    .path()
                    .strip_prefix(&self.root)
                    .map(|relative| !self.ignore.is_ignored(relative))
                    .unwrap_or(false)
            });
        for entry in walker.flatten() {
            let parent_id = match entry.path().parent().and_then(|parent| ids.get(parent)) {
                Some(id) => id.clone(),
                None => continue,
            };
            if let Ok(item) = local_item(entry.path(), &parent_id) {
                if item.is_dir() {
                    ids.insert(entry.path().to_path_buf(), item.id.clone());
                }
                content.push(item);
            }
        }
        content
    }

    fn commit(&self, changes: Vec<Change>) -> Applied {
        let mut snapshot = self.snapshot.write();
        for change in changes {
            let result = match change {
                Change::Upsert { relative, item, content } => Self::upsert(&mut snapshot, &relative, item, content),
                Change::Remove { relative } => Self::delete(&mut snapshot, &relative),
            };
            if let Err(reason) = result {
                warn!(reason = %reason, "Cannot apply event, rescanning");
                return Applied::Rescan;
            }
        }
        Applied::Done
    }

    fn upsert(
        snapshot: &mut Snapshot,
        relative: &Path,
        mut item: SnapshotItem,
        content: Vec<SnapshotItem>,
    ) -> Result<(), String> {
        let parent = relative.parent().unwrap_or_else(|| Path::new(""));
        item.parent_id = snapshot
            .id_from_path(parent)
            .ok_or_else(|| format!("parent {} is not known", parent.display()))?;

        // Another id already holds the name (replaced by a rename)
        if let Some(existing) = snapshot.find_child(&item.parent_id, &item.name).map(|found| found.id.clone()) {
            if existing != item.id {
                snapshot.remove(&existing).map_err(|e| e.to_string())?;
            }
        }
        snapshot.upsert(item).map_err(|e| e.to_string())?;
        for child in content {
            if !snapshot.contains(&child.id) {
                snapshot.upsert(child).map_err(|e| e.to_string())?;
            }
        }
        Ok(())
    }

    fn delete(snapshot: &mut Snapshot, relative: &Path) -> Result<(), String> {
        match snapshot.id_from_path(relative) {
            Some(id) if &id != snapshot.root_id() => {
                snapshot.remove(&id).map_err(|e| e.to_string())?;
            }
            Some(_) => return Err("the sync root was removed".to_string()),
            None => debug!(path = %relative.display(), "Deleted path was not in the snapshot"),
        }
        Ok(())
    }
}

/// Observer state visible to the engine
#[derive(Debug, Clone, Default)]
pub struct ObserverState {
    /// Set when monitoring stopped on an unrecoverable error
    pub fatal: Option<(ExitInfo, String)>,
    /// Number of full explorations since start
    pub explorations: u64,
}

/// LocalObserver: exploration plus live monitoring of the sync root
pub struct LocalObserver {
    root: PathBuf,
    snapshot: SharedSnapshot,
    config: WatcherConfig,
    case_rule: NameCaseRule,
    running: Arc<RwLock<bool>>,
    state: Arc<RwLock<ObserverState>>,
    handle: Option<JoinHandle<()>>,
}

impl LocalObserver {
    pub fn new(root: PathBuf, snapshot: SharedSnapshot, config: WatcherConfig, case_rule: NameCaseRule) -> Self {
        Self {
            root,
            snapshot,
            config,
            case_rule,
            running: Arc::new(RwLock::new(false)),
            state: Arc::new(RwLock::new(ObserverState::default())),
            handle: None,
        }
    }

    pub fn snapshot(&self) -> &SharedSnapshot {
        &self.snapshot
    }

    pub fn state(&self) -> ObserverState {
        self.state.read().clone()
    }

    pub fn is_running(&self) -> bool {
        *self.running.read()
    }

    /// Rebuild the snapshot from disk
    pub fn explore(&self) -> Result<BuildReport, SyncError> {
        let ignore = IgnoreMatcher::new(&self.config.ignore_patterns);
        let (snapshot, report) = explore(&self.root, self.case_rule, &ignore)?;
        self.snapshot.replace(snapshot);
        self.state.write().explorations += 1;
        Ok(report)
    }

    /// Start the watcher, explore, then apply events on a background thread
    pub fn start(&mut self) -> Result<(), SyncError> {
        let root = self.root.clone();
        let config = self.config.clone();
        self.start_with(move |sender| platform_watcher(root, sender, &config))
    }

    /// Like [`start`](Self::start), over the watcher built by `make_watcher`
    pub(crate) fn start_with(
        &mut self,
        make_watcher: impl FnOnce(SyncSender<WatcherMessage>) -> Box<dyn PlatformWatcher>,
    ) -> Result<(), SyncError> {
        if self.is_running() {
            return Ok(());
        }
        let (sender, receiver) = mpsc::sync_channel(self.config.channel_capacity.max(1));
        let mut watcher = make_watcher(sender);
        // Watch first so nothing created during exploration is missed
        watcher.start()?;
        if let Err(e) = self.explore() {
            watcher.stop();
            return Err(e);
        }

        *self.running.write() = true;
        let worker = ObserverLoop {
            root: self.root.clone(),
            config: self.config.clone(),
            case_rule: self.case_rule,
            snapshot: self.snapshot.clone(),
            running: Arc::clone(&self.running),
            state: Arc::clone(&self.state),
        };
        let handle = std::thread::Builder::new()
            .name("syncore-local-observer".to_string())
            .spawn(move || worker.run(watcher, receiver))
            .map_err(|e| SyncError::io(&self.root, e))?;
        self.handle = Some(handle);
        info!(root = %self.root.display(), "Local observer started");
        Ok(())
    }

    pub fn stop(&mut self) {
        *self.running.write() = false;
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Local observer thread panicked");
            }
        }
    }
}

impl Drop for LocalObserver {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ObserverLoop {
    root: PathBuf,
    config: WatcherConfig,
    case_rule: NameCaseRule,
    snapshot: SharedSnapshot,
    running: Arc<RwLock<bool>>,
    state: Arc<RwLock<ObserverState>>,
}

impl ObserverLoop {
    fn rescan(&self) {
        self.snapshot.invalidate();
        let ignore = IgnoreMatcher::new(&self.config.ignore_patterns);
        match explore(&self.root, self.case_rule, &ignore) {
            Ok((snapshot, _)) => {
                self.snapshot.replace(snapshot);
                self.state.write().explorations += 1;
            }
            Err(e) => {
                error!(error = %e, "Local rescan failed");
                self.state.write().fatal = Some((e.exit_info(), e.to_string()));
                *self.running.write() = false;
            }
        }
    }

    fn run(self, mut watcher: Box<dyn PlatformWatcher>, receiver: Receiver<WatcherMessage>) {
        let mut batcher = EventBatcher::new(self.root.clone(), &self.config);
        let applier = EventApplier {
            root: self.root.clone(),
            snapshot: self.snapshot.clone(),
            ignore: IgnoreMatcher::new(&self.config.ignore_patterns),
        };
        let batch_window = Duration::from_millis(self.config.batch_window_ms.max(1));
        let mut last_batch_time = Instant::now();

        let flush = |batcher: &mut EventBatcher| {
            if let Applied::Rescan = applier.apply(batcher.take_batch()) {
                self.rescan();
            }
        };

        loop {
            if !*self.running.read() {
                break;
            }

            let timeout = batch_window.saturating_sub(last_batch_time.elapsed());
            match receiver.recv_timeout(timeout.max(Duration::from_millis(1))) {
                Ok(WatcherMessage::Event(event)) => {
                    if batcher.add_event(event) {
                        flush(&mut batcher);
                        last_batch_time = Instant::now();
                    }
                }
                Ok(WatcherMessage::ChangesLost) => {
                    warn!("Local changes were lost, rescanning");
                    batcher.take_batch();
                    self.rescan();
                    last_batch_time = Instant::now();
                }
                Ok(WatcherMessage::Fatal { info, message }) => {
                    error!(exit = %info, message = %message, "Local watcher failed");
                    self.snapshot.invalidate();
                    self.state.write().fatal = Some((info, message));
                    *self.running.write() = false;
                    break;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    error!("Watcher channel disconnected");
                    *self.running.write() = false;
                    break;
                }
            }

            if !batcher.is_empty() && last_batch_time.elapsed() >= batch_window {
                flush(&mut batcher);
                last_batch_time = Instant::now();
            }
        }

        watcher.stop();
        debug!("Local observer loop exited");
    }
}
