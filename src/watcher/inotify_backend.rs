//! inotify watcher
//!
//! One watch per directory. The watcher thread polls the inotify descriptor with
//! a short timeout so `stop()` only has to flip a flag and join.

use super::normalize::{InotifyNormalizer, InotifyOutput, InotifyRecord, WATCH_MASK};
use super::{PlatformWatcher, WatchIndex, WatcherMessage};
use crate::config::WatcherConfig;
use crate::error::WatcherError;
use inotify::{Inotify, WatchDescriptor, WatchMask};
use parking_lot::RwLock;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

const POLL_TIMEOUT_MS: i32 = 100;
const EVENT_BUFFER_SIZE: usize = 64 * 1024;

/// Registers one directory watch with the kernel
pub(crate) type AddWatch = Arc<dyn Fn(&Inotify, &Path) -> io::Result<WatchDescriptor> + Send + Sync>;

pub(crate) fn kernel_add_watch(inotify: &Inotify, dir: &Path) -> io::Result<WatchDescriptor> {
    inotify.watches().add(dir, WatchMask::from_bits_truncate(WATCH_MASK))
}

/// State owned by the watcher thread
struct InotifyState {
    inotify: Inotify,
    add_watch: AddWatch,
    index: WatchIndex<WatchDescriptor>,
    normalizer: InotifyNormalizer,
}

impl InotifyState {
    /// Add a watch on `dir` and every directory below it
    fn add_recursive(&mut self, dir: &Path) -> Result<usize, WatcherError> {
        let mut added = 0;
        for entry in WalkDir::new(dir).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(error = %e, "Skipping unreadable entry while adding watches");
                    continue;
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            match (self.add_watch)(&self.inotify, entry.path()) {
                Ok(wd) => {
                    self.index.insert(wd, entry.path().to_path_buf());
                    added += 1;
                }
                Err(e) => match e.raw_os_error() {
                    Some(libc::ENOSPC) | Some(libc::ENOMEM) => {
                        return Err(WatcherError::NotEnoughWatches {
                            path: entry.path().to_path_buf(),
                        })
                    }
                    Some(libc::EACCES) if entry.path() == dir && entry.depth() == 0 => {
                        return Err(WatcherError::AccessDenied {
                            path: dir.to_path_buf(),
                            source: e,
                        })
                    }
                    _ => {
                        warn!(path = %entry.path().display(), error = %e, "Failed to add watch");
                    }
                },
            }
        }
        Ok(added)
    }

    fn remove_recursive(&mut self, dir: &Path) {
        for wd in self.index.remove_subtree(dir) {
            // The kernel may already have dropped it
            let _ = self.inotify.watches().remove(wd);
        }
    }

    fn read_batch(&mut self, buffer: &mut [u8]) -> io::Result<Vec<InotifyOutput>> {
        let mut outputs = Vec::new();
        let events = match self.inotify.read_events(buffer) {
            Ok(events) => events,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(outputs),
            Err(e) => return Err(e),
        };

        let mut records = Vec::new();
        for event in events {
            let dir = match self.index.path(&event.wd) {
                Some(dir) => dir.to_path_buf(),
                None if event.mask.bits() & super::normalize::IN_Q_OVERFLOW != 0 => PathBuf::new(),
                None => continue,
            };
            records.push(InotifyRecord {
                dir,
                name: event.name.map(|name| name.to_os_string()),
                mask: event.mask.bits(),
                cookie: event.cookie,
            });
        }
        for record in records {
            outputs.extend(self.normalizer.push(record));
        }
        outputs.extend(self.normalizer.flush());
        Ok(outputs)
    }
}

/// InotifyWatcher: Linux backend
pub struct InotifyWatcher {
    root: PathBuf,
    sender: SyncSender<WatcherMessage>,
    running: Arc<RwLock<bool>>,
    ready: Arc<AtomicBool>,
    reliable: Arc<AtomicBool>,
    add_watch: AddWatch,
    handle: Option<JoinHandle<()>>,
}

impl InotifyWatcher {
    pub fn new(root: PathBuf, sender: SyncSender<WatcherMessage>, _config: &WatcherConfig) -> Self {
        Self {
            root,
            sender,
            running: Arc::new(RwLock::new(false)),
            ready: Arc::new(AtomicBool::new(false)),
            reliable: Arc::new(AtomicBool::new(true)),
            add_watch: Arc::new(kernel_add_watch),
            handle: None,
        }
    }

    /// Register watches through `add_watch` instead of the kernel call
    pub(crate) fn with_add_watch(mut self, add_watch: AddWatch) -> Self {
        self.add_watch = add_watch;
        self
    }
}

impl PlatformWatcher for InotifyWatcher {
    fn start(&mut self) -> Result<(), WatcherError> {
        if !self.root.is_dir() {
            return Err(WatcherError::MissingRoot(self.root.clone()));
        }

        let inotify = Inotify::init()?;
        let mut state = InotifyState {
            inotify,
            add_watch: Arc::clone(&self.add_watch),
            index: WatchIndex::new(),
            normalizer: InotifyNormalizer::new(),
        };
        let added = state.add_recursive(&self.root)?;
        info!(root = %self.root.display(), watches = added, "inotify watches registered");

        *self.running.write() = true;
        self.reliable.store(true, Ordering::SeqCst);
        self.ready.store(true, Ordering::SeqCst);

        let running = Arc::clone(&self.running);
        let ready = Arc::clone(&self.ready);
        let reliable = Arc::clone(&self.reliable);
        let sender = self.sender.clone();
        let root = self.root.clone();
        let handle = std::thread::Builder::new()
            .name("syncore-inotify".to_string())
            .spawn(move || {
                run_loop(state, root, sender, running, reliable);
                ready.store(false, Ordering::SeqCst);
            })?;
        self.handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        *self.running.write() = false;
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("inotify watcher thread panicked");
            }
        }
        self.ready.store(false, Ordering::SeqCst);
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn is_reliable(&self) -> bool {
        self.reliable.load(Ordering::SeqCst)
    }
}

impl Drop for InotifyWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(
    mut state: InotifyState,
    root: PathBuf,
    sender: SyncSender<WatcherMessage>,
    running: Arc<RwLock<bool>>,
    reliable: Arc<AtomicBool>,
) {
    let mut buffer = vec![0u8; EVENT_BUFFER_SIZE];
    let fd = state.inotify.as_raw_fd();

    while *running.read() {
        let mut poll_fd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: a single valid pollfd owned by this frame
        let ready = unsafe { libc::poll(&mut poll_fd, 1, POLL_TIMEOUT_MS) };
        if ready < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(error = %e, "poll on inotify descriptor failed");
            let _ = sender.send(WatcherMessage::fatal(&WatcherError::Io(e)));
            return;
        }
        if ready == 0 {
            continue;
        }

        let outputs = match state.read_batch(&mut buffer) {
            Ok(outputs) => outputs,
            Err(e) => {
                error!(error = %e, "Failed to read inotify events");
                let _ = sender.send(WatcherMessage::fatal(&WatcherError::Io(e)));
                return;
            }
        };

        for output in outputs {
            let message = match output {
                InotifyOutput::Event { event, is_dir } => {
                    if is_dir {
                        if let Err(e) = follow_directory_change(&mut state, &event) {
                            error!(error = %e, "Cannot keep watching the sync tree");
                            let _ = sender.send(WatcherMessage::fatal(&e));
                            return;
                        }
                    }
                    WatcherMessage::Event(event)
                }
                InotifyOutput::ChangesLost => {
                    warn!("inotify queue overflow, changes lost");
                    reliable.store(false, Ordering::SeqCst);
                    WatcherMessage::ChangesLost
                }
                InotifyOutput::WatchRemoved(dir) => {
                    if let Some(wd) = state.index.id(&dir).cloned() {
                        state.index.remove(&wd);
                    }
                    continue;
                }
                InotifyOutput::WatchGone(dir) => {
                    if dir == root {
                        let e = WatcherError::MissingRoot(root.clone());
                        error!(root = %root.display(), "Sync root removed or moved");
                        let _ = sender.send(WatcherMessage::fatal(&e));
                        return;
                    }
                    continue;
                }
            };
            if sender.send(message).is_err() {
                debug!("Observer channel closed, stopping inotify watcher");
                return;
            }
        }
    }
}

/// Keep watches in step with directory creation, removal and moves
fn follow_directory_change(
    state: &mut InotifyState,
    event: &super::WatchEvent,
) -> Result<(), WatcherError> {
    use crate::types::OperationType;
    match event.operation {
        OperationType::Create => {
            state.add_recursive(&event.path)?;
        }
        OperationType::Delete => state.remove_recursive(&event.path),
        OperationType::Move => {
            state.remove_recursive(&event.path);
            if let Some(destination) = &event.destination {
                state.add_recursive(destination)?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ExitCause, ExitCode, ExitInfo};
    use crate::types::OperationType;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn wait_for(rx: &mpsc::Receiver<WatcherMessage>, predicate: impl Fn(&WatcherMessage) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Ok(message) = rx.recv_timeout(Duration::from_millis(200)) {
                if predicate(&message) {
                    return true;
                }
            }
        }
        false
    }

    #[test]
    fn test_rename_inside_root_is_reported_as_move() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        let (tx, rx) = mpsc::sync_channel(64);
        let mut watcher = InotifyWatcher::new(dir.path().to_path_buf(), tx, &WatcherConfig::default());
        watcher.start().unwrap();
        assert!(watcher.is_ready());

        std::fs::rename(dir.path().join("a.txt"), dir.path().join("b.txt")).unwrap();
        let expected_to = dir.path().join("b.txt");
        assert!(wait_for(&rx, |message| matches!(
            message,
            WatcherMessage::Event(event)
                if event.operation == OperationType::Move && event.destination.as_deref() == Some(expected_to.as_path())
        )));

        watcher.stop();
        assert!(!watcher.is_ready());
    }

    #[test]
    fn test_new_subdirectory_is_watched() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::sync_channel(64);
        let mut watcher = InotifyWatcher::new(dir.path().to_path_buf(), tx, &WatcherConfig::default());
        watcher.start().unwrap();

        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        assert!(wait_for(&rx, |message| matches!(
            message,
            WatcherMessage::Event(event) if event.operation == OperationType::Create && event.path == sub
        )));

        std::thread::sleep(Duration::from_millis(200));
        let inner = sub.join("inner.txt");
        std::fs::write(&inner, b"x").unwrap();
        assert!(wait_for(&rx, |message| matches!(
            message,
            WatcherMessage::Event(event) if event.path == inner
        )));
        watcher.stop();
    }

    fn failing_after(successes: usize, errno: i32) -> AddWatch {
        let calls = AtomicUsize::new(0);
        Arc::new(move |inotify: &Inotify, dir: &Path| {
            if calls.fetch_add(1, Ordering::SeqCst) < successes {
                kernel_add_watch(inotify, dir)
            } else {
                Err(io::Error::from_raw_os_error(errno))
            }
        })
    }

    fn state_with(add_watch: AddWatch) -> InotifyState {
        InotifyState {
            inotify: Inotify::init().unwrap(),
            add_watch,
            index: WatchIndex::new(),
            normalizer: InotifyNormalizer::new(),
        }
    }

    #[test]
    fn test_watch_limit_while_adding_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();

        for errno in [libc::ENOSPC, libc::ENOMEM] {
            let mut state = state_with(failing_after(1, errno));
            let err = state.add_recursive(dir.path()).unwrap_err();
            assert!(matches!(err, WatcherError::NotEnoughWatches { .. }));
            assert_eq!(
                err.exit_info(),
                ExitInfo::new(ExitCode::SystemError, ExitCause::NotEnoughINotifyWatches)
            );
        }
    }

    #[test]
    fn test_denied_root_and_denied_subdirectory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("private")).unwrap();

        let mut state = state_with(failing_after(0, libc::EACCES));
        assert!(matches!(
            state.add_recursive(dir.path()),
            Err(WatcherError::AccessDenied { .. })
        ));

        // Below the root only a warning
        let mut state = state_with(failing_after(1, libc::EACCES));
        assert_eq!(state.add_recursive(dir.path()).unwrap(), 1);
    }

    #[test]
    fn test_watch_limit_on_new_directory_stops_the_watcher() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::sync_channel(64);
        let mut watcher = InotifyWatcher::new(dir.path().to_path_buf(), tx, &WatcherConfig::default())
            .with_add_watch(failing_after(1, libc::ENOSPC));
        watcher.start().unwrap();

        std::fs::create_dir(dir.path().join("sub")).unwrap();
        assert!(wait_for(&rx, |message| matches!(
            message,
            WatcherMessage::Fatal { info, .. }
                if *info == ExitInfo::new(ExitCode::SystemError, ExitCause::NotEnoughINotifyWatches)
        )));
        watcher.stop();
    }

    #[test]
    fn test_missing_root() {
        let (tx, _rx) = mpsc::sync_channel(1);
        let mut watcher = InotifyWatcher::new(PathBuf::from("/nonexistent/syncore"), tx, &WatcherConfig::default());
        assert!(matches!(watcher.start(), Err(WatcherError::MissingRoot(_))));
    }
}
