//! FSEvents watcher (macOS) through the `notify` crate
//!
//! A dedicated owner thread creates the stream, reports readiness through a
//! channel and tears the stream down when asked to stop.

use super::normalize::normalize_notify_event;
use super::{PlatformWatcher, WatcherMessage, READY_TIMEOUT};
use crate::config::WatcherConfig;
use crate::error::WatcherError;
use notify::{RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

#[cfg(target_os = "macos")]
type Backend = notify::FsEventWatcher;
#[cfg(not(target_os = "macos"))]
type Backend = notify::RecommendedWatcher;

/// NotifyWatcher: recursive stream on the sync root
pub struct NotifyWatcher {
    root: PathBuf,
    sender: SyncSender<WatcherMessage>,
    ready: Arc<AtomicBool>,
    reliable: Arc<AtomicBool>,
    stop_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl NotifyWatcher {
    pub fn new(root: PathBuf, sender: SyncSender<WatcherMessage>, _config: &WatcherConfig) -> Self {
        Self {
            root,
            sender,
            ready: Arc::new(AtomicBool::new(false)),
            reliable: Arc::new(AtomicBool::new(true)),
            stop_tx: None,
            handle: None,
        }
    }
}

impl PlatformWatcher for NotifyWatcher {
    fn start(&mut self) -> Result<(), WatcherError> {
        if !self.root.is_dir() {
            return Err(WatcherError::MissingRoot(self.root.clone()));
        }

        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), String>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let root = self.root.clone();
        let sender = self.sender.clone();
        let reliable = Arc::clone(&self.reliable);

        let handle = std::thread::Builder::new()
            .name("syncore-fsevents".to_string())
            .spawn(move || {
                let event_sender = sender.clone();
                let callback_reliable = Arc::clone(&reliable);
                let watcher = Backend::new(
                    move |result: notify::Result<notify::Event>| match result {
                        Ok(event) => {
                            for message in normalize_notify_event(&event, |path| path.exists()) {
                                if message == WatcherMessage::ChangesLost {
                                    callback_reliable.store(false, Ordering::SeqCst);
                                }
                                if event_sender.send(message).is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => warn!(error = %e, "FSEvents error"),
                    },
                    notify::Config::default(),
                );
                let mut watcher = match watcher {
                    Ok(watcher) => watcher,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                if let Err(e) = watcher.watch(&root, RecursiveMode::Recursive) {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Block until stop() or the owner is dropped; dropping the
                // watcher stops the stream and its run loop.
                let _ = stop_rx.recv();
                drop(watcher);
                debug!("FSEvents stream stopped");
            })?;

        match ready_rx.recv_timeout(READY_TIMEOUT) {
            Ok(Ok(())) => {
                self.ready.store(true, Ordering::SeqCst);
                self.reliable.store(true, Ordering::SeqCst);
                self.stop_tx = Some(stop_tx);
                self.handle = Some(handle);
                info!(root = %self.root.display(), "FSEvents stream started");
                Ok(())
            }
            Ok(Err(message)) => {
                let _ = handle.join();
                Err(WatcherError::Backend(message))
            }
            Err(RecvTimeoutError::Timeout) => {
                drop(stop_tx);
                Err(WatcherError::ReadyTimeout(READY_TIMEOUT))
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = handle.join();
                Err(WatcherError::Backend("watcher thread exited before ready".to_string()))
            }
        }
    }

    fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("FSEvents owner thread panicked");
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

impl Drop for NotifyWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
