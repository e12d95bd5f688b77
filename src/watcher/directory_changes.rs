//! ReadDirectoryChangesW watcher
//!
//! One overlapped read on the root handle. The watcher thread waits on the
//! stop event and the I/O event together; on stop it cancels the pending read
//! before closing handles.

use super::normalize::{PathState, WindowsNormalizer};
use super::{PlatformWatcher, WatcherMessage, READY_TIMEOUT};
use crate::config::WatcherConfig;
use crate::error::WatcherError;
use std::ffi::c_void;
use std::os::windows::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};
use windows::core::PCWSTR;
use windows::Win32::Foundation::{
    CloseHandle, ERROR_NOTIFY_ENUM_DIR, FALSE, HANDLE, TRUE, WAIT_EVENT, WAIT_OBJECT_0,
};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, ReadDirectoryChangesW, FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OVERLAPPED,
    FILE_LIST_DIRECTORY, FILE_NOTIFY_CHANGE_ATTRIBUTES, FILE_NOTIFY_CHANGE_DIR_NAME,
    FILE_NOTIFY_CHANGE_FILE_NAME, FILE_NOTIFY_CHANGE_LAST_WRITE, FILE_NOTIFY_CHANGE_SECURITY,
    FILE_NOTIFY_CHANGE_SIZE, FILE_NOTIFY_INFORMATION, FILE_SHARE_DELETE, FILE_SHARE_READ,
    FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows::Win32::System::Threading::{CreateEventW, SetEvent, WaitForMultipleObjects, INFINITE};
use windows::Win32::System::IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED};

const BUFFER_SIZE: usize = 64 * 1024;

/// Handle moved to the watcher thread
struct OwnedHandle(HANDLE);

// SAFETY: kernel handles may be used from any thread
unsafe impl Send for OwnedHandle {}
unsafe impl Sync for OwnedHandle {}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        // SAFETY: the handle is owned and closed exactly once
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

fn wide(path: &Path) -> Vec<u16> {
    path.as_os_str().encode_wide().chain(std::iter::once(0)).collect()
}

fn probe(path: &Path) -> PathState {
    match std::fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => PathState::Directory,
        Ok(_) => PathState::File,
        Err(_) => PathState::Missing,
    }
}

/// DirectoryChangesWatcher: Windows backend
pub struct DirectoryChangesWatcher {
    root: PathBuf,
    sender: SyncSender<WatcherMessage>,
    ready: Arc<AtomicBool>,
    reliable: Arc<AtomicBool>,
    stop_event: Option<Arc<OwnedHandle>>,
    handle: Option<JoinHandle<()>>,
}

impl DirectoryChangesWatcher {
    pub fn new(root: PathBuf, sender: SyncSender<WatcherMessage>, _config: &WatcherConfig) -> Self {
        Self {
            root,
            sender,
            ready: Arc::new(AtomicBool::new(false)),
            reliable: Arc::new(AtomicBool::new(true)),
            stop_event: None,
            handle: None,
        }
    }
}

impl PlatformWatcher for DirectoryChangesWatcher {
    fn start(&mut self) -> Result<(), WatcherError> {
        if !self.root.is_dir() {
            return Err(WatcherError::MissingRoot(self.root.clone()));
        }

        let path = wide(&self.root);
        // SAFETY: `path` is a NUL-terminated wide string alive for the call
        let directory = unsafe {
            CreateFileW(
                PCWSTR(path.as_ptr()),
                FILE_LIST_DIRECTORY.0,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                None,
                OPEN_EXISTING,
                FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
                None,
            )
        }
        .map_err(|e| WatcherError::AccessDenied {
            path: self.root.clone(),
            source: std::io::Error::from_raw_os_error(e.code().0),
        })?;
        let directory = OwnedHandle(directory);

        // SAFETY: plain event creation, no name, default security
        let stop_event = unsafe { CreateEventW(None, TRUE, FALSE, PCWSTR::null()) }
            .map_err(|e| WatcherError::Backend(e.to_string()))?;
        let stop_event = Arc::new(OwnedHandle(stop_event));
        let io_event = unsafe { CreateEventW(None, TRUE, FALSE, PCWSTR::null()) }
            .map_err(|e| WatcherError::Backend(e.to_string()))?;
        let io_event = OwnedHandle(io_event);

        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), String>>();
        let root = self.root.clone();
        let sender = self.sender.clone();
        let reliable = Arc::clone(&self.reliable);
        let thread_stop = Arc::clone(&stop_event);

        let handle = std::thread::Builder::new()
            .name("syncore-rdcw".to_string())
            .spawn(move || {
                run_loop(root, directory, io_event, thread_stop, sender, reliable, ready_tx);
            })?;

        match ready_rx.recv_timeout(READY_TIMEOUT) {
            Ok(Ok(())) => {
                self.ready.store(true, Ordering::SeqCst);
                self.reliable.store(true, Ordering::SeqCst);
                self.stop_event = Some(stop_event);
                self.handle = Some(handle);
                info!(root = %self.root.display(), "ReadDirectoryChangesW watcher started");
                Ok(())
            }
            Ok(Err(message)) => {
                let _ = handle.join();
                Err(WatcherError::Backend(message))
            }
            Err(_) => {
                // SAFETY: the event handle is alive through `stop_event`
                unsafe {
                    let _ = SetEvent(stop_event.0);
                }
                let _ = handle.join();
                Err(WatcherError::ReadyTimeout(READY_TIMEOUT))
            }
        }
    }

    fn stop(&mut self) {
        if let Some(stop_event) = self.stop_event.take() {
            // SAFETY: the event handle is alive through `stop_event`
            unsafe {
                let _ = SetEvent(stop_event.0);
            }
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("ReadDirectoryChangesW thread panicked");
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

impl Drop for DirectoryChangesWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[repr(C, align(8))]
struct NotifyBuffer([u8; BUFFER_SIZE]);

fn run_loop(
    root: PathBuf,
    directory: OwnedHandle,
    io_event: OwnedHandle,
    stop_event: Arc<OwnedHandle>,
    sender: SyncSender<WatcherMessage>,
    reliable: Arc<AtomicBool>,
    ready_tx: mpsc::Sender<Result<(), String>>,
) {
    let mut buffer = Box::new(NotifyBuffer([0u8; BUFFER_SIZE]));
    let mut normalizer = WindowsNormalizer::new();
    let filter = FILE_NOTIFY_CHANGE_FILE_NAME
        | FILE_NOTIFY_CHANGE_DIR_NAME
        | FILE_NOTIFY_CHANGE_ATTRIBUTES
        | FILE_NOTIFY_CHANGE_SIZE
        | FILE_NOTIFY_CHANGE_LAST_WRITE
        | FILE_NOTIFY_CHANGE_SECURITY;
    let mut signalled_ready = false;

    loop {
        let mut overlapped = OVERLAPPED {
            hEvent: io_event.0,
            ..Default::default()
        };
        // SAFETY: buffer and overlapped outlive the read; it is either completed
        // or cancelled and drained below before they go out of scope
        let issued = unsafe {
            ReadDirectoryChangesW(
                directory.0,
                buffer.0.as_mut_ptr() as *mut c_void,
                BUFFER_SIZE as u32,
                TRUE,
                filter,
                None,
                Some(&mut overlapped),
                None,
            )
        };
        if let Err(e) = issued {
            let message = format!("ReadDirectoryChangesW failed: {}", e);
            if signalled_ready {
                error!(error = %e, "ReadDirectoryChangesW failed");
                let _ = sender.send(WatcherMessage::fatal(&WatcherError::Backend(message)));
            } else {
                let _ = ready_tx.send(Err(message));
            }
            return;
        }
        if !signalled_ready {
            signalled_ready = true;
            let _ = ready_tx.send(Ok(()));
        }

        let handles = [stop_event.0, io_event.0];
        // SAFETY: both handles are alive for the duration of the wait
        let woken = unsafe { WaitForMultipleObjects(&handles, FALSE, INFINITE) };
        if woken == WAIT_OBJECT_0 {
            // SAFETY: cancel our own pending read, then wait for it to drain
            unsafe {
                let _ = CancelIoEx(directory.0, Some(&overlapped));
                let mut transferred = 0u32;
                let _ = GetOverlappedResult(directory.0, &overlapped, &mut transferred, TRUE);
            }
            debug!("ReadDirectoryChangesW watcher stopped");
            return;
        }
        if woken != WAIT_EVENT(WAIT_OBJECT_0.0 + 1) {
            let _ = sender.send(WatcherMessage::fatal(&WatcherError::Backend(
                "unexpected wait result".to_string(),
            )));
            return;
        }

        let mut transferred = 0u32;
        // SAFETY: the read has completed, the event is signalled
        let result = unsafe { GetOverlappedResult(directory.0, &overlapped, &mut transferred, FALSE) };
        // SAFETY: manual-reset event owned by this thread
        unsafe {
            let _ = windows::Win32::System::Threading::ResetEvent(io_event.0);
        }

        let overflowed = match &result {
            Err(e) if e.code() == ERROR_NOTIFY_ENUM_DIR.to_hresult() => true,
            Err(e) => {
                error!(error = %e, "Overlapped directory read failed");
                let _ = sender.send(WatcherMessage::fatal(&WatcherError::Backend(e.to_string())));
                return;
            }
            Ok(()) => transferred == 0,
        };
        if overflowed {
            warn!("Directory change buffer overflowed, changes lost");
            reliable.store(false, Ordering::SeqCst);
            if sender.send(WatcherMessage::ChangesLost).is_err() {
                return;
            }
            continue;
        }

        let mut events = Vec::new();
        let mut offset = 0usize;
        loop {
            // SAFETY: offsets come from the kernel-written record chain inside the buffer
            let info = unsafe { &*(buffer.0.as_ptr().add(offset) as *const FILE_NOTIFY_INFORMATION) };
            let name_len = info.FileNameLength as usize / 2;
            // SAFETY: FileName holds FileNameLength bytes of UTF-16
            let name = unsafe { std::slice::from_raw_parts(info.FileName.as_ptr(), name_len) };
            let path = root.join(String::from_utf16_lossy(name));
            events.extend(normalizer.push(info.Action.0, path, probe));

            if info.NextEntryOffset == 0 {
                break;
            }
            offset += info.NextEntryOffset as usize;
        }
        events.extend(normalizer.flush());

        for event in events {
            if sender.send(WatcherMessage::Event(event)).is_err() {
                debug!("Observer channel closed, stopping directory watcher");
                return;
            }
        }
    }
}
