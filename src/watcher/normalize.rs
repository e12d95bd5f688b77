//! Change normalization
//!
//! Backend-specific notification records become [`WatchEvent`]s here. The code
//! is free of OS calls so every platform's rules are tested on every platform;
//! existence checks are passed in by the backend.

use super::{WatchEvent, WatcherMessage};
use crate::types::OperationType;
use notify::event::{Flag, ModifyKind, RenameMode};
use notify::{Event, EventKind};
use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

// inotify(7) mask bits
pub const IN_ACCESS: u32 = 0x0000_0001;
pub const IN_MODIFY: u32 = 0x0000_0002;
pub const IN_ATTRIB: u32 = 0x0000_0004;
pub const IN_CLOSE_WRITE: u32 = 0x0000_0008;
pub const IN_CLOSE_NOWRITE: u32 = 0x0000_0010;
pub const IN_OPEN: u32 = 0x0000_0020;
pub const IN_MOVED_FROM: u32 = 0x0000_0040;
pub const IN_MOVED_TO: u32 = 0x0000_0080;
pub const IN_CREATE: u32 = 0x0000_0100;
pub const IN_DELETE: u32 = 0x0000_0200;
pub const IN_DELETE_SELF: u32 = 0x0000_0400;
pub const IN_MOVE_SELF: u32 = 0x0000_0800;
pub const IN_UNMOUNT: u32 = 0x0000_2000;
pub const IN_Q_OVERFLOW: u32 = 0x0000_4000;
pub const IN_IGNORED: u32 = 0x0000_8000;
pub const IN_ISDIR: u32 = 0x4000_0000;

/// Events registered on every watched directory
pub const WATCH_MASK: u32 = IN_MODIFY
    | IN_ATTRIB
    | IN_CLOSE_WRITE
    | IN_MOVED_FROM
    | IN_MOVED_TO
    | IN_CREATE
    | IN_DELETE
    | IN_DELETE_SELF
    | IN_MOVE_SELF;

const ENTRY_BITS: u32 = IN_CREATE | IN_DELETE | IN_MOVED_FROM | IN_MOVED_TO;
const METADATA_BITS: u32 = IN_MODIFY | IN_ATTRIB | IN_CLOSE_WRITE;

/// One inotify event with its watch already resolved to a directory path
#[derive(Debug, Clone)]
pub struct InotifyRecord {
    pub dir: PathBuf,
    pub name: Option<OsString>,
    pub mask: u32,
    pub cookie: u32,
}

impl InotifyRecord {
    fn full_path(&self) -> PathBuf {
        match &self.name {
            Some(name) if !name.is_empty() => self.dir.join(name),
            _ => self.dir.clone(),
        }
    }
}

/// Output of the inotify normalizer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InotifyOutput {
    Event { event: WatchEvent, is_dir: bool },
    ChangesLost,
    /// A watched directory itself was deleted or moved away
    WatchGone(PathBuf),
    /// The kernel dropped a watch
    WatchRemoved(PathBuf),
}

/// Pairs move halves by cookie and maps mask bits onto operations
#[derive(Debug, Default)]
pub struct InotifyNormalizer {
    pending_moves: VecDeque<(u32, PathBuf, bool)>,
}

impl InotifyNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: InotifyRecord) -> Vec<InotifyOutput> {
        let mask = record.mask;
        let is_dir = mask & IN_ISDIR != 0;
        let path = record.full_path();

        if mask & IN_Q_OVERFLOW != 0 {
            return vec![InotifyOutput::ChangesLost];
        }
        if mask & IN_IGNORED != 0 {
            return vec![InotifyOutput::WatchRemoved(record.dir)];
        }
        if mask & (IN_DELETE_SELF | IN_MOVE_SELF | IN_UNMOUNT) != 0 {
            return vec![InotifyOutput::WatchGone(record.dir)];
        }

        if mask & ENTRY_BITS != 0 {
            if mask & IN_MOVED_FROM != 0 {
                self.pending_moves.push_back((record.cookie, path, is_dir));
                return Vec::new();
            }
            if mask & IN_MOVED_TO != 0 {
                let paired = self
                    .pending_moves
                    .iter()
                    .position(|(cookie, _, _)| *cookie == record.cookie && record.cookie != 0);
                let event = match paired.and_then(|index| self.pending_moves.remove(index)) {
                    Some((_, from, _)) => WatchEvent::moved(from, path),
                    None => WatchEvent::new(OperationType::Create, path),
                };
                return vec![InotifyOutput::Event { event, is_dir }];
            }
            let operation = if mask & IN_CREATE != 0 {
                OperationType::Create
            } else {
                OperationType::Delete
            };
            return vec![InotifyOutput::Event {
                event: WatchEvent::new(operation, path),
                is_dir,
            }];
        }

        if mask & METADATA_BITS != 0 && record.name.is_some() {
            return vec![InotifyOutput::Event {
                event: WatchEvent::new(OperationType::Edit, path),
                is_dir,
            }];
        }

        // IN_ACCESS, IN_OPEN, IN_CLOSE_NOWRITE and events on the directory itself
        Vec::new()
    }

    /// End of a read batch: move-froms still unpaired left the watched tree
    pub fn flush(&mut self) -> Vec<InotifyOutput> {
        self.pending_moves
            .drain(..)
            .map(|(_, path, is_dir)| InotifyOutput::Event {
                event: WatchEvent::new(OperationType::Delete, path),
                is_dir,
            })
            .collect()
    }
}

// ReadDirectoryChangesW FILE_ACTION_* values
pub const FILE_ACTION_ADDED: u32 = 1;
pub const FILE_ACTION_REMOVED: u32 = 2;
pub const FILE_ACTION_MODIFIED: u32 = 3;
pub const FILE_ACTION_RENAMED_OLD_NAME: u32 = 4;
pub const FILE_ACTION_RENAMED_NEW_NAME: u32 = 5;

/// What a backend knows about a path at normalization time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathState {
    Missing,
    File,
    Directory,
}

/// Correlates rename halves from one notification buffer
#[derive(Debug, Default)]
pub struct WindowsNormalizer {
    pending_old_name: Option<PathBuf>,
}

impl WindowsNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        action: u32,
        path: PathBuf,
        probe: impl Fn(&Path) -> PathState,
    ) -> Vec<WatchEvent> {
        let mut events = Vec::new();
        match action {
            FILE_ACTION_RENAMED_OLD_NAME => {
                if let Some(previous) = self.pending_old_name.replace(path) {
                    events.push(WatchEvent::new(OperationType::Delete, previous));
                }
            }
            FILE_ACTION_RENAMED_NEW_NAME => match (self.pending_old_name.take(), probe(&path)) {
                (Some(old), PathState::Missing) => {
                    events.push(WatchEvent::new(OperationType::Delete, old));
                }
                (Some(old), _) => events.push(WatchEvent::moved(old, path)),
                (None, PathState::Missing) => {}
                (None, _) => events.push(WatchEvent::new(OperationType::Create, path)),
            },
            _ => {
                events.extend(self.flush());
                match action {
                    FILE_ACTION_ADDED => events.push(WatchEvent::new(OperationType::Create, path)),
                    FILE_ACTION_REMOVED => events.push(WatchEvent::new(OperationType::Delete, path)),
                    // Directory modifications only mirror changes of their entries
                    FILE_ACTION_MODIFIED if probe(&path) == PathState::File => {
                        events.push(WatchEvent::new(OperationType::Edit, path))
                    }
                    _ => {}
                }
            }
        }
        events
    }

    /// End of a buffer: an old name without its new name left the watched tree
    pub fn flush(&mut self) -> Vec<WatchEvent> {
        self.pending_old_name
            .take()
            .map(|old| WatchEvent::new(OperationType::Delete, old))
            .into_iter()
            .collect()
    }
}

/// Normalize a `notify` event (FSEvents and fallback backends)
///
/// FSEvents reports each half of a rename separately and without pairing, so a
/// renamed path is classified by whether it still exists.
pub fn normalize_notify_event(event: &Event, exists: impl Fn(&Path) -> bool) -> Vec<WatcherMessage> {
    if matches!(event.flag(), Some(Flag::Rescan)) {
        return vec![WatcherMessage::ChangesLost];
    }

    let single = |operation: OperationType| -> Vec<WatcherMessage> {
        event
            .paths
            .iter()
            .map(|path| WatcherMessage::Event(WatchEvent::new(operation, path.clone())))
            .collect()
    };

    match &event.kind {
        EventKind::Create(_) => single(OperationType::Create),
        EventKind::Remove(_) => single(OperationType::Delete),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            vec![WatcherMessage::Event(WatchEvent::moved(
                event.paths[0].clone(),
                event.paths[1].clone(),
            ))]
        }
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .iter()
            .map(|path| {
                let operation = if exists(path) {
                    OperationType::Create
                } else {
                    OperationType::Delete
                };
                WatcherMessage::Event(WatchEvent::new(operation, path.clone()))
            })
            .collect(),
        EventKind::Modify(_) => single(OperationType::Edit),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(dir: &str, name: &str, mask: u32, cookie: u32) -> InotifyRecord {
        InotifyRecord {
            dir: PathBuf::from(dir),
            name: Some(OsString::from(name)),
            mask,
            cookie,
        }
    }

    fn event_of(output: &InotifyOutput) -> &WatchEvent {
        match output {
            InotifyOutput::Event { event, .. } => event,
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[test]
    fn test_moved_from_and_to_with_same_cookie_is_one_move() {
        let mut normalizer = InotifyNormalizer::new();
        assert!(normalizer.push(record("/r", "a", IN_MOVED_FROM, 42)).is_empty());
        let out = normalizer.push(record("/r/sub", "b", IN_MOVED_TO, 42));
        assert_eq!(out.len(), 1);
        assert_eq!(event_of(&out[0]), &WatchEvent::moved("/r/a", "/r/sub/b"));
        assert!(normalizer.flush().is_empty());
    }

    #[test]
    fn test_unpaired_move_halves() {
        let mut normalizer = InotifyNormalizer::new();
        normalizer.push(record("/r", "gone", IN_MOVED_FROM | IN_ISDIR, 7));
        let out = normalizer.push(record("/r", "arrived", IN_MOVED_TO, 8));
        assert_eq!(event_of(&out[0]).operation, OperationType::Create);

        let flushed = normalizer.flush();
        assert_eq!(flushed.len(), 1);
        match &flushed[0] {
            InotifyOutput::Event { event, is_dir } => {
                assert_eq!(event.operation, OperationType::Delete);
                assert_eq!(event.path, PathBuf::from("/r/gone"));
                assert!(*is_dir);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_mask_classification() {
        let mut normalizer = InotifyNormalizer::new();
        assert!(normalizer.push(record("/r", "f", IN_OPEN, 0)).is_empty());
        assert!(normalizer.push(record("/r", "f", IN_ACCESS | IN_CLOSE_NOWRITE, 0)).is_empty());
        let edit = normalizer.push(record("/r", "f", IN_CLOSE_WRITE, 0));
        assert_eq!(event_of(&edit[0]).operation, OperationType::Edit);
        let create = normalizer.push(record("/r", "d", IN_CREATE | IN_ISDIR, 0));
        assert!(matches!(&create[0], InotifyOutput::Event { is_dir: true, .. }));
        let overflow = normalizer.push(InotifyRecord {
            dir: PathBuf::from("/r"),
            name: None,
            mask: IN_Q_OVERFLOW,
            cookie: 0,
        });
        assert_eq!(overflow, vec![InotifyOutput::ChangesLost]);
    }

    #[test]
    fn test_windows_rename_pair() {
        let mut normalizer = WindowsNormalizer::new();
        let probe = |_: &Path| PathState::File;
        assert!(normalizer
            .push(FILE_ACTION_RENAMED_OLD_NAME, PathBuf::from("C:/r/a"), probe)
            .is_empty());
        let out = normalizer.push(FILE_ACTION_RENAMED_NEW_NAME, PathBuf::from("C:/r/b"), probe);
        assert_eq!(out, vec![WatchEvent::moved("C:/r/a", "C:/r/b")]);
    }

    #[test]
    fn test_windows_rename_to_vanished_path_is_delete() {
        let mut normalizer = WindowsNormalizer::new();
        normalizer.push(FILE_ACTION_RENAMED_OLD_NAME, PathBuf::from("C:/r/a"), |_: &Path| PathState::Missing);
        let out = normalizer.push(FILE_ACTION_RENAMED_NEW_NAME, PathBuf::from("C:/r/b"), |_: &Path| {
            PathState::Missing
        });
        assert_eq!(out, vec![WatchEvent::new(OperationType::Delete, "C:/r/a")]);

        normalizer.push(FILE_ACTION_RENAMED_OLD_NAME, PathBuf::from("C:/r/c"), |_: &Path| PathState::Missing);
        assert_eq!(
            normalizer.flush(),
            vec![WatchEvent::new(OperationType::Delete, "C:/r/c")]
        );
    }

    #[test]
    fn test_windows_directory_modification_is_ignored() {
        let mut normalizer = WindowsNormalizer::new();
        let out = normalizer.push(FILE_ACTION_MODIFIED, PathBuf::from("C:/r/dir"), |_: &Path| {
            PathState::Directory
        });
        assert!(out.is_empty());
    }

    #[test]
    fn test_notify_rename_reclassified_by_existence() {
        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Any)))
            .add_path(PathBuf::from("/r/old"))
            .add_path(PathBuf::from("/r/new"));
        let out = normalize_notify_event(&event, |path| path.ends_with("new"));
        assert_eq!(
            out,
            vec![
                WatcherMessage::Event(WatchEvent::new(OperationType::Delete, "/r/old")),
                WatcherMessage::Event(WatchEvent::new(OperationType::Create, "/r/new")),
            ]
        );
    }

    #[test]
    fn test_notify_rescan_is_changes_lost() {
        let event = Event::new(EventKind::Other).set_flag(Flag::Rescan);
        assert_eq!(
            normalize_notify_event(&event, |_| true),
            vec![WatcherMessage::ChangesLost]
        );
    }
}
