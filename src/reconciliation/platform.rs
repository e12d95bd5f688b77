//! Platform-inconsistency check
//!
//! Names that the destination replica cannot store are flagged unsyncable and
//! kept out of diffing, together with everything below them.

use crate::snapshot::{NameCaseRule, Snapshot};
use crate::types::{NodeId, ReplicaSide, SyncPath};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use unicode_normalization::UnicodeNormalization;

/// Longest component, in bytes, accepted by every supported file system
pub const MAX_NAME_BYTES: usize = 255;

const WINDOWS_RESERVED_CHARS: &[char] = &['<', '>', ':', '"', '\\', '|', '?', '*'];

const WINDOWS_DEVICE_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Naming rules a replica must satisfy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetPlatform {
    /// Intersection of every platform's rules
    #[default]
    Portable,
    Windows,
    Macos,
    Linux,
}

impl TargetPlatform {
    /// Platform the process runs on
    pub fn local() -> Self {
        if cfg!(windows) {
            TargetPlatform::Windows
        } else if cfg!(target_os = "macos") {
            TargetPlatform::Macos
        } else {
            TargetPlatform::Linux
        }
    }

    fn windows_rules(self) -> bool {
        matches!(self, TargetPlatform::Portable | TargetPlatform::Windows)
    }

    /// Whether sibling names differing only by case collide
    pub fn case_rule(self) -> NameCaseRule {
        match self {
            TargetPlatform::Linux => NameCaseRule::Sensitive,
            _ => NameCaseRule::Insensitive,
        }
    }
}

/// Why a name cannot be synchronized
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvalidNameReason {
    ReservedCharacter(char),
    ControlCharacter,
    ReservedDeviceName,
    TrailingDotOrSpace,
    NameTooLong(usize),
    /// Another sibling has the same name once case and normalization are folded
    Clash(String),
}

impl fmt::Display for InvalidNameReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidNameReason::ReservedCharacter(c) => write!(f, "reserved character '{}'", c),
            InvalidNameReason::ControlCharacter => write!(f, "control character"),
            InvalidNameReason::ReservedDeviceName => write!(f, "reserved device name"),
            InvalidNameReason::TrailingDotOrSpace => write!(f, "trailing dot or space"),
            InvalidNameReason::NameTooLong(len) => {
                write!(f, "name is {} bytes, limit is {}", len, MAX_NAME_BYTES)
            }
            InvalidNameReason::Clash(other) => write!(f, "clashes with sibling '{}'", other),
        }
    }
}

/// Check one name against a platform's rules
pub fn check_name(name: &str, platform: TargetPlatform) -> Option<InvalidNameReason> {
    if name.len() > MAX_NAME_BYTES {
        return Some(InvalidNameReason::NameTooLong(name.len()));
    }
    if name.chars().any(|c| c == '\0' || (platform.windows_rules() && c.is_control())) {
        return Some(InvalidNameReason::ControlCharacter);
    }
    if !platform.windows_rules() {
        return None;
    }
    if let Some(c) = name.chars().find(|c| WINDOWS_RESERVED_CHARS.contains(c)) {
        return Some(InvalidNameReason::ReservedCharacter(c));
    }
    if name.ends_with('.') || name.ends_with(' ') {
        return Some(InvalidNameReason::TrailingDotOrSpace);
    }
    // "NUL.txt" is as reserved as "NUL"
    let stem = name.split('.').next().unwrap_or(name).trim_end();
    if WINDOWS_DEVICE_NAMES
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(stem))
    {
        return Some(InvalidNameReason::ReservedDeviceName);
    }
    None
}

/// Item excluded from diffing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsyncableItem {
    pub side: ReplicaSide,
    pub id: NodeId,
    pub path: SyncPath,
    pub reason: InvalidNameReason,
}

/// Flag every item of `snapshot` whose name the destination cannot hold.
///
/// Returns the flagged items and the set of excluded ids (flagged items and
/// their descendants).
pub fn check_snapshot(
    snapshot: &Snapshot,
    destination: TargetPlatform,
) -> (Vec<UnsyncableItem>, HashSet<NodeId>) {
    let mut flagged: Vec<(NodeId, InvalidNameReason)> = Vec::new();
    let dest_rule = destination.case_rule();

    let mut parents: Vec<&NodeId> = Vec::new();
    parents.push(snapshot.root_id());
    for item in snapshot.items() {
        if item.is_dir() {
            parents.push(&item.id);
        }
    }

    for parent in parents {
        let mut seen: HashMap<String, String> = HashMap::new();
        let mut children: Vec<_> = snapshot.children(parent).collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        for child in children {
            if let Some(reason) = check_name(&child.name, destination) {
                flagged.push((child.id.clone(), reason));
                continue;
            }
            let key = match dest_rule {
                NameCaseRule::Sensitive => child.name.nfc().collect::<String>(),
                NameCaseRule::Insensitive => dest_rule.key(&child.name),
            };
            match seen.get(&key) {
                Some(first) => flagged.push((child.id.clone(), InvalidNameReason::Clash(first.clone()))),
                None => {
                    seen.insert(key, child.name.clone());
                }
            }
        }
    }

    let mut excluded = HashSet::new();
    let mut unsyncable = Vec::with_capacity(flagged.len());
    for (id, reason) in flagged {
        excluded.extend(snapshot.subtree(&id));
        let path = snapshot.path(&id).map(|(path, _)| path).unwrap_or_default();
        unsyncable.push(UnsyncableItem {
            side: snapshot.side(),
            id,
            path,
            reason,
        });
    }
    (unsyncable, excluded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SnapshotItem;
    use crate::types::NodeType;

    #[test]
    fn test_reserved_windows_names() {
        let portable = TargetPlatform::Portable;
        assert_eq!(check_name("CON", portable), Some(InvalidNameReason::ReservedDeviceName));
        assert_eq!(check_name("nul.txt", portable), Some(InvalidNameReason::ReservedDeviceName));
        assert_eq!(check_name("a:b", portable), Some(InvalidNameReason::ReservedCharacter(':')));
        assert_eq!(check_name("trailing.", portable), Some(InvalidNameReason::TrailingDotOrSpace));
        assert_eq!(check_name("console.log", portable), None);
        assert_eq!(check_name("CON", TargetPlatform::Linux), None);
    }

    #[test]
    fn test_overlong_name() {
        let name = "x".repeat(MAX_NAME_BYTES + 1);
        assert_eq!(
            check_name(&name, TargetPlatform::Linux),
            Some(InvalidNameReason::NameTooLong(MAX_NAME_BYTES + 1))
        );
    }

    #[test]
    fn test_case_clash_excludes_later_sibling_and_its_subtree() {
        let mut snapshot = Snapshot::new(ReplicaSide::Local, "root", NameCaseRule::Sensitive);
        snapshot
            .upsert(SnapshotItem::new("1", "root", "Docs", NodeType::Directory))
            .unwrap();
        snapshot
            .upsert(SnapshotItem::new("2", "root", "docs", NodeType::Directory))
            .unwrap();
        snapshot
            .upsert(SnapshotItem::new("3", "2", "a.txt", NodeType::File))
            .unwrap();

        let (flagged, excluded) = check_snapshot(&snapshot, TargetPlatform::Windows);
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].id, "2");
        assert_eq!(flagged[0].reason, InvalidNameReason::Clash("Docs".to_string()));
        assert!(excluded.contains("3"));
        assert!(!excluded.contains("1"));

        let (flagged, _) = check_snapshot(&snapshot, TargetPlatform::Linux);
        assert!(flagged.is_empty());
    }
}
