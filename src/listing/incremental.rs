//! Incremental listing payloads
//!
//! `listing/continue` returns the actions that happened after a cursor;
//! `listing/listen` long-polls until something changes.

use crate::snapshot::SnapshotItem;
use crate::types::{NodeId, NodeType, SyncTime};
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

/// Server-side upper bound on a long-poll request
pub const MAX_LISTEN_TIMEOUT: Duration = Duration::from_secs(59);

/// Clamp a requested long-poll timeout below the server limit
pub fn clamp_listen_timeout(requested: Duration) -> Duration {
    requested.min(MAX_LISTEN_TIMEOUT).max(Duration::from_secs(1))
}

/// Action kinds reported by `listing/continue`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    FileCreate,
    FileEdit,
    FileRename,
    FileMoveIn,
    FileMoveOut,
    FileTrash,
    FileDelete,
    FileRestore,
    FileRights,
    #[serde(other)]
    Unknown,
}

impl ActionKind {
    /// Whether the action removes the item from the synchronized tree
    pub fn is_removal(self) -> bool {
        matches!(
            self,
            ActionKind::FileMoveOut | ActionKind::FileTrash | ActionKind::FileDelete
        )
    }
}

/// Write capability of a remote file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub can_write: bool,
}

/// File metadata attached to an action or returned by file operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    #[serde(deserialize_with = "id_from_number_or_string")]
    pub id: NodeId,
    #[serde(deserialize_with = "id_from_number_or_string")]
    pub parent_id: NodeId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub size: Option<i64>,
    #[serde(default)]
    pub created_at: Option<SyncTime>,
    #[serde(default)]
    pub last_modified_at: Option<SyncTime>,
    #[serde(default)]
    pub capabilities: Option<Capabilities>,
    #[serde(default)]
    pub is_link: Option<bool>,
}

impl RemoteFile {
    pub fn node_type(&self) -> NodeType {
        if self.kind == "dir" {
            NodeType::Directory
        } else {
            NodeType::File
        }
    }

    pub fn to_item(&self) -> SnapshotItem {
        let mut item = SnapshotItem::new(
            self.id.clone(),
            self.parent_id.clone(),
            self.name.clone(),
            self.node_type(),
        )
        .with_size(self.size.unwrap_or(0).max(0))
        .with_times(
            self.created_at.unwrap_or(0),
            self.last_modified_at.unwrap_or(0),
        )
        .with_can_write(self.capabilities.map(|c| c.can_write).unwrap_or(true));
        item.is_link = self.is_link.unwrap_or(false);
        item
    }
}

/// One change reported after a cursor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingAction {
    pub action: ActionKind,
    pub file: RemoteFile,
}

/// `listing/continue` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinueResponse {
    pub cursor: String,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub actions: Vec<ListingAction>,
}

/// `listing/listen` response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenResponse {
    pub has_changes: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Number(u64),
    Text(String),
}

fn id_from_number_or_string<'de, D>(deserializer: D) -> Result<NodeId, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match RawId::deserialize(deserializer)? {
        RawId::Number(n) => n.to_string(),
        RawId::Text(s) => s,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_continue_payload() {
        let json = r#"{
            "cursor": "c2",
            "has_more": false,
            "actions": [
                {"action": "file_create", "file": {"id": 12, "parent_id": 1, "name": "a.txt", "type": "file",
                 "size": 4, "created_at": 10, "last_modified_at": 11, "capabilities": {"can_write": false}}},
                {"action": "file_trash", "file": {"id": "13", "parent_id": "1", "name": "old", "type": "dir"}},
                {"action": "file_share_update", "file": {"id": 14, "parent_id": 1, "name": "x", "type": "file"}}
            ]
        }"#;
        let response: ContinueResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.cursor, "c2");
        assert_eq!(response.actions.len(), 3);

        let created = response.actions[0].file.to_item();
        assert_eq!(created.id, "12");
        assert_eq!(created.last_modified, 11);
        assert!(!created.can_write);

        assert!(response.actions[1].action.is_removal());
        assert_eq!(response.actions[1].file.node_type(), NodeType::Directory);
        assert_eq!(response.actions[2].action, ActionKind::Unknown);
    }

    #[test]
    fn test_listen_timeout_is_clamped() {
        assert_eq!(clamp_listen_timeout(Duration::from_secs(120)), MAX_LISTEN_TIMEOUT);
        assert_eq!(clamp_listen_timeout(Duration::from_secs(30)), Duration::from_secs(30));
    }
}
