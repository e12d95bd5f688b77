//! Name comparison rules and path shape checks.

use std::path::{Component, Path};
use unicode_normalization::UnicodeNormalization;

/// How sibling names are compared for uniqueness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameCaseRule {
    Sensitive,
    Insensitive,
}

impl NameCaseRule {
    /// Rule of the file system the process runs on
    pub fn for_local_platform() -> Self {
        if cfg!(any(target_os = "macos", windows)) {
            NameCaseRule::Insensitive
        } else {
            NameCaseRule::Sensitive
        }
    }

    /// Comparison key: NFC form, lowercased when case-insensitive
    pub fn key(&self, name: &str) -> String {
        let normalized: String = name.nfc().collect();
        match self {
            NameCaseRule::Sensitive => normalized,
            NameCaseRule::Insensitive => normalized.to_lowercase(),
        }
    }

    pub fn same_name(&self, a: &str, b: &str) -> bool {
        self.key(a) == self.key(b)
    }
}

/// Whether a relative path starts with a root-name component (drive letter or UNC prefix)
pub fn has_root_name(path: &Path) -> bool {
    match path.components().next() {
        Some(Component::Prefix(_)) => true,
        Some(Component::Normal(first)) => {
            let first = first.to_string_lossy();
            let bytes = first.as_bytes();
            (bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':')
                || first.starts_with("\\\\")
        }
        _ => false,
    }
}

/// Names that can never be stored as a single path component on any replica
pub fn is_structurally_invalid(name: &str) -> bool {
    name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0')
}
