//! Ignore patterns
//!
//! Gitignore-style patterns over root-relative paths: `*` matches within one
//! component, `**` matches any number of components, a trailing `/` limits a
//! pattern to directories. A path below an ignored directory is ignored too.

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct IgnoreMatcher {
    patterns: Gitignore,
}

impl Default for IgnoreMatcher {
    fn default() -> Self {
        Self {
            patterns: Gitignore::empty(),
        }
    }
}

impl IgnoreMatcher {
    /// Invalid patterns are logged and skipped
    pub fn new(patterns: &[String]) -> Self {
        let mut builder = GitignoreBuilder::new(".");
        for pattern in patterns {
            if let Err(e) = builder.add_line(None, pattern) {
                warn!(pattern = %pattern, error = %e, "Skipping invalid ignore pattern");
            }
        }
        match builder.build() {
            Ok(patterns) => Self { patterns },
            Err(e) => {
                warn!(error = %e, "Ignore patterns unusable, nothing will be ignored");
                Self::default()
            }
        }
    }

    /// Whether a root-relative path matches any pattern
    pub fn is_ignored(&self, relative: &Path) -> bool {
        if relative.as_os_str().is_empty() || relative.has_root() {
            return false;
        }
        self.patterns
            .matched_path_or_any_parents(relative, false)
            .is_ignore()
    }

    pub fn len(&self) -> usize {
        self.patterns.num_ignores() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
