//! Conflict Resolution for Sync Operations
//!
//! A conflict exists when a tracked file changed locally and its remote copy
//! moved away from the last synced fingerprint as well.
//!
//! ## Strategies
//!
//! - **KeepLocal**: overwrite the remote with local content
//! - **KeepRemote**: overwrite the local file with remote content
//! - **Merge**: line-level union for text files; binary content (or a local
//!   deletion) falls back to the configured overwrite strategy
//! - **Prompt**: leave the conflict unresolved for manual resolution
//!
//! ## Usage
//!
//! ```
//! use core_runtime::config::ConflictStrategy;
//! use core_sync::conflict_resolver::{ConflictResolver, Resolution};
//!
//! let resolver = ConflictResolver::new(ConflictStrategy::Merge, ConflictStrategy::KeepLocal);
//! let outcome = resolver.resolve("todo.md", Some(b"a\nb\n".as_slice()), b"a\nc\n");
//! assert!(matches!(outcome, Resolution::Merged(_)));
//! ```

use bytes::Bytes;
use core_runtime::config::{ConflictStrategy, SyncSettings};
use std::collections::HashSet;
use tracing::debug;

/// Extensions treated as line-oriented text
pub const TEXT_EXTENSIONS: &[&str] = &["md", "txt", "json", "yaml", "yml", "csv", "org"];

pub const MERGE_MARKER_START: &str = "<<<<<<< remote changes";
pub const MERGE_MARKER_END: &str = ">>>>>>> remote changes";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Push the local side (or the local deletion) to the remote
    KeepLocal,
    /// Write the remote side over the local file
    KeepRemote,
    /// Write this content to both sides
    Merged(Bytes),
    /// Leave both sides untouched and surface the conflict
    Unresolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictResolver {
    strategy: ConflictStrategy,
    merge_fallback: ConflictStrategy,
}

impl ConflictResolver {
    /// A non-overwrite `merge_fallback` is replaced by keep-local.
    pub fn new(strategy: ConflictStrategy, merge_fallback: ConflictStrategy) -> Self {
        let merge_fallback = if merge_fallback.is_overwrite() {
            merge_fallback
        } else {
            ConflictStrategy::KeepLocal
        };
        Self {
            strategy,
            merge_fallback,
        }
    }

    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self::new(settings.conflict_strategy, settings.merge_fallback)
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    /// Applies the configured strategy. `local` is `None` when the local file
    /// was deleted.
    pub fn resolve(&self, path: &str, local: Option<&[u8]>, remote: &[u8]) -> Resolution {
        self.resolve_with(self.strategy, path, local, remote)
    }

    pub fn resolve_with(
        &self,
        strategy: ConflictStrategy,
        path: &str,
        local: Option<&[u8]>,
        remote: &[u8],
    ) -> Resolution {
        match strategy {
            ConflictStrategy::KeepLocal => Resolution::KeepLocal,
            ConflictStrategy::KeepRemote => Resolution::KeepRemote,
            ConflictStrategy::Prompt => Resolution::Unresolved,
            ConflictStrategy::Merge => {
                let texts = local.filter(|_| is_text_path(path)).and_then(|local| {
                    Some((
                        std::str::from_utf8(local).ok()?,
                        std::str::from_utf8(remote).ok()?,
                    ))
                });

                match texts {
                    Some((local, remote)) => {
                        Resolution::Merged(Bytes::from(merge_lines(local, remote)))
                    }
                    None => {
                        debug!(
                            path,
                            fallback = %self.merge_fallback,
                            "Merge not possible, using fallback"
                        );
                        self.resolve_with(self.merge_fallback, path, local, remote)
                    }
                }
            }
        }
    }
}

pub fn is_text_path(path: &str) -> bool {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            let ext = ext.to_ascii_lowercase();
            TEXT_EXTENSIONS.contains(&ext.as_str())
        }
        _ => false,
    }
}

/// Keeps every local line in order and appends non-blank remote lines the
/// local side lacks, fenced by conflict markers.
///
/// Merging an already merged result with the same remote is a no-op.
pub fn merge_lines(local: &str, remote: &str) -> String {
    let local_lines: HashSet<&str> = local.lines().collect();
    let remote_only: Vec<&str> = remote
        .lines()
        .filter(|line| !line.trim().is_empty() && !local_lines.contains(line))
        .collect();

    if remote_only.is_empty() {
        return local.to_string();
    }

    let mut merged = String::with_capacity(local.len() + remote.len() + 64);
    merged.push_str(local);
    if !merged.is_empty() && !merged.ends_with('\n') {
        merged.push('\n');
    }
    merged.push_str(MERGE_MARKER_START);
    merged.push('\n');
    for line in remote_only {
        merged.push_str(line);
        merged.push('\n');
    }
    merged.push_str(MERGE_MARKER_END);
    merged.push('\n');
    merged
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overwrite_strategies() {
        let local = ConflictResolver::new(ConflictStrategy::KeepLocal, ConflictStrategy::KeepLocal);
        assert_eq!(local.resolve("a.md", Some(b"x".as_slice()), b"y"), Resolution::KeepLocal);

        let remote =
            ConflictResolver::new(ConflictStrategy::KeepRemote, ConflictStrategy::KeepLocal);
        assert_eq!(remote.resolve("a.md", None, b"y"), Resolution::KeepRemote);

        let prompt = ConflictResolver::new(ConflictStrategy::Prompt, ConflictStrategy::KeepLocal);
        assert_eq!(prompt.resolve("a.md", Some(b"x".as_slice()), b"y"), Resolution::Unresolved);
    }

    #[test]
    fn test_merge_text() {
        let resolver = ConflictResolver::new(ConflictStrategy::Merge, ConflictStrategy::KeepLocal);
        let outcome = resolver.resolve("list.md", Some(b"- milk\n- eggs".as_slice()), b"- milk\n- bread\n");

        let expected = "- milk\n- eggs\n<<<<<<< remote changes\n- bread\n>>>>>>> remote changes\n";
        assert_eq!(outcome, Resolution::Merged(Bytes::from(expected)));
    }

    #[test]
    fn test_merge_binary_falls_back() {
        let resolver =
            ConflictResolver::new(ConflictStrategy::Merge, ConflictStrategy::KeepRemote);
        assert_eq!(
            resolver.resolve("photo.png", Some(b"\x89PNG".as_slice()), b"\x89PNG2"),
            Resolution::KeepRemote
        );

        // Text extension, invalid UTF-8
        assert_eq!(
            resolver.resolve("notes.txt", Some([0xffu8, 0xfe].as_slice()), b"ok"),
            Resolution::KeepRemote
        );

        // Local deletion
        assert_eq!(resolver.resolve("notes.txt", None, b"ok"), Resolution::KeepRemote);
    }

    #[test]
    fn test_prompt_fallback_is_replaced() {
        let resolver = ConflictResolver::new(ConflictStrategy::Merge, ConflictStrategy::Prompt);
        assert_eq!(
            resolver.resolve("photo.jpg", Some(b"a".as_slice()), b"b"),
            Resolution::KeepLocal
        );
    }

    #[test]
    fn test_merge_lines_is_stable() {
        let once = merge_lines("a\nb\n", "a\nc\n\n");
        assert_eq!(once, "a\nb\n<<<<<<< remote changes\nc\n>>>>>>> remote changes\n");
        assert_eq!(merge_lines(&once, "a\nc\n"), once);
        assert_eq!(merge_lines("same\n", "same\n"), "same\n");
        assert_eq!(
            merge_lines("", "only remote"),
            "<<<<<<< remote changes\nonly remote\n>>>>>>> remote changes\n"
        );
    }

    #[test]
    fn test_text_detection() {
        assert!(is_text_path("notes/todo.MD"));
        assert!(is_text_path("data.yml"));
        assert!(!is_text_path("photo.jpg"));
        assert!(!is_text_path(".md"));
        assert!(!is_text_path("dir.md/file"));
    }
}
