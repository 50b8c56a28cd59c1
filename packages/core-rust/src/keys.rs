//! File-record key and eTag derivation.
//!
//! File records are addressed by a key derived from their normalized path,
//! so the same file always maps to the same engine slot regardless of how
//! the caller spelled the path.

use std::path::{Component, Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

/// Lexically normalizes a path: resolves `.` and `..` components without
/// touching the filesystem.
///
/// Relative inputs are kept relative; `..` that would climb above the root
/// (or the start of a relative path) is dropped. Symlinks are not resolved,
/// so two spellings through different links stay distinct keys.
#[must_use]
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    // Nothing to climb out of; drop the component.
                }
            }
            other => normalized.push(other),
        }
    }
    normalized
}

/// Derives the record key for a file path: `base64(normalize_path(path))`.
#[must_use]
pub fn file_key(path: &Path) -> String {
    STANDARD.encode(normalize_path(path).to_string_lossy().as_bytes())
}

/// Recovers the normalized path from a file-record key.
///
/// Returns `None` for keys that are not valid base64 or not UTF-8.
#[must_use]
pub fn file_path_from_key(key: &str) -> Option<PathBuf> {
    let bytes = STANDARD.decode(key.as_bytes()).ok()?;
    let text = String::from_utf8(bytes).ok()?;
    Some(PathBuf::from(text))
}

/// Computes a file eTag from its size and modification time:
/// `base64("<size>-<mtime_ms>")`.
#[must_use]
pub fn file_etag(size: u64, mtime_ms: i64) -> String {
    STANDARD.encode(format!("{size}-{mtime_ms}").as_bytes())
}


#[cfg(test)]
mod prop_tests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn key_round_trips_for_utf8_paths(segments in proptest::collection::vec("[a-zA-Z0-9_.-]{1,12}", 1..6)) {
            let mut path = PathBuf::from("/");
            for segment in &segments {
                path.push(segment);
            }
            let normalized = normalize_path(&path);
            let key = file_key(&path);
            prop_assert_eq!(file_path_from_key(&key), Some(normalized));
        }

        #[test]
        fn normalization_is_idempotent(segments in proptest::collection::vec(prop_oneof!["[a-z]{1,8}".prop_map(String::from), Just(String::from(".")), Just(String::from(".."))], 0..8)) {
            let mut path = PathBuf::from("/");
            for segment in &segments {
                path.push(segment);
            }
            let once = normalize_path(&path);
            let twice = normalize_path(&once);
            prop_assert_eq!(once, twice);
        }
    }
}
