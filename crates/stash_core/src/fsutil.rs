//! Filesystem helpers shared by the stash, blob store, and reconciler.
//!
//! All persistent artifacts are written atomically (tmp file + rename) with
//! owner-only permissions: directories 0o700, files 0o600.

use std::fs;
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::{Result, StashError};

/// Name of the per-stash metadata directory.
pub const STASH_DIR: &str = ".stash";

/// Create a directory (and parents) with owner-only permissions.
pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Atomically write `bytes` to `path` via a temp file in the same directory.
///
/// The rename guarantees readers never observe a partial file; the 0o600 mode
/// is applied before the rename so the content is never world-readable.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| StashError::Validation(format!("no parent directory: {}", path.display())))?;
    fs::create_dir_all(dir)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(
            "{}.",
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "artifact".to_string())
        ))
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| StashError::FileWrite {
            path: path.to_path_buf(),
            source: e,
        })?;

    use std::io::Write;
    tmp.write_all(bytes).map_err(|e| StashError::FileWrite {
        path: path.to_path_buf(),
        source: e,
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600))?;
    }

    tmp.persist(path)
        .map_err(|e| StashError::FileWrite {
            path: path.to_path_buf(),
            source: e.error,
        })?;
    Ok(())
}

/// SHA-256 of `bytes` as 64 lowercase hex characters.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Decide whether raw bytes are text.
///
/// Bytes are text iff they decode as valid UTF-8 and the decoded string
/// contains no replacement character. A file that fails either check is
/// treated as binary and routed to the blob store.
pub fn decode_text(bytes: &[u8]) -> Option<String> {
    match std::str::from_utf8(bytes) {
        Ok(s) if !s.contains('\u{FFFD}') => Some(s.to_string()),
        _ => None,
    }
}

/// True when any path component is a dot-entry (`.git`, `.stash`, dotfiles).
pub fn has_hidden_component(rel: &Path) -> bool {
    rel.components().any(|c| match c {
        Component::Normal(name) => name.to_string_lossy().starts_with('.'),
        _ => false,
    })
}

/// Convert a path relative to the stash root into the forward-slash string
/// keys used by the structure document.
pub fn rel_to_key(rel: &Path) -> String {
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    parts.join("/")
}

/// Walk the working tree under `root`, returning forward-slash keys for every
/// regular file outside `.stash/` and dot-entries. Sorted for determinism.
pub fn walk_tree(root: &Path) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| StashError::Io(std::io::Error::other(e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = match entry.path().strip_prefix(root) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        if has_hidden_component(rel) {
            continue;
        }
        keys.push(rel_to_key(rel));
    }
    keys.sort();
    Ok(keys)
}

/// Remove now-empty ancestor directories of `path`, stopping at (and never
/// removing) `root`.
pub fn remove_empty_parents(path: &Path, root: &Path) {
    let mut dir = match path.parent() {
        Some(d) => d.to_path_buf(),
        None => return,
    };
    while dir.starts_with(root) && dir != root {
        match fs::read_dir(&dir) {
            Ok(mut entries) => {
                if entries.next().is_some() {
                    return;
                }
            }
            Err(_) => return,
        }
        if fs::remove_dir(&dir).is_err() {
            return;
        }
        dir = match dir.parent() {
            Some(d) => d.to_path_buf(),
            None => return,
        };
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// The `.stash/` directory for a stash rooted at `root`.
pub fn stash_dir(root: &Path) -> PathBuf {
    root.join(STASH_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_decode_text_rejects_invalid_utf8() {
        assert_eq!(decode_text(b"plain text"), Some("plain text".to_string()));
        assert_eq!(decode_text(&[0xff, 0xfe, 0x00]), None);
        // A literal replacement character also routes to binary.
        assert_eq!(decode_text("bad \u{FFFD} byte".as_bytes()), None);
    }

    #[test]
    fn test_hidden_components() {
        assert!(has_hidden_component(Path::new(".stash/meta.json")));
        assert!(has_hidden_component(Path::new("sub/.hidden/file.md")));
        assert!(!has_hidden_component(Path::new("sub/file.md")));
    }

    #[test]
    fn test_atomic_write_and_walk() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        atomic_write(&root.join("a.md"), b"a").unwrap();
        atomic_write(&root.join("sub/b.md"), b"b").unwrap();
        atomic_write(&root.join(".stash/meta.json"), b"{}").unwrap();

        let keys = walk_tree(root).unwrap();
        assert_eq!(keys, vec!["a.md".to_string(), "sub/b.md".to_string()]);
    }

    #[test]
    fn test_remove_empty_parents_stops_at_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let deep = root.join("a/b/c/file.md");
        std::fs::create_dir_all(deep.parent().unwrap()).unwrap();
        std::fs::write(&deep, "x").unwrap();
        std::fs::remove_file(&deep).unwrap();

        remove_empty_parents(&deep, root);
        assert!(!root.join("a").exists());
        assert!(root.exists());
    }
}
