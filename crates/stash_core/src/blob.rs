//! Content-addressed blob store for binary file payloads.
//!
//! Binary file documents carry only `{hash, size}`; the bytes themselves
//! live here, at `.stash/blobs/<hash>.bin`, keyed by SHA-256. Blobs are
//! written atomically and garbage-collected when no structure entry (active
//! or tombstoned) references their hash any longer.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, StashError};
use crate::fsutil::{atomic_write, ensure_dir, sha256_hex};

/// On-disk store of binary payloads keyed by their SHA-256 hash.
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    /// Open (creating if needed) the blob directory.
    pub fn open(dir: PathBuf) -> Result<Self> {
        ensure_dir(&dir)?;
        Ok(Self { dir })
    }

    /// Store `bytes`, returning their hash. Writing an already-present blob
    /// is a no-op.
    pub fn write(&self, bytes: &[u8]) -> Result<String> {
        let hash = sha256_hex(bytes);
        let path = self.path_for(&hash);
        if !path.exists() {
            atomic_write(&path, bytes)?;
        }
        Ok(hash)
    }

    /// Read the payload for `hash`.
    pub fn read(&self, hash: &str) -> Result<Vec<u8>> {
        let path = self.path_for(hash);
        fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StashError::NotFound(format!("blob {hash}"))
            } else {
                StashError::FileRead { path, source: e }
            }
        })
    }

    /// Whether a payload for `hash` is present.
    pub fn contains(&self, hash: &str) -> bool {
        self.path_for(hash).exists()
    }

    /// Unlink the payload for `hash` if present.
    pub fn remove(&self, hash: &str) -> Result<()> {
        let path = self.path_for(hash);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StashError::Io(e)),
        }
    }

    /// Hashes of every stored blob.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut hashes = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(hashes),
            Err(e) => return Err(StashError::Io(e)),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(hash) = name.strip_suffix(".bin") {
                hashes.push(hash.to_string());
            }
        }
        hashes.sort();
        Ok(hashes)
    }

    /// Drop every blob whose hash is not in `referenced`, returning how many
    /// were unlinked.
    pub fn collect_garbage<'a>(
        &self,
        referenced: impl IntoIterator<Item = &'a str>,
    ) -> Result<usize> {
        let keep: std::collections::HashSet<&str> = referenced.into_iter().collect();
        let mut removed = 0;
        for hash in self.list()? {
            if !keep.contains(hash.as_str()) {
                log::debug!("blob gc: removing unreferenced {hash}");
                self.remove(&hash)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Filesystem path of the payload for `hash`.
    pub fn path_for(&self, hash: &str) -> PathBuf {
        self.dir.join(format!("{hash}.bin"))
    }

    /// The blob directory itself.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
