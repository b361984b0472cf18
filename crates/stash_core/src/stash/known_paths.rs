//! Known-paths side-index.
//!
//! A plain JSON set of every path this replica has locally observed, stored
//! at `.stash/known-paths.json` and never synced. It is what lets the
//! reconciler tell "the remote deleted a file we knew about" (honor the
//! delete) apart from "a file appeared that we never saw" (new local work to
//! resurrect).

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::fsutil::atomic_write;

#[derive(Debug, Default, Serialize, Deserialize)]
struct KnownPathsFile {
    #[serde(default)]
    paths: Vec<String>,
}

/// Set of paths this replica has observed at least once.
#[derive(Debug, Default, Clone)]
pub struct KnownPaths {
    paths: BTreeSet<String>,
}

impl KnownPaths {
    /// Load from `path`, returning an empty set when the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) => {
                let file: KnownPathsFile = serde_json::from_slice(&bytes)?;
                Ok(Self {
                    paths: file.paths.into_iter().collect(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist atomically; the sorted set keeps the file deterministic.
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = KnownPathsFile {
            paths: self.paths.iter().cloned().collect(),
        };
        atomic_write(path, &serde_json::to_vec_pretty(&file)?)
    }

    /// Whether `path` has been observed by this replica.
    pub fn contains(&self, path: &str) -> bool {
        self.paths.contains(path)
    }

    /// Record an observation. Returns true when the path was new.
    pub fn insert(&mut self, path: &str) -> bool {
        self.paths.insert(path.to_string())
    }

    /// Forget a path (done only when honoring a remote delete).
    pub fn remove(&mut self, path: &str) -> bool {
        self.paths.remove(path)
    }

    /// Drop every recorded path.
    pub fn clear(&mut self) {
        self.paths.clear();
    }

    /// Sorted view of the recorded paths.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(|s| s.as_str())
    }

    /// Number of recorded paths.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Whether no path has been recorded.
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}
