//! Sync snapshot: the fingerprint triple used to detect changes since the
//! last successful push.
//!
//! A snapshot records the structure document's heads, every file document's
//! heads, and a per-path content fingerprint (joined heads for text, the
//! blob hash for binary). Comparing the current snapshot against the
//! last-pushed one yields both the `hasLocalChanges` bit and the incremental
//! `changedPaths` hint handed to the transport.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Virtual path naming the structure document in push payloads.
pub const STRUCTURE_VIRTUAL_PATH: &str = ".stash/structure.automerge";

/// Compact summary of what was last pushed or last fully agreed with remote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSnapshot {
    /// Heads of the structure document, hex, in order.
    pub structure: Vec<String>,

    /// Per-doc-id heads of every referenced file document.
    pub docs: BTreeMap<String, Vec<String>>,

    /// Per-path content fingerprint of every active file.
    pub files: BTreeMap<String, String>,
}

impl SyncSnapshot {
    /// Whether this snapshot differs from the last-pushed one.
    ///
    /// A missing last-pushed snapshot always counts as changed: nothing has
    /// ever been pushed.
    pub fn differs_from(&self, last_pushed: Option<&SyncSnapshot>) -> bool {
        match last_pushed {
            Some(last) => self != last,
            None => true,
        }
    }

    /// Paths that changed between `last_pushed` and this snapshot.
    ///
    /// Includes the virtual `.stash/structure.automerge` path when the
    /// structure heads moved and `.stash/docs/<docId>.automerge` for every
    /// doc whose heads moved. An empty result with no last-pushed snapshot
    /// means "push everything" by the transport contract.
    pub fn changed_paths(&self, last_pushed: Option<&SyncSnapshot>) -> BTreeSet<String> {
        let mut changed = BTreeSet::new();
        let last = match last_pushed {
            Some(last) => last,
            // Full push: the empty hint tells the transport to push all.
            None => return changed,
        };

        if self.structure != last.structure {
            changed.insert(STRUCTURE_VIRTUAL_PATH.to_string());
        }

        let doc_ids: BTreeSet<&String> = self.docs.keys().chain(last.docs.keys()).collect();
        for id in doc_ids {
            if self.docs.get(id) != last.docs.get(id) {
                changed.insert(doc_virtual_path(id));
            }
        }

        let paths: BTreeSet<&String> = self.files.keys().chain(last.files.keys()).collect();
        for path in paths {
            if self.files.get(path) != last.files.get(path) {
                changed.insert(path.to_string());
            }
        }

        changed
    }
}

/// Virtual path naming a file document in push payloads.
pub fn doc_virtual_path(doc_id: &str) -> String {
    format!(".stash/docs/{doc_id}.automerge")
}
