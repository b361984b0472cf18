//! Structure document: the CRDT mapping of file paths to file documents.
//!
//! Each tracked path is a map at the document root holding `{docId, created,
//! deleted}`. Deletes are soft: `remove` sets the tombstone and keeps the
//! entry so concurrent replicas observe the delete through merge. Adding a
//! tombstoned path again (resurrection) allocates a fresh doc id and clears
//! the tombstone.
//!
//! Concurrent `add`/`remove` of the same path resolve by automerge's
//! last-writer-wins tie-break and may land either way; the sync controller's
//! content-wins rule corrects spurious tombstones afterwards.

use automerge::transaction::Transactable;
use automerge::{ActorId, AutoCommit, ObjId, ObjType, ReadDoc, ScalarValue, Value};

use crate::error::{Result, StashError};
use crate::fsutil::now_ms;

/// Identifier of a file document, stable across renames.
pub type DocId = String;

/// Generate a fresh, time-ordered file-doc identifier.
pub fn new_doc_id() -> DocId {
    uuid::Uuid::now_v7().to_string()
}

/// One entry of the structure document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructureEntry {
    /// Identifier of the file document holding this path's content.
    pub doc_id: DocId,
    /// Creation time, milliseconds since the Unix epoch.
    pub created: i64,
    /// Tombstone flag; a deleted entry is retained for causal ordering.
    pub deleted: bool,
}

/// CRDT document mapping forward-slash paths to [`StructureEntry`] values.
pub struct StructureDoc {
    doc: AutoCommit,
}

impl StructureDoc {
    /// Create a new empty structure document owned by `actor`.
    pub fn new(actor: ActorId) -> Self {
        Self {
            doc: AutoCommit::new().with_actor(actor),
        }
    }

    /// Load a structure document from an automerge binary save.
    pub fn load(bytes: &[u8], actor: ActorId) -> Result<Self> {
        let doc = AutoCommit::load(bytes)?;
        Ok(Self {
            doc: doc.with_actor(actor),
        })
    }

    /// Track `path`, returning the doc id now bound to it.
    ///
    /// When `doc_id` is `None` a fresh id is generated; this is what makes a
    /// resurrection a *new* file rather than a revival of the tombstoned doc.
    /// The tombstone is always explicitly cleared. An explicit `doc_id` that
    /// matches the existing entry keeps its `created` stamp (the
    /// merge-restore path); anything else is stamped now.
    pub fn add(&mut self, path: &str, doc_id: Option<DocId>) -> Result<DocId> {
        let existing = self.entry(path);
        let id = doc_id.unwrap_or_else(new_doc_id);
        let created = match &existing {
            Some(e) if e.doc_id == id => e.created,
            _ => now_ms(),
        };

        let obj = self.doc.put_object(automerge::ROOT, path, ObjType::Map)?;
        self.doc.put(&obj, "docId", id.as_str())?;
        self.doc.put(&obj, "created", created)?;
        self.doc.put(&obj, "deleted", false)?;
        Ok(id)
    }

    /// Tombstone `path`. The entry (and its doc id) is retained.
    pub fn remove(&mut self, path: &str) -> Result<()> {
        let obj = self
            .entry_obj(path)
            .ok_or_else(|| StashError::NotFound(format!("no entry for '{path}'")))?;
        self.doc.put(&obj, "deleted", true)?;
        Ok(())
    }

    /// Move an active entry from `from` to `to`, preserving doc id and
    /// creation time.
    ///
    /// The `from` key is physically removed rather than tombstoned: a move is
    /// local-only at this layer, and the surviving entry at `to` carries the
    /// causal history through its unchanged doc id.
    pub fn move_entry(&mut self, from: &str, to: &str) -> Result<()> {
        let entry = self
            .entry(from)
            .filter(|e| !e.deleted)
            .ok_or_else(|| StashError::NotFound(format!("no active entry for '{from}'")))?;

        self.doc.delete(automerge::ROOT, from)?;
        let obj = self.doc.put_object(automerge::ROOT, to, ObjType::Map)?;
        self.doc.put(&obj, "docId", entry.doc_id.as_str())?;
        self.doc.put(&obj, "created", entry.created)?;
        self.doc.put(&obj, "deleted", false)?;
        Ok(())
    }

    /// Whether `path` exists and carries a tombstone.
    pub fn is_deleted(&self, path: &str) -> bool {
        self.entry(path).is_some_and(|e| e.deleted)
    }

    /// Look up the entry for `path`, tombstoned or not.
    pub fn entry(&self, path: &str) -> Option<StructureEntry> {
        let obj = self.entry_obj(path)?;
        let doc_id = self.get_str(&obj, "docId")?;
        let created = self.get_i64(&obj, "created").unwrap_or(0);
        let deleted = self.get_bool(&obj, "deleted").unwrap_or(false);
        Some(StructureEntry {
            doc_id,
            created,
            deleted,
        })
    }

    /// Sorted list of non-tombstoned paths.
    pub fn list_active(&self) -> Vec<String> {
        self.list_all()
            .into_iter()
            .filter(|(_, e)| !e.deleted)
            .map(|(p, _)| p)
            .collect()
    }

    /// Sorted list of tombstoned paths.
    pub fn list_deleted(&self) -> Vec<String> {
        self.list_all()
            .into_iter()
            .filter(|(_, e)| e.deleted)
            .map(|(p, _)| p)
            .collect()
    }

    /// Every entry, tombstoned included, sorted by path.
    pub fn list_all(&self) -> Vec<(String, StructureEntry)> {
        let mut out: Vec<(String, StructureEntry)> = self
            .doc
            .keys(automerge::ROOT)
            .filter_map(|path| self.entry(&path).map(|e| (path, e)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Every doc id referenced by any entry, tombstoned included.
    pub fn referenced_doc_ids(&self) -> Vec<DocId> {
        let mut ids: Vec<DocId> = self.list_all().into_iter().map(|(_, e)| e.doc_id).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// True when no entry (tombstoned or not) has ever been tracked.
    pub fn is_empty(&self) -> bool {
        self.doc.keys(automerge::ROOT).next().is_none()
    }

    /// Current heads of the document.
    ///
    /// `&mut` because automerge commits any pending transaction first.
    pub fn heads(&mut self) -> Vec<automerge::ChangeHash> {
        self.doc.get_heads()
    }

    /// Current heads as lowercase hex, in order.
    pub fn heads_hex(&mut self) -> Vec<String> {
        self.doc.get_heads().iter().map(|h| hex::encode(h.0)).collect()
    }

    /// Full binary save of the document.
    pub fn save(&mut self) -> Vec<u8> {
        self.doc.save()
    }

    /// Merge another replica's structure document into this one.
    pub fn merge(&mut self, other: &mut StructureDoc) -> Result<()> {
        self.doc.merge(&mut other.doc)?;
        Ok(())
    }

    fn entry_obj(&self, path: &str) -> Option<ObjId> {
        match self.doc.get(automerge::ROOT, path) {
            Ok(Some((Value::Object(ObjType::Map), obj))) => Some(obj),
            _ => None,
        }
    }

    fn get_str(&self, obj: &ObjId, key: &str) -> Option<String> {
        match self.doc.get(obj, key) {
            Ok(Some((value, _))) => value.to_str().map(|s| s.to_string()),
            _ => None,
        }
    }

    fn get_i64(&self, obj: &ObjId, key: &str) -> Option<i64> {
        match self.doc.get(obj, key) {
            Ok(Some((Value::Scalar(s), _))) => match s.as_ref() {
                ScalarValue::Int(i) => Some(*i),
                ScalarValue::Uint(u) => Some(*u as i64),
                ScalarValue::Timestamp(t) => Some(*t),
                _ => None,
            },
            _ => None,
        }
    }

    fn get_bool(&self, obj: &ObjId, key: &str) -> Option<bool> {
        match self.doc.get(obj, key) {
            Ok(Some((Value::Scalar(s), _))) => match s.as_ref() {
                ScalarValue::Boolean(b) => Some(*b),
                _ => None,
            },
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use automerge::ActorId;

    fn doc() -> StructureDoc {
        StructureDoc::new(ActorId::random())
    }

    #[test]
    fn test_add_and_list() {
        let mut s = doc();
        s.add("readme.md", None).unwrap();
        s.add("src/index.ts", None).unwrap();
        assert_eq!(s.list_active(), vec!["readme.md", "src/index.ts"]);
    }

    #[test]
    fn test_remove_keeps_tombstone() {
        let mut s = doc();
        let id = s.add("file.md", None).unwrap();
        s.remove("file.md").unwrap();

        assert!(s.is_deleted("file.md"));
        assert!(s.list_active().is_empty());
        assert_eq!(s.list_deleted(), vec!["file.md"]);
        // Doc id survives the tombstone.
        assert_eq!(s.entry("file.md").unwrap().doc_id, id);
    }

    #[test]
    fn test_resurrection_allocates_fresh_doc_id() {
        let mut s = doc();
        let first = s.add("file.md", None).unwrap();
        s.remove("file.md").unwrap();
        let second = s.add("file.md", None).unwrap();

        assert_ne!(first, second);
        assert!(!s.is_deleted("file.md"));
    }

    #[test]
    fn test_move_preserves_doc_id_and_created() {
        let mut s = doc();
        let id = s.add("old.md", None).unwrap();
        let created = s.entry("old.md").unwrap().created;

        s.move_entry("old.md", "sub/new.md").unwrap();

        assert!(s.entry("old.md").is_none());
        let moved = s.entry("sub/new.md").unwrap();
        assert_eq!(moved.doc_id, id);
        assert_eq!(moved.created, created);
    }

    #[test]
    fn test_move_missing_fails() {
        let mut s = doc();
        assert!(matches!(
            s.move_entry("nope.md", "new.md"),
            Err(StashError::NotFound(_))
        ));
    }

    #[test]
    fn test_merge_converges() {
        let mut a = doc();
        a.add("shared.md", None).unwrap();
        let bytes = a.save();

        let mut b = StructureDoc::load(&bytes, ActorId::random()).unwrap();
        a.add("from-a.md", None).unwrap();
        b.add("from-b.md", None).unwrap();

        let mut b_for_a = StructureDoc::load(&b.save(), ActorId::random()).unwrap();
        a.merge(&mut b_for_a).unwrap();
        let mut a_for_b = StructureDoc::load(&a.save(), ActorId::random()).unwrap();
        b.merge(&mut a_for_b).unwrap();

        assert_eq!(a.list_active(), b.list_active());
        assert_eq!(a.list_active(), vec!["from-a.md", "from-b.md", "shared.md"]);
    }

    #[test]
    fn test_restore_with_same_doc_id_keeps_created() {
        let mut s = doc();
        let id = s.add("file.md", None).unwrap();
        let created = s.entry("file.md").unwrap().created;
        s.remove("file.md").unwrap();

        s.add("file.md", Some(id.clone())).unwrap();
        let e = s.entry("file.md").unwrap();
        assert_eq!(e.doc_id, id);
        assert_eq!(e.created, created);
        assert!(!e.deleted);
    }
}
