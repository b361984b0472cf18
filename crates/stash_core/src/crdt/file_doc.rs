//! Per-file documents: a character-level text CRDT or a binary metadata
//! record.
//!
//! Text documents hold their content in an automerge text object and merge
//! concurrent edits character by character. Binary files are deliberately not
//! CRDTs: the document records `{hash, size}` and the bytes live in the blob
//! store, so "merging" a binary file is just the structure document's
//! tie-break over which hash wins.
//!
//! All text indices are Unicode scalar values (code points), the addressing
//! unit of automerge's `splice_text`. Patches and diffs use the same unit.

use automerge::transaction::Transactable;
use automerge::{ActorId, AutoCommit, ObjId, ObjType, ReadDoc, ScalarValue, Value};

use crate::error::{Result, StashError};

const CONTENT_KEY: &str = "content";
const HASH_KEY: &str = "hash";
const SIZE_KEY: &str = "size";
const BINARY_KEY: &str = "binary";

/// Variant tag of a [`FileDoc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileDocKind {
    /// Character-level collaborative text.
    Text,
    /// Immutable `{hash, size}` record referencing the blob store.
    Binary,
}

/// CRDT document for a single tracked file.
pub struct FileDoc {
    doc: AutoCommit,
    kind: FileDocKind,
}

impl FileDoc {
    /// Create a text document seeded with `content`.
    pub fn new_text(content: &str, actor: ActorId) -> Result<Self> {
        let mut doc = AutoCommit::new().with_actor(actor);
        let text = doc.put_object(automerge::ROOT, CONTENT_KEY, ObjType::Text)?;
        if !content.is_empty() {
            doc.splice_text(&text, 0, 0, content)?;
        }
        Ok(Self {
            doc,
            kind: FileDocKind::Text,
        })
    }

    /// Create a binary document for a blob already in the store.
    pub fn new_binary(hash: &str, size: u64, actor: ActorId) -> Result<Self> {
        let mut doc = AutoCommit::new().with_actor(actor);
        doc.put(automerge::ROOT, BINARY_KEY, true)?;
        doc.put(automerge::ROOT, HASH_KEY, hash)?;
        doc.put(automerge::ROOT, SIZE_KEY, size as i64)?;
        Ok(Self {
            doc,
            kind: FileDocKind::Binary,
        })
    }

    /// Load a document from an automerge binary save, detecting its variant.
    pub fn load(bytes: &[u8]) -> Result<Self> {
        let doc = AutoCommit::load(bytes)?;
        let kind = match doc.get(automerge::ROOT, CONTENT_KEY) {
            Ok(Some((Value::Object(ObjType::Text), _))) => FileDocKind::Text,
            _ => FileDocKind::Binary,
        };
        Ok(Self { doc, kind })
    }

    /// Load a document and bind it to `actor` for subsequent edits.
    pub fn load_with_actor(bytes: &[u8], actor: ActorId) -> Result<Self> {
        let loaded = Self::load(bytes)?;
        Ok(Self {
            doc: loaded.doc.with_actor(actor),
            kind: loaded.kind,
        })
    }

    /// Variant tag.
    pub fn kind(&self) -> FileDocKind {
        self.kind
    }

    /// Whether this is a text document.
    pub fn is_text(&self) -> bool {
        self.kind == FileDocKind::Text
    }

    /// Whether this is a binary metadata record.
    pub fn is_binary(&self) -> bool {
        self.kind == FileDocKind::Binary
    }

    /// Current text content. Fails on a binary document.
    pub fn content(&self) -> Result<String> {
        let obj = self.text_obj()?;
        Ok(self.doc.text(&obj)?)
    }

    /// Replace the whole content using a minimal diff.
    ///
    /// Splicing only the changed span (rather than delete-all + insert-all)
    /// keeps unchanged characters' operation ids stable so concurrent edits
    /// still merge cleanly.
    pub fn set_content(&mut self, new_content: &str) -> Result<()> {
        let obj = self.text_obj()?;
        let current = self.doc.text(&obj)?;
        if current == new_content {
            return Ok(());
        }

        let current_chars: Vec<char> = current.chars().collect();
        let new_chars: Vec<char> = new_content.chars().collect();

        let common_prefix = current_chars
            .iter()
            .zip(new_chars.iter())
            .take_while(|(a, b)| a == b)
            .count();

        let remaining_current = current_chars.len() - common_prefix;
        let remaining_new = new_chars.len() - common_prefix;
        let common_suffix = current_chars[common_prefix..]
            .iter()
            .rev()
            .zip(new_chars[common_prefix..].iter().rev())
            .take_while(|(a, b)| a == b)
            .take(remaining_current.min(remaining_new))
            .count();

        let delete_count = current_chars.len() - common_suffix - common_prefix;
        let insert_text: String = new_chars[common_prefix..new_chars.len() - common_suffix]
            .iter()
            .collect();

        self.doc
            .splice_text(&obj, common_prefix, delete_count as isize, &insert_text)?;
        Ok(())
    }

    /// Delete the code points in `start..end` and insert `text` at `start`.
    ///
    /// Out-of-range indices fail with a validation error.
    pub fn apply_patch(&mut self, start: usize, end: usize, text: &str) -> Result<()> {
        let obj = self.text_obj()?;
        let len = self.doc.length(&obj);
        if start > end || end > len {
            return Err(StashError::Validation(format!(
                "patch range {start}..{end} out of bounds for length {len}"
            )));
        }
        self.doc
            .splice_text(&obj, start, (end - start) as isize, text)?;
        Ok(())
    }

    /// SHA-256 hash recorded by a binary document.
    pub fn binary_hash(&self) -> Option<String> {
        if self.is_text() {
            return None;
        }
        match self.doc.get(automerge::ROOT, HASH_KEY) {
            Ok(Some((value, _))) => value.to_str().map(|s| s.to_string()),
            _ => None,
        }
    }

    /// Byte size recorded by a binary document.
    pub fn binary_size(&self) -> Option<u64> {
        if self.is_text() {
            return None;
        }
        match self.doc.get(automerge::ROOT, SIZE_KEY) {
            Ok(Some((Value::Scalar(s), _))) => match s.as_ref() {
                ScalarValue::Int(i) => Some(*i as u64),
                ScalarValue::Uint(u) => Some(*u),
                _ => None,
            },
            _ => None,
        }
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

    /// Change-detection fingerprint: joined heads for text, the hash for
    /// binary.
    pub fn fingerprint(&mut self) -> String {
        match self.kind {
            FileDocKind::Text => self.heads_hex().join(","),
            FileDocKind::Binary => self.binary_hash().unwrap_or_default(),
        }
    }

    /// Full binary save of the document.
    pub fn save(&mut self) -> Vec<u8> {
        self.doc.save()
    }

    /// Merge another replica of the same document into this one.
    pub fn merge(&mut self, other: &mut FileDoc) -> Result<()> {
        self.doc.merge(&mut other.doc)?;
        Ok(())
    }

    /// Fork this document into an independent branch with its own actor.
    ///
    /// Used by the reconciler to hold the "last seen on disk" state so a disk
    /// edit can be replayed as a branch and three-way merged.
    pub fn fork(&mut self) -> FileDoc {
        FileDoc {
            doc: self.doc.fork(),
            kind: self.kind,
        }
    }

    fn text_obj(&self) -> Result<ObjId> {
        if self.is_binary() {
            return Err(StashError::Validation(
                "not a text document".to_string(),
            ));
        }
        match self.doc.get(automerge::ROOT, CONTENT_KEY) {
            Ok(Some((Value::Object(ObjType::Text), obj))) => Ok(obj),
            _ => Err(StashError::CorruptState(
                "text document has no content object".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use automerge::ActorId;

    #[test]
    fn test_text_roundtrip() {
        let mut doc = FileDoc::new_text("hello world", ActorId::random()).unwrap();
        assert!(doc.is_text());
        assert_eq!(doc.content().unwrap(), "hello world");

        let reloaded = FileDoc::load(&doc.save()).unwrap();
        assert!(reloaded.is_text());
        assert_eq!(reloaded.content().unwrap(), "hello world");
    }

    #[test]
    fn test_binary_metadata() {
        let hash = "ab".repeat(32);
        let mut doc = FileDoc::new_binary(&hash, 1024, ActorId::random()).unwrap();
        assert!(doc.is_binary());
        assert_eq!(doc.binary_hash().unwrap(), hash);
        assert_eq!(doc.binary_size().unwrap(), 1024);
        assert!(doc.content().is_err());

        let mut reloaded = FileDoc::load(&doc.save()).unwrap();
        assert!(reloaded.is_binary());
        assert_eq!(reloaded.fingerprint(), hash);
    }

    #[test]
    fn test_patch_code_point_indices() {
        let mut doc = FileDoc::new_text("héllo", ActorId::random()).unwrap();
        // Indices count scalar values: 'é' is one unit.
        doc.apply_patch(1, 2, "e").unwrap();
        assert_eq!(doc.content().unwrap(), "hello");
    }

    #[test]
    fn test_patch_out_of_range_fails() {
        let mut doc = FileDoc::new_text("abc", ActorId::random()).unwrap();
        assert!(matches!(
            doc.apply_patch(2, 9, "x"),
            Err(StashError::Validation(_))
        ));
        assert!(matches!(
            doc.apply_patch(3, 2, "x"),
            Err(StashError::Validation(_))
        ));
    }

    #[test]
    fn test_concurrent_edits_merge() {
        let mut a = FileDoc::new_text("shared base text", ActorId::random()).unwrap();
        let bytes = a.save();
        let mut b = FileDoc::load_with_actor(&bytes, ActorId::random()).unwrap();

        a.apply_patch(0, 6, "common").unwrap();
        b.apply_patch(12, 16, "line").unwrap();

        let mut b_copy = FileDoc::load(&b.save()).unwrap();
        a.merge(&mut b_copy).unwrap();
        let mut a_copy = FileDoc::load(&a.save()).unwrap();
        b.merge(&mut a_copy).unwrap();

        assert_eq!(a.content().unwrap(), b.content().unwrap());
        assert_eq!(a.content().unwrap(), "common base line");
    }

    #[test]
    fn test_set_content_minimal_diff_preserves_merge() {
        let mut a = FileDoc::new_text("one two three", ActorId::random()).unwrap();
        let mut b = FileDoc::load_with_actor(&a.save(), ActorId::random()).unwrap();

        a.set_content("one 2 three").unwrap();
        b.set_content("one two three four").unwrap();

        let mut b_copy = FileDoc::load(&b.save()).unwrap();
        a.merge(&mut b_copy).unwrap();
        assert_eq!(a.content().unwrap(), "one 2 three four");
    }
}
