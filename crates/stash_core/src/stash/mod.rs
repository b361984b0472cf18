//! The stash: one synchronized folder and its CRDT twin.
//!
//! A stash owns the structure document, one file document per tracked path,
//! the blob store, the known-paths side-index, and the sync snapshot. All
//! state is mutated through this API; the reconciler and sync controller
//! hold it behind a [`SharedStash`](crate::stash::handle::SharedStash) and
//! take turns on its task queue.

mod handle;
mod known_paths;
mod meta;

pub use handle::SharedStash;
pub use known_paths::KnownPaths;
pub use meta::{validate_name, RemoteCoordinate, StashMeta};

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use automerge::ActorId;

use crate::blob::BlobStore;
use crate::crdt::{parse_actor_id, DocId, FileDoc, StructureDoc, SyncSnapshot};
use crate::error::{Result, StashError};
use crate::fsutil::{atomic_write, ensure_dir, stash_dir};
use crate::remote::RemoteTransport;

const META_FILE: &str = "meta.json";
const STRUCTURE_FILE: &str = "structure.automerge";
const DOCS_DIR: &str = "docs";
const BLOBS_DIR: &str = "blobs";
const KNOWN_PATHS_FILE: &str = "known-paths.json";
const SYNC_STATE_FILE: &str = "sync-state.json";

/// Persisted shape of `sync-state.json`. Provider-opaque fields are carried
/// through rewrites untouched.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SyncStateFile {
    last_pushed_snapshot: Option<SyncSnapshot>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

/// An entry returned by [`Stash::list_dir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Name of the file or directory, relative to the listed directory.
    pub name: String,
    /// Whether this entry is a directory.
    pub is_dir: bool,
}

/// One synchronized folder: working tree plus CRDT documents plus blob store.
pub struct Stash {
    name: String,
    root: PathBuf,
    actor_hex: String,
    actor: ActorId,
    meta: StashMeta,
    structure: StructureDoc,
    docs: HashMap<DocId, FileDoc>,
    blobs: BlobStore,
    known: KnownPaths,
    last_pushed: Option<SyncSnapshot>,
    sync_state_extra: serde_json::Map<String, serde_json::Value>,
    provider: Option<Arc<dyn RemoteTransport>>,
}

impl Stash {
    /// Create a new stash rooted at `root`, writing `.stash/` immediately.
    pub fn create(
        name: &str,
        root: &Path,
        actor_hex: &str,
        provider: Option<Arc<dyn RemoteTransport>>,
        remote: Option<String>,
        description: Option<String>,
    ) -> Result<Self> {
        validate_name(name)?;
        let actor = parse_actor_id(actor_hex)?;
        ensure_dir(root)?;
        let dir = stash_dir(root);
        if dir.join(META_FILE).exists() {
            return Err(StashError::AlreadyExists(format!(
                "stash already initialized at {}",
                root.display()
            )));
        }
        ensure_dir(&dir)?;

        let blobs = BlobStore::open(dir.join(BLOBS_DIR))?;
        let mut stash = Self {
            name: name.to_string(),
            root: root.to_path_buf(),
            actor_hex: actor_hex.to_string(),
            actor: actor.clone(),
            meta: StashMeta {
                name: name.to_string(),
                description,
                remote,
            },
            structure: StructureDoc::new(actor),
            docs: HashMap::new(),
            blobs,
            known: KnownPaths::default(),
            last_pushed: None,
            sync_state_extra: serde_json::Map::new(),
            provider,
        };
        stash.save()?;
        Ok(stash)
    }

    /// Load an existing stash from `root/.stash/`.
    pub fn load(
        name: &str,
        root: &Path,
        actor_hex: &str,
        provider: Option<Arc<dyn RemoteTransport>>,
    ) -> Result<Self> {
        validate_name(name)?;
        let actor = parse_actor_id(actor_hex)?;
        let dir = stash_dir(root);

        let meta_bytes = fs::read(dir.join(META_FILE)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StashError::NotFound(format!("no stash at {}", root.display()))
            } else {
                e.into()
            }
        })?;
        let meta: StashMeta = serde_json::from_slice(&meta_bytes)?;

        let structure = match fs::read(dir.join(STRUCTURE_FILE)) {
            Ok(bytes) => StructureDoc::load(&bytes, actor.clone())?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                StructureDoc::new(actor.clone())
            }
            Err(e) => return Err(e.into()),
        };

        let mut docs = HashMap::new();
        let docs_dir = dir.join(DOCS_DIR);
        if docs_dir.is_dir() {
            for entry in fs::read_dir(&docs_dir)? {
                let entry = entry?;
                let file_name = entry.file_name().to_string_lossy().into_owned();
                let Some(doc_id) = file_name.strip_suffix(".automerge") else {
                    continue;
                };
                match fs::read(entry.path())
                    .map_err(StashError::Io)
                    .and_then(|bytes| FileDoc::load_with_actor(&bytes, actor.clone()))
                {
                    Ok(doc) => {
                        docs.insert(doc_id.to_string(), doc);
                    }
                    Err(e) => {
                        log::warn!("skipping unreadable file doc {doc_id}: {e}");
                    }
                }
            }
        }

        let known = KnownPaths::load(&dir.join(KNOWN_PATHS_FILE))?;

        let (last_pushed, sync_state_extra) = match fs::read(dir.join(SYNC_STATE_FILE)) {
            Ok(bytes) => {
                let state: SyncStateFile = serde_json::from_slice(&bytes)?;
                (state.last_pushed_snapshot, state.extra)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                (None, serde_json::Map::new())
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            name: name.to_string(),
            root: root.to_path_buf(),
            actor_hex: actor_hex.to_string(),
            actor,
            meta,
            structure,
            docs,
            blobs: BlobStore::open(dir.join(BLOBS_DIR))?,
            known,
            last_pushed,
            sync_state_extra,
            provider,
        })
    }

    /// Persist every artifact atomically.
    pub fn save(&mut self) -> Result<()> {
        let dir = stash_dir(&self.root);
        ensure_dir(&dir)?;

        atomic_write(&dir.join(META_FILE), &serde_json::to_vec_pretty(&self.meta)?)?;
        let structure_bytes = self.structure.save();
        atomic_write(&dir.join(STRUCTURE_FILE), &structure_bytes)?;

        let docs_dir = dir.join(DOCS_DIR);
        ensure_dir(&docs_dir)?;
        for (doc_id, doc) in &mut self.docs {
            atomic_write(&docs_dir.join(format!("{doc_id}.automerge")), &doc.save())?;
        }
        // Drop saved docs that no longer exist in memory (GC'd after merge).
        for entry in fs::read_dir(&docs_dir)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if let Some(doc_id) = file_name.strip_suffix(".automerge")
                && !self.docs.contains_key(doc_id)
            {
                let _ = fs::remove_file(entry.path());
            }
        }

        self.known.save(&dir.join(KNOWN_PATHS_FILE))?;

        let state = SyncStateFile {
            last_pushed_snapshot: self.last_pushed.clone(),
            extra: self.sync_state_extra.clone(),
        };
        atomic_write(&dir.join(SYNC_STATE_FILE), &serde_json::to_vec_pretty(&state)?)?;
        Ok(())
    }

    // ==================== Reads ====================

    /// Text content of an active tracked file.
    pub fn read(&self, path: &str) -> Result<String> {
        let doc = self.active_doc(path)?;
        doc.content()
    }

    /// Bytes of an active tracked binary file, from the blob store.
    pub fn read_binary(&self, path: &str) -> Result<Vec<u8>> {
        let doc = self.active_doc(path)?;
        let hash = doc
            .binary_hash()
            .ok_or_else(|| StashError::Validation(format!("'{path}' is not a binary file")))?;
        self.blobs.read(&hash)
    }

    /// Whether `path` is tombstoned.
    pub fn is_deleted(&self, path: &str) -> bool {
        self.structure.is_deleted(path)
    }

    /// Sorted list of active paths.
    pub fn list_files(&self) -> Vec<String> {
        self.structure.list_active()
    }

    /// Doc id of an entry, tombstoned or not.
    pub fn doc_id_of(&self, path: &str) -> Option<DocId> {
        self.structure.entry(path).map(|e| e.doc_id)
    }

    /// Borrow a file document by doc id.
    pub fn file_doc(&self, doc_id: &str) -> Option<&FileDoc> {
        self.docs.get(doc_id)
    }

    /// Mutably borrow a file document by doc id.
    pub fn file_doc_mut(&mut self, doc_id: &str) -> Option<&mut FileDoc> {
        self.docs.get_mut(doc_id)
    }

    /// Immediate children of `dir` (or of the root when `None`) among active
    /// paths.
    pub fn list_dir(&self, dir: Option<&str>) -> Vec<DirEntry> {
        let prefix = match dir {
            Some(d) if !d.is_empty() => format!("{}/", d.trim_end_matches('/')),
            _ => String::new(),
        };
        let mut entries: Vec<DirEntry> = Vec::new();
        for path in self.structure.list_active() {
            let Some(rest) = path.strip_prefix(&prefix) else {
                continue;
            };
            match rest.split_once('/') {
                Some((child_dir, _)) => {
                    let entry = DirEntry {
                        name: child_dir.to_string(),
                        is_dir: true,
                    };
                    if !entries.contains(&entry) {
                        entries.push(entry);
                    }
                }
                None if !rest.is_empty() => entries.push(DirEntry {
                    name: rest.to_string(),
                    is_dir: false,
                }),
                None => {}
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    /// Active paths matching a glob pattern.
    pub fn glob(&self, pattern: &str) -> Result<Vec<String>> {
        let pattern = glob::Pattern::new(pattern)
            .map_err(|e| StashError::Validation(format!("bad glob pattern: {e}")))?;
        Ok(self
            .structure
            .list_active()
            .into_iter()
            .filter(|p| pattern.matches(p))
            .collect())
    }

    // ==================== Writes ====================

    /// Write text content to `path`, creating or resurrecting the entry as
    /// needed.
    pub fn write(&mut self, path: &str, content: &str) -> Result<()> {
        match self.structure.entry(path) {
            Some(entry) if !entry.deleted => {
                let is_text = self
                    .docs
                    .get(&entry.doc_id)
                    .map(|doc| doc.is_text())
                    .unwrap_or(false);
                if is_text {
                    if let Some(doc) = self.docs.get_mut(&entry.doc_id) {
                        doc.set_content(content)?;
                    }
                } else {
                    // Type change or dangling reference: replace with a
                    // fresh text variant under the same doc id.
                    let doc = FileDoc::new_text(content, self.actor.clone())?;
                    self.docs.insert(entry.doc_id, doc);
                }
            }
            _ => {
                let doc_id = self.structure.add(path, None)?;
                let doc = FileDoc::new_text(content, self.actor.clone())?;
                self.docs.insert(doc_id, doc);
            }
        }
        self.known.insert(path);
        Ok(())
    }

    /// Record a binary file whose payload is already in the blob store.
    pub fn write_binary(&mut self, path: &str, hash: &str, size: u64) -> Result<()> {
        let doc = FileDoc::new_binary(hash, size, self.actor.clone())?;
        match self.structure.entry(path) {
            Some(entry) if !entry.deleted => {
                self.docs.insert(entry.doc_id, doc);
            }
            _ => {
                let doc_id = self.structure.add(path, None)?;
                self.docs.insert(doc_id, doc);
            }
        }
        self.known.insert(path);
        Ok(())
    }

    /// Store `bytes` in the blob store and record them at `path`.
    pub fn write_binary_bytes(&mut self, path: &str, bytes: &[u8]) -> Result<String> {
        let hash = self.blobs.write(bytes)?;
        self.write_binary(path, &hash, bytes.len() as u64)?;
        Ok(hash)
    }

    /// Apply a text patch (code-point indices) to an active tracked file.
    pub fn patch(&mut self, path: &str, start: usize, end: usize, text: &str) -> Result<()> {
        let entry = self
            .structure
            .entry(path)
            .filter(|e| !e.deleted)
            .ok_or_else(|| StashError::NotFound(format!("no active file at '{path}'")))?;
        let doc = self
            .docs
            .get_mut(&entry.doc_id)
            .ok_or_else(|| StashError::CorruptState(format!("missing doc for '{path}'")))?;
        doc.apply_patch(start, end, text)?;
        self.known.insert(path);
        Ok(())
    }

    /// Tombstone `path`. The file document is retained until it becomes
    /// unreferenced.
    pub fn delete(&mut self, path: &str) -> Result<()> {
        if self.structure.entry(path).filter(|e| !e.deleted).is_none() {
            return Err(StashError::NotFound(format!("no active file at '{path}'")));
        }
        self.structure.remove(path)
    }

    /// Move an active entry, preserving its doc id.
    pub fn move_file(&mut self, from: &str, to: &str) -> Result<()> {
        self.structure.move_entry(from, to)?;
        self.known.insert(to);
        Ok(())
    }

    /// Replace the file document bound to `path` (reconciler-managed merges).
    pub fn set_file_doc(&mut self, path: &str, doc: FileDoc) -> Result<()> {
        let entry = self
            .structure
            .entry(path)
            .ok_or_else(|| StashError::NotFound(format!("no entry for '{path}'")))?;
        self.docs.insert(entry.doc_id, doc);
        Ok(())
    }

    /// Track a path with a specific doc id (sync-controller restores).
    pub fn restore_entry(&mut self, path: &str, doc_id: DocId) -> Result<()> {
        self.structure.add(path, Some(doc_id))?;
        Ok(())
    }

    // ==================== Known paths ====================

    /// Whether this replica has observed `path` before.
    pub fn is_known_path(&self, path: &str) -> bool {
        self.known.contains(path)
    }

    /// Record that this replica observed `path`.
    pub fn add_known_path(&mut self, path: &str) {
        self.known.insert(path);
    }

    /// Forget `path` (honored delete only).
    pub fn remove_known_path(&mut self, path: &str) {
        self.known.remove(path);
    }

    /// Forget every known path.
    pub fn clear_known_paths(&mut self) {
        self.known.clear();
    }

    // ==================== Sync support ====================

    /// Compute the current sync snapshot.
    pub fn current_snapshot(&mut self) -> SyncSnapshot {
        let mut snapshot = SyncSnapshot {
            structure: self.structure.heads_hex(),
            ..Default::default()
        };
        for (doc_id, doc) in &mut self.docs {
            snapshot.docs.insert(doc_id.clone(), doc.heads_hex());
        }
        for (path, entry) in self.structure.list_all() {
            if entry.deleted {
                continue;
            }
            if let Some(doc) = self.docs.get_mut(&entry.doc_id) {
                snapshot.files.insert(path, doc.fingerprint());
            }
        }
        snapshot
    }

    /// Snapshot of the last successful push, if any.
    pub fn last_pushed_snapshot(&self) -> Option<&SyncSnapshot> {
        self.last_pushed.as_ref()
    }

    /// Record a successful push. Callers must `save()` afterwards so a crash
    /// never falsely marks work as pushed.
    pub fn set_last_pushed_snapshot(&mut self, snapshot: SyncSnapshot) {
        self.last_pushed = Some(snapshot);
    }

    /// Create empty text documents for structure entries whose file document
    /// is missing. Returns the repaired paths.
    pub fn repair_dangling_docs(&mut self) -> Result<Vec<String>> {
        let mut repaired = Vec::new();
        for (path, entry) in self.structure.list_all() {
            if entry.deleted || self.docs.contains_key(&entry.doc_id) {
                continue;
            }
            log::warn!("repairing dangling doc reference for '{path}'");
            let doc = FileDoc::new_text("", self.actor.clone())?;
            self.docs.insert(entry.doc_id.clone(), doc);
            repaired.push(path);
        }
        Ok(repaired)
    }

    /// Hashes still referenced by a binary doc bound to a non-tombstoned
    /// entry. A hash referenced only by tombstoned entries is collectable.
    pub fn referenced_blob_hashes(&self) -> Vec<String> {
        let mut hashes: Vec<String> = self
            .structure
            .list_all()
            .iter()
            .filter(|(_, entry)| !entry.deleted)
            .filter_map(|(_, entry)| self.docs.get(&entry.doc_id))
            .filter_map(|doc| doc.binary_hash())
            .collect();
        hashes.sort();
        hashes.dedup();
        hashes
    }

    /// Unlink blobs no longer referenced by any entry.
    pub fn collect_blob_garbage(&self) -> Result<usize> {
        let referenced = self.referenced_blob_hashes();
        self.blobs
            .collect_garbage(referenced.iter().map(|h| h.as_str()))
    }

    /// Drop file documents that no structure entry references any more.
    pub fn drop_unreferenced_docs(&mut self) {
        let referenced: std::collections::HashSet<DocId> =
            self.structure.referenced_doc_ids().into_iter().collect();
        self.docs.retain(|id, _| referenced.contains(id));
    }

    // ==================== Accessors ====================

    /// Stash name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Working-tree root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stash metadata.
    pub fn meta(&self) -> &StashMeta {
        &self.meta
    }

    /// The 64-hex actor identifier.
    pub fn actor_hex(&self) -> &str {
        &self.actor_hex
    }

    /// The automerge actor id used for every document.
    pub fn actor(&self) -> &ActorId {
        &self.actor
    }

    /// The blob store.
    pub fn blob_store(&self) -> &BlobStore {
        &self.blobs
    }

    /// The structure document.
    pub fn structure(&self) -> &StructureDoc {
        &self.structure
    }

    /// Mutable access to the structure document (sync controller only).
    pub fn structure_mut(&mut self) -> &mut StructureDoc {
        &mut self.structure
    }

    /// Replace the structure document wholesale (fresh join).
    pub fn replace_structure(&mut self, structure: StructureDoc) {
        self.structure = structure;
    }

    /// Replace the whole file-doc map (fresh join).
    pub fn replace_docs(&mut self, docs: HashMap<DocId, FileDoc>) {
        self.docs = docs;
    }

    /// Insert or replace a file document by doc id.
    pub fn insert_doc(&mut self, doc_id: DocId, doc: FileDoc) {
        self.docs.insert(doc_id, doc);
    }

    /// Doc ids currently held in memory.
    pub fn doc_ids(&self) -> Vec<DocId> {
        let mut ids: Vec<DocId> = self.docs.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The remote provider, if configured.
    pub fn provider(&self) -> Option<Arc<dyn RemoteTransport>> {
        self.provider.clone()
    }

    /// Install or replace the remote provider.
    pub fn set_provider(&mut self, provider: Option<Arc<dyn RemoteTransport>>) {
        self.provider = provider;
    }

    fn active_doc(&self, path: &str) -> Result<&FileDoc> {
        let entry = self
            .structure
            .entry(path)
            .filter(|e| !e.deleted)
            .ok_or_else(|| StashError::NotFound(format!("no active file at '{path}'")))?;
        self.docs
            .get(&entry.doc_id)
            .ok_or_else(|| StashError::CorruptState(format!("missing doc for '{path}'")))
    }
}

/// Generate a fresh 64-hex actor identifier from a site-local random seed.
pub fn generate_actor_id() -> String {
    crate::fsutil::sha256_hex(uuid::Uuid::new_v4().as_bytes())
}
