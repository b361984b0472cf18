//! Reconciler: the filesystem ↔ CRDT bridge.
//!
//! One reconciler watches one stash's working tree and keeps three views
//! coherent: the plain files on disk, the CRDT documents, and (through the
//! stash's sync scheduling) the remote.
//!
//! Disk-to-CRDT: watcher events are stabilized (200 ms quiescence, 50 ms
//! poll), then imported. An `unlink` is buffered for 500 ms as a *pending
//! delete*; an `add` arriving inside the window with the same content hash
//! and basename collapses the pair into a `move`, preserving the doc id.
//! Text changes are diffed against the last-known disk snapshot, replayed on
//! a fork of that snapshot, and three-way merged into the current document —
//! so a disk edit racing a sync merge loses neither side.
//!
//! CRDT-to-disk: [`Reconciler::flush`] renders active documents to disk
//! under a `writing` guard, honors remote deletes for paths this replica has
//! observed (known paths), resurrects tombstoned paths it never observed,
//! imports untracked files, and prunes emptied directories without ever
//! crossing the stash root.
//!
//! Handler failures are logged, never propagated: an error must not kill the
//! watcher.

mod diff;
mod watcher;

pub use diff::{diff, TextEdit};
pub use watcher::{TreeWatcher, WatchEvent};

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::crdt::{DocId, FileDoc};
use crate::error::{Result, StashError};
use crate::fsutil::{
    decode_text, has_hidden_component, remove_empty_parents, rel_to_key, sha256_hex, walk_tree,
};
use crate::settings::Settings;
use crate::stash::SharedStash;

/// Last state observed to be in sync with disk, kept for text files only.
struct DiskSnapshot {
    /// Fork of the file doc at the moment disk and CRDT agreed.
    doc: FileDoc,
    /// The text that was on disk at that moment.
    content: String,
}

/// A buffered `unlink`, waiting out the rename window.
struct PendingDelete {
    path: String,
    doc_id: DocId,
    deadline: Instant,
}

struct Inner {
    stash: SharedStash,
    root: PathBuf,
    settings: Settings,
    disk_snapshots: HashMap<String, DiskSnapshot>,
    /// Keyed by content hash, the rename-detection join key.
    pending_deletes: HashMap<String, PendingDelete>,
    /// Raised while the reconciler itself writes the working tree.
    writing: bool,
}

/// Bidirectional bridge between one stash and its working tree.
pub struct Reconciler {
    inner: Arc<Mutex<Inner>>,
    shutdown: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl Reconciler {
    /// Start watching the stash's working tree.
    pub async fn start(stash: SharedStash) -> Result<Self> {
        let root = { stash.lock().await.root().to_path_buf() };
        let settings = stash.settings();
        let mut tree_watcher = TreeWatcher::start(&root)?;

        let inner = Arc::new(Mutex::new(Inner {
            stash,
            root,
            settings,
            disk_snapshots: HashMap::new(),
            pending_deletes: HashMap::new(),
            writing: false,
        }));
        let shutdown = Arc::new(Notify::new());

        let loop_inner = Arc::clone(&inner);
        let loop_shutdown = Arc::clone(&shutdown);
        let task = tokio::spawn(async move {
            loop {
                let deadline = { loop_inner.lock().await.next_delete_deadline() };
                tokio::select! {
                    _ = loop_shutdown.notified() => break,
                    event = tree_watcher.recv() => {
                        match event {
                            Some(event) => {
                                let mut inner = loop_inner.lock().await;
                                inner.handle_event(event).await;
                            }
                            None => break,
                        }
                    }
                    _ = sleep_until_or_never(deadline) => {
                        let mut inner = loop_inner.lock().await;
                        inner.fire_due_deletes().await;
                    }
                }
            }
        });

        Ok(Self {
            inner,
            shutdown,
            task: Some(task),
        })
    }

    /// Disk-to-CRDT reconciliation: import untracked files, tombstone tracked
    /// paths that vanished from disk.
    pub async fn scan(&self) -> Result<()> {
        self.inner.lock().await.scan().await
    }

    /// CRDT-to-disk reconciliation: render active documents, dispatch
    /// orphans, prune empty directories, then replay any races.
    pub async fn flush(&self) -> Result<()> {
        let reroutes = {
            let mut inner = self.inner.lock().await;
            inner.writing = true;
            let result = inner.flush_to_disk().await;
            inner.writing = false;
            result?
        };

        // User edits observed during the flush window re-enter the normal
        // change path, outside the writing guard.
        let mut inner = self.inner.lock().await;
        for key in reroutes {
            inner.replay_change(&key).await;
        }
        inner.reconcile_races().await;
        Ok(())
    }

    /// Force any pending deletes to resolve now (test hook).
    pub async fn settle_pending_deletes(&self) {
        let mut inner = self.inner.lock().await;
        let due: Vec<String> = inner.pending_deletes.keys().cloned().collect();
        for hash in due {
            if let Some(pending) = inner.pending_deletes.remove(&hash) {
                inner.finalize_delete(pending).await;
            }
        }
    }

    /// Stop the watcher and the event loop.
    pub async fn close(mut self) {
        self.shutdown.notify_waiters();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Pending-delete timers park the select arm when nothing is queued.
async fn sleep_until_or_never(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Inner {
    fn next_delete_deadline(&self) -> Option<Instant> {
        self.pending_deletes.values().map(|p| p.deadline).min()
    }

    fn key_for(&self, abs: &Path) -> Option<String> {
        let rel = abs.strip_prefix(&self.root).ok()?;
        if rel.as_os_str().is_empty() || has_hidden_component(rel) {
            return None;
        }
        Some(rel_to_key(rel))
    }

    async fn handle_event(&mut self, event: WatchEvent) {
        if self.writing {
            return;
        }
        let Some(key) = self.key_for(event.path()) else {
            return;
        };

        match event {
            WatchEvent::Removed(_) => self.on_unlink(&key).await,
            WatchEvent::Added(abs) | WatchEvent::Changed(abs) => {
                if abs.is_dir() {
                    return;
                }
                let Some(bytes) = self.stabilize_and_read(&abs).await else {
                    // Vanished while stabilizing; the unlink event follows.
                    return;
                };
                let tracked = {
                    let handle = self.stash.clone();
                    let stash = handle.lock().await;
                    stash
                        .structure()
                        .entry(&key)
                        .is_some_and(|entry| !entry.deleted)
                };
                if tracked {
                    self.on_change(&key, bytes).await;
                } else {
                    self.on_add(&key, bytes).await;
                }
            }
        }
    }

    /// Wait for the file to be quiescent, then read it.
    async fn stabilize_and_read(&self, abs: &Path) -> Option<Vec<u8>> {
        let started = Instant::now();
        let mut last_meta: Option<(u64, std::time::SystemTime)> = None;
        let mut stable_since = Instant::now();

        loop {
            let meta = fs::metadata(abs).ok()?;
            let current = (meta.len(), meta.modified().ok()?);
            if last_meta == Some(current) {
                if stable_since.elapsed() >= self.settings.stabilize_quiet {
                    break;
                }
            } else {
                last_meta = Some(current);
                stable_since = Instant::now();
            }
            // Give up waiting for quiescence after 5 s and read what's there.
            if started.elapsed() > std::time::Duration::from_secs(5) {
                break;
            }
            tokio::time::sleep(self.settings.stabilize_poll).await;
        }

        fs::read(abs).ok()
    }

    async fn on_add(&mut self, key: &str, bytes: Vec<u8>) {
        let content_hash = sha256_hex(&bytes);

        // Rename detection: same content within the window, same basename.
        if let Some(pending) = self.pending_deletes.remove(&content_hash) {
            if basename(&pending.path) == basename(key) {
                let handle = self.stash.clone();
                let moved = {
                    let mut stash = handle.lock().await;
                    stash.move_file(&pending.path, key)
                };
                match moved {
                    Ok(()) => {
                        log::debug!("rename detected: '{}' -> '{key}'", pending.path);
                        if let Some(snapshot) = self.disk_snapshots.remove(&pending.path) {
                            self.disk_snapshots.insert(key.to_string(), snapshot);
                        }
                        handle.schedule_background_save();
                        handle.schedule_sync();
                        return;
                    }
                    Err(e) => {
                        log::warn!("rename of '{}' failed, importing '{key}' instead: {e}", pending.path);
                    }
                }
            } else {
                self.pending_deletes.insert(content_hash, pending);
            }
        }

        self.import(key, bytes).await;
    }

    /// Import a disk file as a new (or resurrected) tracked file.
    async fn import(&mut self, key: &str, bytes: Vec<u8>) {
        let handle = self.stash.clone();
        {
            let mut stash = handle.lock().await;
            let result = match decode_text(&bytes) {
                Some(text) => stash.write(key, &text).map(|()| {
                    if let Some(doc_id) = stash.doc_id_of(key)
                        && let Some(doc) = stash.file_doc_mut(&doc_id)
                    {
                        let fork = doc.fork();
                        self.disk_snapshots.insert(
                            key.to_string(),
                            DiskSnapshot {
                                doc: fork,
                                content: text,
                            },
                        );
                    }
                }),
                None => stash.write_binary_bytes(key, &bytes).map(|_| {
                    self.disk_snapshots.remove(key);
                }),
            };
            if let Err(e) = result {
                log::error!("import of '{key}' failed: {e}");
                return;
            }
        }
        handle.schedule_background_save();
        handle.schedule_sync();
    }

    async fn on_change(&mut self, key: &str, bytes: Vec<u8>) {
        let handle = self.stash.clone();
        let mut mutated = false;
        {
            let mut stash = handle.lock().await;
            let Some(doc_id) = stash.doc_id_of(key) else {
                drop(stash);
                self.on_add(key, bytes).await;
                return;
            };
            let doc_is_text = stash
                .file_doc(&doc_id)
                .map(|d| d.is_text())
                .unwrap_or(false);

            match (decode_text(&bytes), doc_is_text) {
                (Some(text), true) => {
                    match self.merge_text_change(&mut stash, key, &doc_id, &text) {
                        Ok(()) => mutated = true,
                        Err(e) => log::error!("merging disk edit of '{key}' failed: {e}"),
                    }
                }
                (Some(text), false) => {
                    // Binary became text: fresh text variant, same doc id.
                    match stash.write(key, &text) {
                        Ok(()) => {
                            self.refresh_snapshot(&mut stash, key, text);
                            mutated = true;
                        }
                        Err(e) => log::error!("type change of '{key}' failed: {e}"),
                    }
                }
                (None, _) => {
                    // Text became binary, or a binary payload changed.
                    let new_hash = sha256_hex(&bytes);
                    let unchanged = stash
                        .file_doc(&doc_id)
                        .and_then(|d| d.binary_hash())
                        .is_some_and(|h| h == new_hash);
                    if !unchanged {
                        match stash.write_binary_bytes(key, &bytes) {
                            Ok(_) => {
                                self.disk_snapshots.remove(key);
                                mutated = true;
                            }
                            Err(e) => log::error!("binary update of '{key}' failed: {e}"),
                        }
                    }
                }
            }
        }
        if mutated {
            handle.schedule_background_save();
            handle.schedule_sync();
        }
    }

    /// Three-way merge of a text edit observed on disk.
    ///
    /// The edit is replayed on a fork of the last disk snapshot, merged into
    /// the current document, and the merged text written back when it differs
    /// from what disk holds.
    fn merge_text_change(
        &mut self,
        stash: &mut crate::stash::Stash,
        key: &str,
        doc_id: &str,
        disk_text: &str,
    ) -> Result<()> {
        if !self.disk_snapshots.contains_key(key) {
            // No snapshot to diff against: adopt the disk content wholesale.
            stash.write(key, disk_text)?;
            self.refresh_snapshot(stash, key, disk_text.to_string());
            return Ok(());
        }

        if let Some(snapshot) = self.disk_snapshots.get_mut(key)
            && let Some(edit) = diff(&snapshot.content, disk_text)
        {
            let mut branch = snapshot.doc.fork();
            branch.apply_patch(edit.pos, edit.pos + edit.delete, &edit.insert)?;
            let doc = stash
                .file_doc_mut(doc_id)
                .ok_or_else(|| StashError::CorruptState(format!("missing doc for '{key}'")))?;
            doc.merge(&mut branch)?;
        }

        let merged = stash
            .file_doc(doc_id)
            .ok_or_else(|| StashError::CorruptState(format!("missing doc for '{key}'")))?
            .content()?;

        if merged != disk_text {
            // Disk lacks the merged result (concurrent CRDT-side edits).
            self.writing = true;
            let write_result = write_tree_file(&self.root, key, merged.as_bytes());
            self.writing = false;
            write_result?;
        }

        self.refresh_snapshot(stash, key, merged);
        stash.add_known_path(key);
        Ok(())
    }

    fn refresh_snapshot(&mut self, stash: &mut crate::stash::Stash, key: &str, content: String) {
        if let Some(doc_id) = stash.doc_id_of(key)
            && let Some(doc) = stash.file_doc_mut(&doc_id)
        {
            let fork = doc.fork();
            self.disk_snapshots.insert(
                key.to_string(),
                DiskSnapshot {
                    doc: fork,
                    content,
                },
            );
        }
    }

    async fn on_unlink(&mut self, key: &str) {
        let handle = self.stash.clone();
        let (content_hash, pending) = {
            let stash = handle.lock().await;
            let Some(entry) = stash.structure().entry(key).filter(|e| !e.deleted) else {
                return;
            };
            let Some(doc) = stash.file_doc(&entry.doc_id) else {
                return;
            };
            let content_hash = if doc.is_text() {
                match doc.content() {
                    Ok(content) => sha256_hex(content.as_bytes()),
                    Err(e) => {
                        log::error!("hashing '{key}' for pending delete failed: {e}");
                        return;
                    }
                }
            } else {
                doc.binary_hash().unwrap_or_default()
            };
            (
                content_hash,
                PendingDelete {
                    path: key.to_string(),
                    doc_id: entry.doc_id,
                    deadline: Instant::now() + self.settings.rename_window,
                },
            )
        };
        log::debug!("pending delete: '{key}' ({content_hash})");
        self.pending_deletes.insert(content_hash, pending);
    }

    async fn fire_due_deletes(&mut self) {
        let now = Instant::now();
        let due: Vec<String> = self
            .pending_deletes
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(hash, _)| hash.clone())
            .collect();
        for hash in due {
            if let Some(pending) = self.pending_deletes.remove(&hash) {
                self.finalize_delete(pending).await;
            }
        }
    }

    /// The rename window expired: the unlink was a real delete.
    async fn finalize_delete(&mut self, pending: PendingDelete) {
        log::debug!(
            "finalizing delete of '{}' (doc {})",
            pending.path,
            pending.doc_id
        );
        let handle = self.stash.clone();
        {
            let mut stash = handle.lock().await;
            match stash.delete(&pending.path) {
                Ok(()) | Err(StashError::NotFound(_)) => {}
                Err(e) => log::error!("tombstoning '{}' failed: {e}", pending.path),
            }
            if let Err(e) = stash.collect_blob_garbage() {
                log::warn!("blob gc after delete of '{}' failed: {e}", pending.path);
            }
        }
        self.disk_snapshots.remove(&pending.path);
        remove_empty_parents(&self.root.join(&pending.path), &self.root);
        handle.schedule_background_save();
        handle.schedule_sync();
    }

    /// Disk-to-CRDT pass: import untracked disk files, tombstone tracked
    /// paths missing from disk, seed snapshots for tracked text files.
    async fn scan(&mut self) -> Result<()> {
        let handle = self.stash.clone();
        let disk_keys = walk_tree(&self.root)?;
        let disk_set: std::collections::BTreeSet<&String> = disk_keys.iter().collect();
        let mut mutated = false;

        {
            let mut stash = handle.lock().await;

            for key in &disk_keys {
                if stash.structure().entry(key).is_some() {
                    continue;
                }
                let abs = self.root.join(key);
                let Ok(bytes) = fs::read(&abs) else { continue };
                let result = match decode_text(&bytes) {
                    Some(text) => {
                        let r = stash.write(key, &text);
                        if r.is_ok() {
                            self.refresh_snapshot(&mut stash, key, text);
                        }
                        r
                    }
                    None => stash.write_binary_bytes(key, &bytes).map(|_| ()),
                };
                match result {
                    Ok(()) => mutated = true,
                    Err(e) => log::error!("scan import of '{key}' failed: {e}"),
                }
            }

            for (path, entry) in stash.structure().list_all() {
                if entry.deleted || disk_set.contains(&path) {
                    continue;
                }
                match stash.delete(&path) {
                    Ok(()) => {
                        self.disk_snapshots.remove(&path);
                        mutated = true;
                    }
                    Err(e) => log::error!("scan tombstone of '{path}' failed: {e}"),
                }
            }

            // Seed snapshots for tracked text files so later disk edits can
            // be diffed even when the daemon just started.
            for path in stash.list_files() {
                if self.disk_snapshots.contains_key(&path) {
                    continue;
                }
                let Some(doc_id) = stash.doc_id_of(&path) else { continue };
                let is_text = stash.file_doc(&doc_id).map(|d| d.is_text()).unwrap_or(false);
                if !is_text {
                    continue;
                }
                let content = match stash.file_doc(&doc_id).map(|d| d.content()) {
                    Some(Ok(content)) => content,
                    _ => continue,
                };
                self.refresh_snapshot(&mut stash, &path, content);
            }

            if mutated {
                if let Err(e) = stash.collect_blob_garbage() {
                    log::warn!("blob gc after scan failed: {e}");
                }
            }
            stash.save()?;
        }

        if mutated {
            handle.schedule_sync();
        }
        Ok(())
    }

    /// CRDT-to-disk pass under the writing guard; returns paths whose disk
    /// content the user edited during the flush window (rerouted by the
    /// caller).
    async fn flush_to_disk(&mut self) -> Result<Vec<String>> {
        let handle = self.stash.clone();
        let mut reroutes = Vec::new();
        let mut mutated = false;

        {
            let mut stash = handle.lock().await;

            for path in stash.list_files() {
                let Some(doc_id) = stash.doc_id_of(&path) else { continue };
                let is_text = stash.file_doc(&doc_id).map(|d| d.is_text()).unwrap_or(false);
                let abs = self.root.join(&path);
                let disk_bytes = fs::read(&abs).ok();

                if is_text {
                    let disk_text = disk_bytes.as_deref().and_then(decode_text);
                    let have_snapshot = self.disk_snapshots.contains_key(&path);

                    if disk_bytes.is_none() && have_snapshot {
                        // The user deleted the file while we were flushing.
                        if stash.delete(&path).is_ok() {
                            self.disk_snapshots.remove(&path);
                            mutated = true;
                        }
                        continue;
                    }

                    if let Some(text) = &disk_text
                        && have_snapshot
                        && self
                            .disk_snapshots
                            .get(&path)
                            .is_some_and(|s| s.content != *text)
                    {
                        // Edited during the flush window: reroute as a
                        // normal change.
                        reroutes.push(path.clone());
                        continue;
                    }

                    let doc_content = match stash.file_doc(&doc_id).map(|d| d.content()) {
                        Some(Ok(content)) => content,
                        _ => continue,
                    };
                    if disk_text.as_deref() != Some(doc_content.as_str()) {
                        if let Err(e) = write_tree_file(&self.root, &path, doc_content.as_bytes()) {
                            log::error!("flushing '{path}' to disk failed: {e}");
                            continue;
                        }
                        mutated = true;
                    }
                    self.refresh_snapshot(&mut stash, &path, doc_content);
                } else {
                    let stored_hash = stash.file_doc(&doc_id).and_then(|d| d.binary_hash());
                    let Some(stored_hash) = stored_hash else { continue };

                    if disk_bytes.is_none() && stash.is_known_path(&path) {
                        if stash.delete(&path).is_ok() {
                            mutated = true;
                        }
                        continue;
                    }
                    let disk_hash = disk_bytes.as_deref().map(sha256_hex);
                    if disk_hash.as_deref() != Some(stored_hash.as_str()) {
                        match stash.blob_store().read(&stored_hash) {
                            Ok(blob) => {
                                if let Err(e) = write_tree_file(&self.root, &path, &blob) {
                                    log::error!("flushing blob for '{path}' failed: {e}");
                                } else {
                                    mutated = true;
                                }
                            }
                            Err(e) => log::warn!("blob for '{path}' unavailable: {e}"),
                        }
                    }
                }
                stash.add_known_path(&path);
            }

            // Orphan dispatch over everything on disk that is not active.
            for key in walk_tree(&self.root)? {
                let entry = stash.structure().entry(&key);
                match entry {
                    Some(entry) if entry.deleted => {
                        if stash.is_known_path(&key) {
                            // We observed this file before: the delete wins.
                            let abs = self.root.join(&key);
                            if let Err(e) = fs::remove_file(&abs) {
                                log::error!("honoring delete of '{key}' failed: {e}");
                                continue;
                            }
                            stash.remove_known_path(&key);
                            self.disk_snapshots.remove(&key);
                            remove_empty_parents(&abs, &self.root);
                            mutated = true;
                        } else {
                            // Never observed here: local work, resurrect it
                            // under a fresh doc id.
                            mutated |= self.import_locked(&mut stash, &key);
                        }
                    }
                    Some(_) => {}
                    None => {
                        mutated |= self.import_locked(&mut stash, &key);
                    }
                }
            }

            if mutated {
                if let Err(e) = stash.collect_blob_garbage() {
                    log::warn!("blob gc after flush failed: {e}");
                }
            }
            stash.save()?;
        }

        if mutated {
            handle.schedule_sync();
        }
        Ok(reroutes)
    }

    /// Import one disk file while already holding the stash lock.
    fn import_locked(&mut self, stash: &mut crate::stash::Stash, key: &str) -> bool {
        let abs = self.root.join(key);
        let Ok(bytes) = fs::read(&abs) else {
            return false;
        };
        let result = match decode_text(&bytes) {
            Some(text) => {
                let r = stash.write(key, &text);
                if r.is_ok() {
                    self.refresh_snapshot(stash, key, text);
                }
                r
            }
            None => stash.write_binary_bytes(key, &bytes).map(|_| ()),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                log::error!("import of '{key}' failed: {e}");
                false
            }
        }
    }

    /// Re-run the change path for a key (reroutes after flush).
    async fn replay_change(&mut self, key: &str) {
        let abs = self.root.join(key);
        let Ok(bytes) = fs::read(&abs) else { return };
        self.on_change(key, bytes).await;
    }

    /// Races with our own writes: replay any path whose snapshot no longer
    /// matches disk.
    async fn reconcile_races(&mut self) {
        let stale: Vec<String> = self
            .disk_snapshots
            .iter()
            .filter(|(key, snapshot)| {
                let abs = self.root.join(key.as_str());
                match fs::read(&abs).ok().as_deref().and_then(decode_text) {
                    Some(text) => text != snapshot.content,
                    None => false,
                }
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            self.replay_change(&key).await;
        }
    }
}

/// Write a working-tree file, creating parent directories.
fn write_tree_file(root: &Path, key: &str, bytes: &[u8]) -> Result<()> {
    let abs = root.join(key);
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&abs, bytes).map_err(|e| StashError::FileWrite {
        path: abs.clone(),
        source: e,
    })
}

fn basename(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}
