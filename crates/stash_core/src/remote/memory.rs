//! In-memory remote transport.
//!
//! A [`MemoryRemoteStore`] is the shared hub ("the remote"); each replica
//! connects its own [`MemoryRemote`] handle to it. Pushes merge CRDT saves
//! into the stored docs under one mutex, which linearizes concurrent pushes
//! exactly as the transport contract requires. Multi-replica integration
//! tests share one store between any number of handles.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use automerge::AutoCommit;

use crate::crdt::{doc_virtual_path, STRUCTURE_VIRTUAL_PATH};
use crate::error::{Result, StashError};
use crate::remote::{BoxFuture, FetchResult, FileData, PushPayload, RemoteTransport, STRUCTURE_DOC_KEY};

#[derive(Default)]
struct StoreState {
    created: bool,
    docs: HashMap<String, Vec<u8>>,
    files: BTreeMap<String, FileData>,
    version: u64,
}

/// Shared state of an in-memory remote, used by any number of connected
/// [`MemoryRemote`] handles.
#[derive(Default)]
pub struct MemoryRemoteStore {
    state: Mutex<StoreState>,
}

impl MemoryRemoteStore {
    /// A fresh, not-yet-created remote.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Rendered working-tree files currently on the remote (test helper).
    pub fn rendered_files(&self) -> BTreeMap<String, FileData> {
        self.state.lock().unwrap().files.clone()
    }

    /// Doc keys currently stored on the remote (test helper).
    pub fn doc_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.lock().unwrap().docs.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of completed pushes (test helper).
    pub fn version(&self) -> u64 {
        self.state.lock().unwrap().version
    }
}

/// One replica's handle onto a [`MemoryRemoteStore`].
pub struct MemoryRemote {
    store: Arc<MemoryRemoteStore>,
    last_seen_version: Mutex<u64>,
    fail_next_pushes: AtomicUsize,
    fail_retryable: AtomicBool,
}

impl MemoryRemote {
    /// Connect a new handle to a shared store.
    pub fn connect(store: Arc<MemoryRemoteStore>) -> Self {
        Self {
            store,
            last_seen_version: Mutex::new(0),
            fail_next_pushes: AtomicUsize::new(0),
            fail_retryable: AtomicBool::new(true),
        }
    }

    /// Make the next `count` pushes fail (test fault injection).
    pub fn fail_pushes(&self, count: usize, retryable: bool) {
        self.fail_next_pushes.store(count, Ordering::SeqCst);
        self.fail_retryable.store(retryable, Ordering::SeqCst);
    }

    fn doc_included(changed: &std::collections::BTreeSet<String>, key: &str) -> bool {
        if changed.is_empty() {
            return true;
        }
        let virtual_path = if key == STRUCTURE_DOC_KEY {
            STRUCTURE_VIRTUAL_PATH.to_string()
        } else {
            doc_virtual_path(key)
        };
        changed.contains(&virtual_path)
    }
}

impl RemoteTransport for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    fn fetch(&self) -> BoxFuture<'_, Result<FetchResult>> {
        Box::pin(async {
            let state = self.store.state.lock().unwrap();
            if !state.created {
                return Err(StashError::NotFound("remote does not exist".to_string()));
            }
            let mut last_seen = self.last_seen_version.lock().unwrap();
            if state.version == *last_seen {
                return Ok(FetchResult {
                    docs: HashMap::new(),
                    unchanged: true,
                });
            }
            *last_seen = state.version;
            Ok(FetchResult {
                docs: state.docs.clone(),
                unchanged: false,
            })
        })
    }

    fn push(&self, payload: PushPayload) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let pending = self.fail_next_pushes.load(Ordering::SeqCst);
            if pending > 0 {
                self.fail_next_pushes.store(pending - 1, Ordering::SeqCst);
                return Err(StashError::Sync {
                    retryable: self.fail_retryable.load(Ordering::SeqCst),
                    message: "injected push failure".to_string(),
                });
            }

            let mut state = self.store.state.lock().unwrap();
            state.created = true;

            for (key, bytes) in &payload.docs {
                if !Self::doc_included(&payload.changed_paths, key) {
                    continue;
                }
                let merged = match state.docs.get(key) {
                    Some(existing) => {
                        let mut base = AutoCommit::load(existing)?;
                        let mut incoming = AutoCommit::load(bytes)?;
                        base.merge(&mut incoming)?;
                        base.save()
                    }
                    None => bytes.clone(),
                };
                state.docs.insert(key.clone(), merged);
            }

            for (path, data) in &payload.files {
                if !payload.changed_paths.is_empty() && !payload.changed_paths.contains(path) {
                    continue;
                }
                state.files.insert(path.clone(), data.clone());
            }

            for path in &payload.paths_to_delete {
                state.files.remove(path);
            }

            state.version += 1;
            // Our own push is known state; the next fetch from this handle
            // reports unchanged unless someone else pushed in between.
            *self.last_seen_version.lock().unwrap() = state.version;
            Ok(())
        })
    }

    fn supports_create(&self) -> bool {
        true
    }

    fn create(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async {
            self.store.state.lock().unwrap().created = true;
            Ok(())
        })
    }

    fn delete_remote(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async {
            let mut state = self.store.state.lock().unwrap();
            *state = StoreState::default();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_missing_remote_is_not_found() {
        let store = MemoryRemoteStore::new();
        let remote = MemoryRemote::connect(store);
        assert!(matches!(
            remote.fetch().await,
            Err(StashError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unchanged_after_own_push() {
        let store = MemoryRemoteStore::new();
        let remote = MemoryRemote::connect(store);

        let mut doc = AutoCommit::new();
        automerge::transaction::Transactable::put(&mut doc, automerge::ROOT, "k", "v").unwrap();
        let payload = PushPayload {
            docs: HashMap::from([(STRUCTURE_DOC_KEY.to_string(), doc.save())]),
            ..Default::default()
        };
        remote.push(payload).await.unwrap();

        let result = remote.fetch().await.unwrap();
        assert!(result.unchanged);
        assert!(result.docs.is_empty());
    }

    #[tokio::test]
    async fn test_other_replica_sees_push() {
        let store = MemoryRemoteStore::new();
        let a = MemoryRemote::connect(store.clone());
        let b = MemoryRemote::connect(store);

        let mut doc = AutoCommit::new();
        automerge::transaction::Transactable::put(&mut doc, automerge::ROOT, "k", "v").unwrap();
        a.push(PushPayload {
            docs: HashMap::from([(STRUCTURE_DOC_KEY.to_string(), doc.save())]),
            ..Default::default()
        })
        .await
        .unwrap();

        let seen = b.fetch().await.unwrap();
        assert!(!seen.unchanged);
        assert!(seen.docs.contains_key(STRUCTURE_DOC_KEY));
    }

    #[tokio::test]
    async fn test_changed_paths_filters_files() {
        let store = MemoryRemoteStore::new();
        let remote = MemoryRemote::connect(store.clone());
        remote.create().await.unwrap();

        remote
            .push(PushPayload {
                files: BTreeMap::from([
                    ("a.md".to_string(), FileData::Text("a".into())),
                    ("b.md".to_string(), FileData::Text("b".into())),
                ]),
                changed_paths: ["a.md".to_string()].into_iter().collect(),
                ..Default::default()
            })
            .await
            .unwrap();

        let files = store.rendered_files();
        assert!(files.contains_key("a.md"));
        assert!(!files.contains_key("b.md"));
    }
}
