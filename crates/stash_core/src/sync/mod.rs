//! Sync controller: the fetch / merge / push pipeline.
//!
//! One sync run repairs dangling doc references, detects local changes via
//! the snapshot fingerprint, fetches the remote docs under retry, and then
//! follows the decision table:
//!
//! | unchanged | local changes | remote empty | action                     |
//! |-----------|---------------|--------------|----------------------------|
//! | yes       | no            | —            | no-op                      |
//! | yes       | yes           | —            | push current state         |
//! | no        | —             | yes          | push (populate fresh remote) |
//! | no        | no            | no           | merge, save, defer push    |
//! | no        | yes           | no           | merge, push merged state   |
//!
//! Merging applies the content-wins rule afterwards: a tombstone loses to
//! concurrent non-empty text content, so deletes never destroy work another
//! replica did after the delete.

pub mod retry;

use std::collections::{BTreeMap, HashMap};

use automerge::ActorId;

use crate::crdt::{DocId, FileDoc, StructureDoc};
use crate::error::{Result, StashError};
use crate::remote::{FetchResult, FileData, PushPayload, RemoteTransport, STRUCTURE_DOC_KEY};
use crate::stash::Stash;
use retry::RetryPolicy;

/// What a sync run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// No provider is configured; nothing to do.
    NoProvider,
    /// Another sync was already in flight; this call was a no-op.
    AlreadySyncing,
    /// Neither side changed.
    UpToDate,
    /// Local state was pushed; nothing needed merging.
    Pushed,
    /// Remote changes were merged; the push was deferred.
    Merged,
    /// Remote changes were merged and the merged state pushed.
    MergedAndPushed,
}

/// Run one full sync of `stash` against `provider`.
pub async fn sync_with_provider(
    stash: &mut Stash,
    provider: &dyn RemoteTransport,
    policy: &RetryPolicy,
) -> Result<SyncOutcome> {
    stash.repair_dangling_docs()?;

    let current = stash.current_snapshot();
    let has_local_changes = current.differs_from(stash.last_pushed_snapshot());

    let fetched: FetchResult = match retry::with_backoff(policy, || provider.fetch()).await {
        Ok(result) => result,
        Err(StashError::NotFound(_)) if provider.supports_create() => {
            log::info!("remote missing for '{}', creating", stash.name());
            provider.create().await?;
            push_current_state(stash, provider, policy).await?;
            return Ok(SyncOutcome::Pushed);
        }
        Err(e) => return Err(e),
    };

    let outcome = if fetched.unchanged {
        if has_local_changes {
            push_current_state(stash, provider, policy).await?;
            SyncOutcome::Pushed
        } else {
            SyncOutcome::UpToDate
        }
    } else if fetched.docs.is_empty() {
        push_current_state(stash, provider, policy).await?;
        SyncOutcome::Pushed
    } else {
        merge_with_remote(stash, &fetched.docs)?;
        if has_local_changes {
            push_current_state(stash, provider, policy).await?;
            SyncOutcome::MergedAndPushed
        } else {
            stash.save()?;
            SyncOutcome::Merged
        }
    };

    if let Err(e) = stash.collect_blob_garbage() {
        log::warn!("blob gc after sync failed for '{}': {e}", stash.name());
    }

    Ok(outcome)
}

/// Merge fetched remote docs into the stash.
pub fn merge_with_remote(stash: &mut Stash, remote_docs: &HashMap<String, Vec<u8>>) -> Result<()> {
    let Some(structure_bytes) = remote_docs.get(STRUCTURE_DOC_KEY) else {
        log::warn!("remote returned docs without a structure document; skipping merge");
        return Ok(());
    };

    // Load remote file docs once; text contents are captured before the merge
    // consumes them so content-wins can compare against the remote side.
    let mut remote_file_docs: HashMap<DocId, FileDoc> = HashMap::new();
    let mut remote_text_contents: HashMap<DocId, String> = HashMap::new();
    for (key, bytes) in remote_docs {
        if key == STRUCTURE_DOC_KEY {
            continue;
        }
        match FileDoc::load_with_actor(bytes, stash.actor().clone()) {
            Ok(doc) => {
                if doc.is_text() {
                    remote_text_contents.insert(key.clone(), doc.content()?);
                }
                remote_file_docs.insert(key.clone(), doc);
            }
            Err(e) => log::warn!("skipping unreadable remote doc {key}: {e}"),
        }
    }

    if stash.structure().is_empty() {
        fresh_join(stash, structure_bytes, remote_file_docs)?;
        return Ok(());
    }

    let mut remote_structure = StructureDoc::load(structure_bytes, ActorId::random())?;

    // Same path bound to different doc ids on the two sides means the path
    // was deleted and re-created somewhere. Snapshot the local binding so a
    // concurrent remote tombstone cannot clobber newly local work.
    let mut local_rebinds: Vec<(String, DocId)> = Vec::new();
    for (path, entry) in stash.structure().list_all() {
        if entry.deleted {
            continue;
        }
        if let Some(remote_entry) = remote_structure.entry(&path)
            && remote_entry.doc_id != entry.doc_id
        {
            local_rebinds.push((path, entry.doc_id));
        }
    }

    stash.structure_mut().merge(&mut remote_structure)?;

    for (path, doc_id) in local_rebinds {
        stash.restore_entry(&path, doc_id)?;
    }

    // Merge or adopt every referenced file doc.
    for doc_id in stash.structure().referenced_doc_ids() {
        let Some(mut remote_doc) = remote_file_docs.remove(&doc_id) else {
            continue;
        };
        if let Some(local) = stash.file_doc_mut(&doc_id) {
            local.merge(&mut remote_doc)?;
            continue;
        }
        stash.insert_doc(doc_id, remote_doc);
    }

    stash.drop_unreferenced_docs();
    apply_content_wins(stash, &remote_text_contents)?;
    stash.repair_dangling_docs()?;

    for path in stash.structure().list_active() {
        stash.add_known_path(&path);
    }
    Ok(())
}

/// Adopt the remote state wholesale: the local replica has never tracked
/// anything, so the remote structure and docs become ours and every active
/// path counts as locally observed.
fn fresh_join(
    stash: &mut Stash,
    structure_bytes: &[u8],
    remote_file_docs: HashMap<DocId, FileDoc>,
) -> Result<()> {
    log::info!("fresh join: adopting remote structure for '{}'", stash.name());
    let structure = StructureDoc::load(structure_bytes, stash.actor().clone())?;
    stash.replace_structure(structure);
    stash.replace_docs(remote_file_docs);
    stash.repair_dangling_docs()?;
    for path in stash.structure().list_active() {
        stash.add_known_path(&path);
    }
    Ok(())
}

/// Clear tombstones that lost to concurrent non-empty text content.
///
/// Applies only to text docs; a binary's content is immutable given its hash,
/// so tombstone races on binaries resolve by the structure tie-break alone.
fn apply_content_wins(
    stash: &mut Stash,
    remote_text_contents: &HashMap<DocId, String>,
) -> Result<()> {
    for path in stash.structure().list_deleted() {
        let Some(doc_id) = stash.doc_id_of(&path) else {
            continue;
        };
        let (content, heads) = match stash.file_doc_mut(&doc_id) {
            Some(doc) if doc.is_text() => (doc.content()?, doc.heads_hex()),
            _ => continue,
        };

        let revive = match remote_text_contents.get(&doc_id) {
            // The remote sent this doc: the local side differing means local
            // edits the tombstoner never saw.
            Some(remote_content) => content != *remote_content,
            // Incremental fetch omitted the doc: revive when the doc moved
            // since our last push and still has content.
            None => {
                let pushed_heads = stash
                    .last_pushed_snapshot()
                    .and_then(|s| s.docs.get(&doc_id));
                pushed_heads != Some(&heads) && !content.is_empty()
            }
        };

        if revive {
            log::debug!("content-wins: reviving '{path}'");
            stash.restore_entry(&path, doc_id)?;
        }
    }
    Ok(())
}

/// Push the full current state, with incremental hints, then record the
/// pushed snapshot. The snapshot is persisted only after the push succeeds so
/// a crash can never falsely mark work as pushed.
pub async fn push_current_state(
    stash: &mut Stash,
    provider: &dyn RemoteTransport,
    policy: &RetryPolicy,
) -> Result<()> {
    let snapshot = stash.current_snapshot();
    let changed_paths = snapshot.changed_paths(stash.last_pushed_snapshot());

    let mut docs: HashMap<String, Vec<u8>> = HashMap::new();
    docs.insert(STRUCTURE_DOC_KEY.to_string(), stash.structure_mut().save());
    for doc_id in stash.doc_ids() {
        if let Some(doc) = stash.file_doc_mut(&doc_id) {
            docs.insert(doc_id.clone(), doc.save());
        }
    }

    let mut files: BTreeMap<String, FileData> = BTreeMap::new();
    for path in stash.list_files() {
        let Some(doc_id) = stash.doc_id_of(&path) else {
            continue;
        };
        let Some(doc) = stash.file_doc(&doc_id) else {
            continue;
        };
        if doc.is_text() {
            files.insert(path, FileData::Text(doc.content()?));
        } else if let Some(hash) = doc.binary_hash() {
            match stash.blob_store().read(&hash) {
                Ok(bytes) => {
                    files.insert(path, FileData::Binary(bytes));
                }
                Err(e) => log::warn!("missing blob {hash} for '{path}': {e}"),
            }
        }
    }

    let paths_to_delete = stash.structure().list_deleted().into_iter().collect();

    let payload = PushPayload {
        docs,
        files,
        changed_paths,
        paths_to_delete,
    };

    retry::with_backoff(policy, || provider.push(payload.clone())).await?;

    stash.set_last_pushed_snapshot(snapshot);
    stash.save()?;
    Ok(())
}
