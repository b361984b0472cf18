//! Abstract remote transport.
//!
//! The sync controller talks to a replica of the CRDT documents (plus a
//! rendered copy of the working tree) through this trait. Concrete
//! providers — a versioned-tree store such as a Git host — live outside the
//! core; the in-memory implementation in [`memory`] serves tests and local
//! experiments.
//!
//! Contract: after a successful `push`, a `fetch` from any replica returns
//! docs whose CRDT merge includes the pushed state. Concurrent pushes must
//! either linearize or one pusher must observe the other's changes through a
//! subsequent fetch.

pub mod memory;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;

use crate::error::Result;

/// Boxed future type used to keep the transport trait object-safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Key under which the structure document travels in doc maps.
pub const STRUCTURE_DOC_KEY: &str = "structure";

/// Result of a `fetch`.
#[derive(Debug, Default, Clone)]
pub struct FetchResult {
    /// CRDT binary saves keyed by doc id, plus [`STRUCTURE_DOC_KEY`].
    pub docs: HashMap<String, Vec<u8>>,

    /// When true the provider guarantees nothing on the remote changed since
    /// the last fetch; `docs` is empty in that case.
    pub unchanged: bool,
}

/// Rendered content of one working-tree file in a push payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileData {
    /// UTF-8 text content.
    Text(String),
    /// Raw bytes of a binary file.
    Binary(Vec<u8>),
}

/// Everything a `push` carries.
#[derive(Debug, Default, Clone)]
pub struct PushPayload {
    /// Full CRDT saves keyed by doc id, plus [`STRUCTURE_DOC_KEY`].
    pub docs: HashMap<String, Vec<u8>>,

    /// Rendered working-tree files for every active path.
    pub files: BTreeMap<String, FileData>,

    /// Advisory incremental hint: when non-empty, only entries whose logical
    /// path is in the set need pushing. Transports may push more, never less.
    /// Doc entries are named by their virtual `.stash/...` paths.
    pub changed_paths: BTreeSet<String>,

    /// User-visible paths to remove from the rendered remote tree.
    pub paths_to_delete: BTreeSet<String>,
}

/// Capability set of a remote replica.
///
/// All methods may fail with [`crate::error::StashError::Sync`]; the
/// `retryable` flag on the error value drives the retry policy.
pub trait RemoteTransport: Send + Sync {
    /// Human-readable provider name for logging.
    fn name(&self) -> &str;

    /// Fetch the remote docs, or `unchanged` when the provider can prove
    /// nothing moved. A missing remote fails with `NotFound` (never an empty
    /// doc map).
    fn fetch(&self) -> BoxFuture<'_, Result<FetchResult>>;

    /// Push docs and rendered files.
    fn push(&self, payload: PushPayload) -> BoxFuture<'_, Result<()>>;

    /// Whether this provider can create the remote. Read-only providers
    /// return false.
    fn supports_create(&self) -> bool {
        false
    }

    /// Create the remote. Idempotent where supported.
    fn create(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async {
            Err(crate::error::StashError::sync_fatal(
                "provider does not support create",
            ))
        })
    }

    /// Delete the remote.
    fn delete_remote(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async {
            Err(crate::error::StashError::sync_fatal(
                "provider does not support delete",
            ))
        })
    }

    /// Opaque token the transport may persist alongside the sync state to
    /// detect `unchanged` on later fetches.
    fn sync_state_hint(&self) -> Option<String> {
        None
    }
}
