//! CRDT documents backing a stash.
//!
//! A stash keeps one [`StructureDoc`] (path → file-doc mapping with
//! tombstones) and one [`FileDoc`] per tracked path. Both wrap automerge
//! documents; merging is delegated entirely to automerge, and the sync
//! controller corrects the one case automerge cannot decide (a concurrent
//! delete racing a content edit).

mod file_doc;
mod snapshot;
mod structure;

pub use file_doc::{FileDoc, FileDocKind};
pub use snapshot::{doc_virtual_path, SyncSnapshot, STRUCTURE_VIRTUAL_PATH};
pub use structure::{DocId, StructureDoc, StructureEntry, new_doc_id};

use automerge::ActorId;

use crate::error::{Result, StashError};

/// Decode a 64-hex actor identifier into an automerge [`ActorId`].
pub fn parse_actor_id(hex_id: &str) -> Result<ActorId> {
    if hex_id.len() != 64 {
        return Err(StashError::Validation(format!(
            "actor id must be 64 hex characters, got {}",
            hex_id.len()
        )));
    }
    let bytes = hex::decode(hex_id)
        .map_err(|_| StashError::Validation("actor id is not valid hex".to_string()))?;
    Ok(ActorId::from(bytes.as_slice()))
}
