#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Content-addressed blob store for binary payloads
pub mod blob;

/// Global configuration registry (actor id, stash registry)
pub mod config;

/// CRDT documents: structure doc, file docs, sync snapshot
pub mod crdt;

/// Daemon host: reconcilers, sync ticker, PID file
pub mod daemon;

/// Error (common error types)
pub mod error;

/// Filesystem helpers: atomic writes, hashing, tree walks
pub mod fsutil;

/// Stash manager: registry of named stashes
pub mod manager;

/// Reconciler: the filesystem ↔ CRDT bridge
pub mod reconciler;

/// Abstract remote transport and the in-memory implementation
pub mod remote;

/// Timing knobs
pub mod settings;

/// The stash itself: state, persistence, scheduling handle
pub mod stash;

/// Sync controller: fetch / merge / push pipeline
pub mod sync;

pub use error::{Result, StashError};
pub use manager::StashManager;
pub use reconciler::Reconciler;
pub use settings::Settings;
pub use stash::{SharedStash, Stash};
pub use sync::SyncOutcome;
