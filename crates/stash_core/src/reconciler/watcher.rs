//! Filesystem watcher bridge.
//!
//! Wraps a recursive [`notify`] watcher rooted at the stash path and forwards
//! filtered events into a tokio channel the reconciler task consumes. Paths
//! under `.stash/` and any dot-entry are dropped at the source. Platform
//! rename notifications are folded into the reconciler's add/unlink model so
//! the pending-delete window sees them the same way as plain delete+create.

use std::path::{Path, PathBuf};

use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::error::{Result, StashError};
use crate::fsutil::has_hidden_component;

/// Filtered filesystem event delivered to the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A file appeared.
    Added(PathBuf),
    /// A file's content changed.
    Changed(PathBuf),
    /// A file disappeared.
    Removed(PathBuf),
}

impl WatchEvent {
    /// The absolute path the event refers to.
    pub fn path(&self) -> &Path {
        match self {
            WatchEvent::Added(p) | WatchEvent::Changed(p) | WatchEvent::Removed(p) => p,
        }
    }
}

/// Recursive watcher over a stash working tree.
pub struct TreeWatcher {
    // Kept alive for the duration of the watch; dropping it stops the stream.
    _watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<WatchEvent>,
}

impl TreeWatcher {
    /// Start watching `root` recursively.
    pub fn start(root: &Path) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let root_buf = root.to_path_buf();

        let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            let event = match result {
                Ok(event) => event,
                Err(e) => {
                    log::warn!("watcher error: {e}");
                    return;
                }
            };

            let passes = |path: &PathBuf| {
                path.strip_prefix(&root_buf)
                    .is_ok_and(|rel| !rel.as_os_str().is_empty() && !has_hidden_component(rel))
            };

            // A rename reported as one event carries [from, to]; split it so
            // the reconciler's pending-delete window sees unlink-then-add.
            if let EventKind::Modify(ModifyKind::Name(RenameMode::Both)) = event.kind
                && event.paths.len() == 2
            {
                if passes(&event.paths[0]) {
                    let _ = tx.send(WatchEvent::Removed(event.paths[0].clone()));
                }
                if passes(&event.paths[1]) {
                    let _ = tx.send(WatchEvent::Added(event.paths[1].clone()));
                }
                return;
            }

            for path in &event.paths {
                let Ok(rel) = path.strip_prefix(&root_buf) else {
                    continue;
                };
                if rel.as_os_str().is_empty() || has_hidden_component(rel) {
                    continue;
                }
                let mapped = match &event.kind {
                    EventKind::Create(_) => WatchEvent::Added(path.clone()),
                    EventKind::Remove(_) => WatchEvent::Removed(path.clone()),
                    EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                        WatchEvent::Removed(path.clone())
                    }
                    EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                        WatchEvent::Added(path.clone())
                    }
                    EventKind::Modify(_) => WatchEvent::Changed(path.clone()),
                    _ => continue,
                };
                // Receiver gone means the reconciler stopped; nothing to do.
                let _ = tx.send(mapped);
            }
        })
        .map_err(watch_err)?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(watch_err)?;

        Ok(Self {
            _watcher: watcher,
            rx,
        })
    }

    /// Next event, or `None` when the watcher shut down.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }
}

fn watch_err(e: notify::Error) -> StashError {
    StashError::Io(std::io::Error::other(e))
}
