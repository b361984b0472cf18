//! Shared stash handle: the per-stash cooperative scheduler.
//!
//! A [`SharedStash`] wraps the stash state in one async mutex, which is the
//! stash's task queue: reconciler handlers, background saves, and sync runs
//! all serialize on it. On top of that it implements the scheduling contract:
//!
//! - every mutating operation schedules a background save; saves are chained
//!   in enqueue order, and the dirty flag is cleared only if no newer write
//!   arrived after the save was scheduled (generation counter);
//! - `schedule_sync` debounces (default 2 s) and any later write coalesces
//!   into the same pending run;
//! - `sync` is single-flight: a second concurrent call returns immediately.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::settings::Settings;
use crate::stash::Stash;
use crate::sync::retry::RetryPolicy;
use crate::sync::{sync_with_provider, SyncOutcome};

struct StashCell {
    state: Mutex<Stash>,
    name: String,
    syncing: AtomicBool,
    dirty_gen: AtomicU64,
    saved_gen: AtomicU64,
    /// Serializes background saves in enqueue order (the tokio mutex is
    /// fair).
    save_chain: Mutex<()>,
    sync_debounce: std::sync::Mutex<Option<JoinHandle<()>>>,
    settings: Settings,
    retry: RetryPolicy,
}

/// Cloneable handle to a stash and its scheduler.
#[derive(Clone)]
pub struct SharedStash {
    cell: Arc<StashCell>,
}

impl SharedStash {
    /// Wrap a stash with default production timings.
    pub fn new(stash: Stash) -> Self {
        Self::with_settings(stash, Settings::default(), RetryPolicy::default())
    }

    /// Wrap a stash with explicit timings (tests shrink them).
    pub fn with_settings(stash: Stash, settings: Settings, retry: RetryPolicy) -> Self {
        Self {
            cell: Arc::new(StashCell {
                name: stash.name().to_string(),
                state: Mutex::new(stash),
                syncing: AtomicBool::new(false),
                dirty_gen: AtomicU64::new(0),
                saved_gen: AtomicU64::new(0),
                save_chain: Mutex::new(()),
                sync_debounce: std::sync::Mutex::new(None),
                settings,
                retry,
            }),
        }
    }

    /// Stash name.
    pub fn name(&self) -> &str {
        &self.cell.name
    }

    /// Timing knobs this handle was built with.
    pub fn settings(&self) -> Settings {
        self.cell.settings
    }

    /// Take the stash's task-queue lock directly (reconciler use).
    pub async fn lock(&self) -> MutexGuard<'_, Stash> {
        self.cell.state.lock().await
    }

    // ==================== Reads ====================

    /// Text content of an active tracked file.
    pub async fn read(&self, path: &str) -> Result<String> {
        self.lock().await.read(path)
    }

    /// Bytes of an active tracked binary file.
    pub async fn read_binary(&self, path: &str) -> Result<Vec<u8>> {
        self.lock().await.read_binary(path)
    }

    /// Whether `path` is tombstoned.
    pub async fn is_deleted(&self, path: &str) -> bool {
        self.lock().await.is_deleted(path)
    }

    /// Sorted list of active paths.
    pub async fn list_files(&self) -> Vec<String> {
        self.lock().await.list_files()
    }

    /// Active paths matching a glob pattern.
    pub async fn glob(&self, pattern: &str) -> Result<Vec<String>> {
        self.lock().await.glob(pattern)
    }

    // ==================== Writes ====================

    /// Write text content, then schedule a save and a debounced sync.
    pub async fn write(&self, path: &str, content: &str) -> Result<()> {
        self.lock().await.write(path, content)?;
        self.after_mutation();
        Ok(())
    }

    /// Store binary bytes, then schedule a save and a debounced sync.
    pub async fn write_binary_bytes(&self, path: &str, bytes: &[u8]) -> Result<String> {
        let hash = self.lock().await.write_binary_bytes(path, bytes)?;
        self.after_mutation();
        Ok(hash)
    }

    /// Apply a text patch, then schedule a save and a debounced sync.
    pub async fn patch(&self, path: &str, start: usize, end: usize, text: &str) -> Result<()> {
        self.lock().await.patch(path, start, end, text)?;
        self.after_mutation();
        Ok(())
    }

    /// Tombstone a path, then schedule a save and a debounced sync.
    pub async fn delete(&self, path: &str) -> Result<()> {
        self.lock().await.delete(path)?;
        self.after_mutation();
        Ok(())
    }

    /// Move a file, then schedule a save and a debounced sync.
    pub async fn move_file(&self, from: &str, to: &str) -> Result<()> {
        self.lock().await.move_file(from, to)?;
        self.after_mutation();
        Ok(())
    }

    fn after_mutation(&self) {
        self.schedule_background_save();
        self.schedule_sync();
    }

    // ==================== Background saves ====================

    /// Queue a background save of all `.stash/` artifacts.
    ///
    /// Failures are logged, never propagated; callers that need durability
    /// call [`SharedStash::flush`].
    pub fn schedule_background_save(&self) {
        let generation = self.cell.dirty_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let cell = Arc::clone(&self.cell);
        tokio::spawn(async move {
            let _chain = cell.save_chain.lock().await;
            let mut stash = cell.state.lock().await;
            match stash.save() {
                Ok(()) => {
                    cell.saved_gen.fetch_max(generation, Ordering::SeqCst);
                }
                Err(e) => log::error!("background save failed for '{}': {e}", cell.name),
            }
        });
    }

    /// Whether writes newer than the last completed save exist.
    pub fn is_dirty(&self) -> bool {
        self.cell.dirty_gen.load(Ordering::SeqCst) > self.cell.saved_gen.load(Ordering::SeqCst)
    }

    /// Await the save chain and ensure the latest state is on disk.
    pub async fn flush(&self) -> Result<()> {
        let _chain = self.cell.save_chain.lock().await;
        let generation = self.cell.dirty_gen.load(Ordering::SeqCst);
        if generation > self.cell.saved_gen.load(Ordering::SeqCst) {
            let mut stash = self.cell.state.lock().await;
            stash.save()?;
            self.cell.saved_gen.fetch_max(generation, Ordering::SeqCst);
        }
        Ok(())
    }

    // ==================== Sync scheduling ====================

    /// Debounced sync: coalesces with any already-pending run and resets the
    /// timer on every call.
    pub fn schedule_sync(&self) {
        let mut slot = self.cell.sync_debounce.lock().unwrap();
        if let Some(pending) = slot.take() {
            pending.abort();
        }
        let this = self.clone();
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(this.cell.settings.sync_debounce).await;
            match this.sync().await {
                Ok(_) => {}
                Err(e) => log::warn!("debounced sync failed for '{}': {e}", this.cell.name),
            }
        }));
    }

    /// Run a sync now. Single-flight: a concurrent call observes the running
    /// one and returns immediately.
    pub async fn sync(&self) -> Result<SyncOutcome> {
        if self
            .cell
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(SyncOutcome::AlreadySyncing);
        }

        let result = self.sync_inner().await;
        self.cell.syncing.store(false, Ordering::SeqCst);
        result
    }

    async fn sync_inner(&self) -> Result<SyncOutcome> {
        let provider = { self.cell.state.lock().await.provider() };
        let Some(provider) = provider else {
            return Ok(SyncOutcome::NoProvider);
        };
        let mut stash = self.cell.state.lock().await;
        sync_with_provider(&mut stash, provider.as_ref(), &self.cell.retry).await
    }

    /// Whether a sync run is currently in flight.
    pub fn is_syncing(&self) -> bool {
        self.cell.syncing.load(Ordering::SeqCst)
    }
}
