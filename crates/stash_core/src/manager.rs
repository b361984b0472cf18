//! Stash manager: the registry of named stashes for one base directory.
//!
//! Wraps the global config registry with live [`SharedStash`] handles:
//! create/connect/delete, fan-out sync with aggregated errors, and a
//! throttled reload that picks up registry changes made by other processes.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ConfigStore;
use crate::error::{Result, StashError};
use crate::remote::RemoteTransport;
use crate::settings::Settings;
use crate::stash::{validate_name, SharedStash, Stash};
use crate::sync::retry::RetryPolicy;
use crate::sync::SyncOutcome;

/// Minimum spacing between two registry reloads.
const RELOAD_THROTTLE: Duration = Duration::from_secs(2);

/// Registry of named stashes rooted in one base directory.
pub struct StashManager {
    config: ConfigStore,
    stashes: HashMap<String, SharedStash>,
    settings: Settings,
    retry: RetryPolicy,
    last_reload: Option<Instant>,
}

impl StashManager {
    /// Load the registry from `base_dir/config.json` and open every
    /// registered stash. Unloadable stashes are skipped with a warning.
    pub fn load(base_dir: &Path) -> Result<Self> {
        Self::load_with_settings(base_dir, Settings::default(), RetryPolicy::default())
    }

    /// Load with explicit timing knobs (tests shrink them).
    pub fn load_with_settings(
        base_dir: &Path,
        settings: Settings,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let config = ConfigStore::load_or_init(base_dir)?;
        let mut manager = Self {
            config,
            stashes: HashMap::new(),
            settings,
            retry,
            last_reload: None,
        };
        manager.open_registered();
        Ok(manager)
    }

    fn open_registered(&mut self) {
        let actor = self.config.config.actor_id.clone();
        let entries: Vec<(String, std::path::PathBuf)> = self
            .config
            .config
            .stashes
            .iter()
            .map(|(name, path)| (name.clone(), path.clone()))
            .collect();
        for (name, path) in entries {
            if self.stashes.contains_key(&name) {
                continue;
            }
            match Stash::load(&name, &path, &actor, None) {
                Ok(stash) => {
                    self.stashes.insert(
                        name,
                        SharedStash::with_settings(stash, self.settings, self.retry),
                    );
                }
                Err(e) => log::warn!("skipping stash '{name}' at {}: {e}", path.display()),
            }
        }
    }

    /// Names of every registered stash, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stashes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Look up a stash by name.
    pub fn get(&self, name: &str) -> Option<SharedStash> {
        self.stashes.get(name).cloned()
    }

    /// Create a new stash and register it.
    pub fn create(
        &mut self,
        name: &str,
        path: &Path,
        provider: Option<Arc<dyn RemoteTransport>>,
        remote: Option<String>,
        description: Option<String>,
    ) -> Result<SharedStash> {
        validate_name(name)?;
        if self.stashes.contains_key(name) {
            return Err(StashError::AlreadyExists(format!("stash '{name}'")));
        }
        let actor = self.config.config.actor_id.clone();
        let stash = Stash::create(name, path, &actor, provider, remote, description)?;
        self.config.register_stash(name, path)?;
        let shared = SharedStash::with_settings(stash, self.settings, self.retry);
        self.stashes.insert(name.to_string(), shared.clone());
        Ok(shared)
    }

    /// Create a stash bound to an existing remote and pull its state (fresh
    /// join happens inside the first sync).
    pub async fn connect(
        &mut self,
        name: &str,
        path: &Path,
        provider: Arc<dyn RemoteTransport>,
        remote: Option<String>,
    ) -> Result<SharedStash> {
        let shared = self.create(name, path, Some(provider), remote, None)?;
        shared.sync().await?;
        Ok(shared)
    }

    /// Unregister a stash, removing its `.stash/` directory (the working
    /// tree is left in place) and optionally the remote replica.
    pub async fn delete(&mut self, name: &str, delete_remote: bool) -> Result<()> {
        let shared = self
            .stashes
            .remove(name)
            .ok_or_else(|| StashError::NotFound(format!("stash '{name}'")))?;

        if delete_remote {
            let provider = { shared.lock().await.provider() };
            if let Some(provider) = provider {
                provider.delete_remote().await?;
            }
        }

        let root = { shared.lock().await.root().to_path_buf() };
        let dir = crate::fsutil::stash_dir(&root);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        self.config.unregister_stash(name)?;
        Ok(())
    }

    /// Sync every stash, collecting per-stash failures instead of stopping
    /// at the first one.
    pub async fn sync_all(&self) -> Vec<(String, Result<SyncOutcome>)> {
        let mut results = Vec::new();
        for name in self.list() {
            if let Some(shared) = self.get(&name) {
                results.push((name, shared.sync().await));
            }
        }
        results
    }

    /// Re-read the registry unless it was reloaded within the last 2 s.
    /// Returns whether a reload actually ran.
    pub fn reload_if_stale(&mut self) -> Result<bool> {
        if let Some(last) = self.last_reload
            && last.elapsed() < RELOAD_THROTTLE
        {
            return Ok(false);
        }
        self.last_reload = Some(Instant::now());

        let fresh = ConfigStore::load_or_init(self.config.base_dir())?;
        self.config = fresh;
        self.stashes
            .retain(|name, _| self.config.config.stashes.contains_key(name));
        self.open_registered();
        Ok(true)
    }

    /// The global config store.
    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    /// Timing knobs handed to every opened stash.
    pub fn settings(&self) -> Settings {
        self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(base: &Path) -> StashManager {
        StashManager::load_with_settings(base, Settings::fast(), RetryPolicy::fast()).unwrap()
    }

    #[tokio::test]
    async fn test_create_list_get() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = manager(&dir.path().join("base"));
        mgr.create("notes", &dir.path().join("notes"), None, None, None)
            .unwrap();
        mgr.create("work", &dir.path().join("work"), None, None, None)
            .unwrap();

        assert_eq!(mgr.list(), vec!["notes".to_string(), "work".to_string()]);
        assert!(mgr.get("notes").is_some());
        assert!(mgr.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = manager(&dir.path().join("base"));
        mgr.create("notes", &dir.path().join("a"), None, None, None)
            .unwrap();
        assert!(matches!(
            mgr.create("notes", &dir.path().join("b"), None, None, None),
            Err(StashError::AlreadyExists(_))
        ));
        assert!(matches!(
            mgr.create("bad/name", &dir.path().join("c"), None, None, None),
            Err(StashError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_registry_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base");
        {
            let mut mgr = manager(&base);
            let shared = mgr
                .create("notes", &dir.path().join("notes"), None, None, None)
                .unwrap();
            shared.write("a.md", "hello").await.unwrap();
            shared.flush().await.unwrap();
        }

        let mgr = manager(&base);
        let shared = mgr.get("notes").expect("registry lost");
        assert_eq!(shared.read("a.md").await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_delete_removes_stash_dir() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("notes");
        let mut mgr = manager(&dir.path().join("base"));
        mgr.create("notes", &root, None, None, None).unwrap();
        assert!(root.join(".stash").exists());

        mgr.delete("notes", false).await.unwrap();
        assert!(!root.join(".stash").exists());
        assert!(mgr.get("notes").is_none());
        assert!(matches!(
            mgr.delete("notes", false).await,
            Err(StashError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reload_throttled() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = manager(&dir.path().join("base"));
        assert!(mgr.reload_if_stale().unwrap());
        // Immediately after, the throttle suppresses the reload.
        assert!(!mgr.reload_if_stale().unwrap());
    }
}
