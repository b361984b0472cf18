//! Global configuration registry.
//!
//! One `config.json` per base directory holds the site-local actor id, an
//! opaque provider section (credentials and provider settings are managed by
//! external tooling), and the registry of stash names to absolute paths.
//! The file is rewritten atomically at 0o600 and unknown fields survive the
//! rewrite untouched.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StashError};
use crate::fsutil::{atomic_write, ensure_dir};
use crate::stash::{generate_actor_id, validate_name};

const CONFIG_FILE: &str = "config.json";

/// Contents of `config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalConfig {
    /// 64-hex CRDT actor identifier shared by every stash of this site.
    pub actor_id: String,

    /// Opaque provider configuration; owned by external tooling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub providers: Option<serde_json::Value>,

    /// Registry of stash name → absolute working-tree path.
    pub stashes: IndexMap<String, PathBuf>,

    /// Fields written by other tooling; preserved verbatim on rewrite.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Loader/saver for the global config of one base directory.
pub struct ConfigStore {
    base_dir: PathBuf,
    /// The in-memory config; mutate and then [`ConfigStore::save`].
    pub config: GlobalConfig,
}

impl ConfigStore {
    /// Load `base_dir/config.json`, initializing it (with a fresh actor id)
    /// when absent.
    pub fn load_or_init(base_dir: &Path) -> Result<Self> {
        ensure_dir(base_dir)?;
        let path = base_dir.join(CONFIG_FILE);
        let config = match std::fs::read(&path) {
            Ok(bytes) => {
                let mut config: GlobalConfig = serde_json::from_slice(&bytes)?;
                if config.actor_id.is_empty() {
                    config.actor_id = generate_actor_id();
                }
                config
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => GlobalConfig {
                actor_id: generate_actor_id(),
                ..Default::default()
            },
            Err(e) => return Err(e.into()),
        };
        let store = Self {
            base_dir: base_dir.to_path_buf(),
            config,
        };
        store.save()?;
        Ok(store)
    }

    /// Persist atomically at 0o600.
    pub fn save(&self) -> Result<()> {
        atomic_write(
            &self.base_dir.join(CONFIG_FILE),
            &serde_json::to_vec_pretty(&self.config)?,
        )
    }

    /// Base directory this config lives in.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Register a stash, failing on duplicate names.
    pub fn register_stash(&mut self, name: &str, path: &Path) -> Result<()> {
        validate_name(name)?;
        if self.config.stashes.contains_key(name) {
            return Err(StashError::AlreadyExists(format!("stash '{name}'")));
        }
        self.config.stashes.insert(name.to_string(), path.to_path_buf());
        self.save()
    }

    /// Remove a stash from the registry.
    pub fn unregister_stash(&mut self, name: &str) -> Result<()> {
        if self.config.stashes.shift_remove(name).is_none() {
            return Err(StashError::NotFound(format!("stash '{name}'")));
        }
        self.save()
    }

    /// The default base directory (`~/.stash`), when a home directory exists.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn default_base_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".stash"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_generates_actor_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load_or_init(dir.path()).unwrap();
        assert_eq!(store.config.actor_id.len(), 64);

        // Reload keeps the same identity.
        let reloaded = ConfigStore::load_or_init(dir.path()).unwrap();
        assert_eq!(reloaded.config.actor_id, store.config.actor_id);
    }

    #[test]
    fn test_register_and_unregister() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ConfigStore::load_or_init(dir.path()).unwrap();
        store.register_stash("notes", Path::new("/tmp/notes")).unwrap();
        assert!(matches!(
            store.register_stash("notes", Path::new("/elsewhere")),
            Err(StashError::AlreadyExists(_))
        ));

        let reloaded = ConfigStore::load_or_init(dir.path()).unwrap();
        assert_eq!(
            reloaded.config.stashes.get("notes"),
            Some(&PathBuf::from("/tmp/notes"))
        );

        store.unregister_stash("notes").unwrap();
        assert!(matches!(
            store.unregister_stash("notes"),
            Err(StashError::NotFound(_))
        ));
    }

    #[test]
    fn test_opaque_fields_survive_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"actorId":"", "providers": {"github": {"token": "ref"}}, "stashes": {}}"#,
        )
        .unwrap();

        let store = ConfigStore::load_or_init(dir.path()).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("github"));
        assert!(!store.config.actor_id.is_empty());
    }
}
