//! Daemon host: the single long-lived process supervising all stashes.
//!
//! For every registered stash the daemon starts a reconciler (with an
//! initial scan), runs a periodic safety-net sync ticker, and keeps a PID
//! file under the base directory. SIGTERM/SIGINT (delivered through the
//! shutdown handle) close the reconcilers and remove the PID file. The RPC
//! surface that external tool adapters talk to lives outside the core.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::error::Result;
use crate::fsutil::atomic_write;
use crate::manager::StashManager;
use crate::reconciler::Reconciler;

const PID_FILE: &str = "daemon.pid";

/// Run the daemon on the current runtime until `shutdown` is notified.
pub async fn run_with_shutdown(manager: StashManager, shutdown: Arc<Notify>) -> Result<()> {
    let base_dir = manager.config().base_dir().to_path_buf();
    write_pid_file(&base_dir)?;
    log::info!(
        "daemon start pid={} base={}",
        std::process::id(),
        base_dir.display()
    );

    let mut reconcilers: Vec<(String, Reconciler)> = Vec::new();
    for name in manager.list() {
        let Some(shared) = manager.get(&name) else {
            continue;
        };
        match Reconciler::start(shared).await {
            Ok(reconciler) => {
                if let Err(e) = reconciler.scan().await {
                    log::error!("initial scan of '{name}' failed: {e}");
                }
                if let Err(e) = reconciler.flush().await {
                    log::error!("initial flush of '{name}' failed: {e}");
                }
                reconcilers.push((name, reconciler));
            }
            Err(e) => log::error!("starting reconciler for '{name}' failed: {e}"),
        }
    }

    let mut ticker = tokio::time::interval(manager.settings().sync_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; skip it so startup isn't a sync storm.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            _ = ticker.tick() => {
                for (name, result) in manager.sync_all().await {
                    if let Err(e) = result {
                        log::warn!("periodic sync of '{name}' failed: {e}");
                    }
                }
                for (name, reconciler) in &reconcilers {
                    if let Err(e) = reconciler.flush().await {
                        log::warn!("periodic flush of '{name}' failed: {e}");
                    }
                }
            }
        }
    }

    log::info!("daemon shutting down");
    for (_, reconciler) in reconcilers {
        reconciler.close().await;
    }
    remove_pid_file(&base_dir);
    Ok(())
}

/// Write `base_dir/daemon.pid` (owner-only).
fn write_pid_file(base_dir: &Path) -> Result<()> {
    atomic_write(
        &pid_path(base_dir),
        format!("{}\n", std::process::id()).as_bytes(),
    )
}

fn remove_pid_file(base_dir: &Path) {
    if let Err(e) = fs::remove_file(pid_path(base_dir)) {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("removing pid file failed: {e}");
        }
    }
}

/// Location of the daemon PID file for a base directory.
pub fn pid_path(base_dir: &Path) -> PathBuf {
    base_dir.join(PID_FILE)
}

/// Read the PID recorded for `base_dir`, if a daemon left one.
pub fn read_pid(base_dir: &Path) -> Option<u32> {
    fs::read_to_string(pid_path(base_dir))
        .ok()?
        .trim()
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use crate::sync::retry::RetryPolicy;

    #[tokio::test]
    async fn test_pid_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base");
        let manager =
            StashManager::load_with_settings(&base, Settings::fast(), RetryPolicy::fast()).unwrap();

        let shutdown = Arc::new(Notify::new());
        let task = tokio::spawn(run_with_shutdown(manager, Arc::clone(&shutdown)));

        // Wait for the pid file to appear.
        for _ in 0..100 {
            if read_pid(&base).is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(read_pid(&base), Some(std::process::id()));

        shutdown.notify_waiters();
        task.await.unwrap().unwrap();
        assert_eq!(read_pid(&base), None);
    }
}
