//! Stash daemon entrypoint.
//!
//! Loads the stash registry from the base directory and runs the daemon
//! host until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::Notify;

use stash_core::config::ConfigStore;
use stash_core::daemon;
use stash_core::StashManager;

#[derive(Parser, Debug)]
#[command(name = "stashd", version, about = "Background sync daemon for Stash folders")]
struct Args {
    /// Base directory holding config.json and the daemon pid file.
    /// Defaults to ~/.stash.
    #[arg(long)]
    base_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let Some(base_dir) = args.base_dir.or_else(ConfigStore::default_base_dir) else {
        eprintln!("stashd: could not determine a base directory; pass --base-dir");
        return ExitCode::FAILURE;
    };

    let manager = match StashManager::load(&base_dir) {
        Ok(manager) => manager,
        Err(e) => {
            eprintln!("stashd: failed to load {}: {e}", base_dir.display());
            return ExitCode::FAILURE;
        }
    };

    let shutdown = Arc::new(Notify::new());
    spawn_signal_listener(Arc::clone(&shutdown));

    match daemon::run_with_shutdown(manager, shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("stashd: {e}");
            ExitCode::FAILURE
        }
    }
}

fn spawn_signal_listener(shutdown: Arc<Notify>) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    log::error!("installing SIGTERM handler failed: {e}");
                    let _ = ctrl_c.await;
                    shutdown.notify_waiters();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        shutdown.notify_waiters();
    });
}
