//! Timing knobs for the reconciler, sync scheduler, and daemon.
//!
//! Defaults match production behavior; tests shrink them so integration
//! scenarios settle in milliseconds instead of seconds.

use std::time::Duration;

/// Tunable intervals shared by a stash, its reconciler, and the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    /// Delay between a local write and the triggered background sync.
    pub sync_debounce: Duration,

    /// Period of the daemon's safety-net sync ticker.
    pub sync_interval: Duration,

    /// How long an `unlink` waits for a matching `add` before it becomes a
    /// real delete (rename detection window).
    pub rename_window: Duration,

    /// A changed file must be quiescent this long before it is read.
    pub stabilize_quiet: Duration,

    /// Poll interval while waiting for a changed file to go quiescent.
    pub stabilize_poll: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sync_debounce: Duration::from_secs(2),
            sync_interval: Duration::from_secs(30),
            rename_window: Duration::from_millis(500),
            stabilize_quiet: Duration::from_millis(200),
            stabilize_poll: Duration::from_millis(50),
        }
    }
}

impl Settings {
    /// Settings scaled down for tests so scenarios settle quickly.
    pub fn fast() -> Self {
        Self {
            sync_debounce: Duration::from_millis(50),
            sync_interval: Duration::from_millis(500),
            rename_window: Duration::from_millis(120),
            stabilize_quiet: Duration::from_millis(40),
            stabilize_poll: Duration::from_millis(10),
        }
    }
}
