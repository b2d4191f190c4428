//! Periodic garbage collection of stale connections.

use std::time::Duration;

use crate::manager::ConnectionManager;

/// Spawn the background reaper task.
///
/// Every `interval`, each session is swept: live connections idle beyond
/// the liveness timeout and disconnected ones past the grace window are
/// removed (see [`ConnectionManager::cleanup_inactive`]). The task runs
/// until the process exits; aborting the returned handle is the shutdown
/// path.
pub fn spawn(manager: ConnectionManager, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The immediate first tick would sweep an empty registry.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            manager.cleanup_inactive().await;
        }
    })
}
