//! Scheduled cleanup of expired session records.

use crate::db::Database;
use crate::session::unix_now;
use std::time::Duration;
use tracing::{error, info};

/// Interval between cleanup runs.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60); // 1 hour

/// Run all cleanup tasks once.
///
/// The cache evicts by TTL on its own; this sweep only squares up the
/// durable store, marking wall-clock-expired rows ended so fingerprint
/// recovery and per-user limits never count them as live.
pub async fn run_cleanup(db: &Database) {
    match db.sessions().sweep_expired(unix_now()).await {
        Ok(count) if count > 0 => info!("Marked {} expired sessions as ended", count),
        Ok(_) => {}
        Err(e) => error!("Failed to sweep expired sessions: {}", e),
    }
}

/// Spawn a background task that runs cleanup periodically.
/// Returns a handle that can be used to abort the task.
pub fn spawn_cleanup_scheduler(db: Database) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);

        loop {
            interval.tick().await;
            run_cleanup(&db).await;
        }
    })
}
