//! Background cleanup: expired rendezvous registrations and idle rate buckets.

use crate::rate_limit::RateLimiter;
use crate::storage::RelayStorage;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;

pub fn spawn_cleanup_task(
    storage: RelayStorage,
    limiter: RateLimiter,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(every);
        loop {
            interval.tick().await;
            match run_cleanup(&storage, chrono::Utc::now().timestamp()) {
                Ok(0) => {}
                Ok(pruned) => tracing::debug!("Pruned {} expired registrations", pruned),
                Err(e) => tracing::error!("Cleanup error: {}", e),
            }
            limiter.prune();
        }
    })
}

fn run_cleanup(storage: &RelayStorage, now: i64) -> Result<usize, String> {
    storage.prune_expired(now).map_err(|e| e.to_string())
}
