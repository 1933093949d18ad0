//! services/api/src/sweeper.rs
//!
//! Background task that drops call sessions nobody has touched for a while,
//! so abandoned calls do not accumulate in the session store.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use waste_ivr_core::ports::{PortError, PortResult, SessionStore};

/// Removes sessions idle for longer than `ttl`.
pub async fn sweep_once(sessions: &dyn SessionStore, ttl: Duration) -> PortResult<usize> {
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|e| PortError::Unexpected(format!("Session TTL out of range: {}", e)))?;
    let cutoff = Utc::now()
        .checked_sub_signed(ttl)
        .ok_or_else(|| PortError::Unexpected("Session TTL reaches past the earliest date".into()))?;
    sessions.purge_idle(cutoff).await
}

/// Runs [`sweep_once`] every `interval` until `shutdown` is cancelled.
pub fn spawn_session_sweeper(
    sessions: Arc<dyn SessionStore>,
    ttl: Duration,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "Session sweeper started (ttl {}s, every {}s)",
            ttl.as_secs(),
            interval.as_secs()
        );
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Session sweeper stopped.");
                    return;
                }
                _ = ticker.tick() => {
                    match sweep_once(sessions.as_ref(), ttl).await {
                        Ok(0) => debug!("No idle sessions to purge"),
                        Ok(purged) => info!("Purged {} idle call sessions", purged),
                        Err(e) => warn!("Session sweep failed: {:?}", e),
                    }
                }
            }
        }
    })
}
