//! Periodic catalog refresh.
//!
//! Cross-instance synchronization is pull-based: every instance re-reads the
//! active list on an interval and loads any new or changed versions. Errors
//! are logged and retried on the next tick; they never fail in-flight
//! requests.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::SkillCatalog;

pub fn spawn_refresh_task(
    catalog: Arc<SkillCatalog>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The boot pass already loaded the catalog; skip the immediate tick.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match catalog.refresh().await {
                        Ok(0) => debug!("catalog refresh: no changes"),
                        Ok(n) => info!("catalog refresh: {} skills changed", n),
                        Err(e) => error!("catalog refresh failed: {}", e),
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("catalog refresh task stopped");
                    return;
                }
            }
        }
    })
}
