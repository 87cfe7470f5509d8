//! Periodic removal of sessions past their maximum age

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::registry::SessionRegistry;

/// Sweep `registry` every reap interval until `shutdown` fires
///
/// Uses [`SessionRegistry::remove`], the same teardown path as an explicit
/// disconnect.
pub fn spawn_reaper(registry: Arc<SessionRegistry>, shutdown: CancellationToken) -> JoinHandle<()> {
    let interval = registry.policy().reap_interval();
    let max_age = registry.policy().max_session_age();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Session reaper stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let reaped = registry.reap_expired(max_age).await;
                    if !reaped.is_empty() {
                        info!(count = reaped.len(), "Reaped expired sessions");
                    }
                }
            }
        }
    })
}
