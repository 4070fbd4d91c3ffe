//! Proactive background credential refresh
//!
//! Spawns a periodic task that refreshes the stored credential before it
//! expires, so most outbound calls never wait on the issuer. The task goes
//! through `RefreshCoordinator` like any other caller, so a tick that lands
//! during a request-driven refresh joins it instead of starting another.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::coordinator::RefreshCoordinator;
use crate::error::RefreshError;

/// Spawn a background task that proactively refreshes an expiring credential.
///
/// Runs every `interval` and refreshes when the stored credential expires
/// within `threshold`. Failures are logged; the next tick tries again.
///
/// Returns a `JoinHandle` for the spawned task.
pub fn spawn_refresh_task(
    coordinator: RefreshCoordinator,
    interval: Duration,
    threshold: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick is immediate; the session was just restored
        ticker.tick().await;

        loop {
            ticker.tick().await;
            refresh_cycle(&coordinator, threshold).await;
        }
    })
}

/// Run one cycle: refresh the stored credential if it expires within
/// `threshold`. Returns whether a refresh was attempted.
pub async fn refresh_cycle(coordinator: &RefreshCoordinator, threshold: Duration) -> bool {
    let Some(current) = coordinator.control().store().get() else {
        return false;
    };
    if !current.is_expired(threshold) {
        return false;
    }

    debug!(
        fingerprint = current.fingerprint(),
        expires_at = current.expires_at,
        "credential expiring within threshold, refreshing"
    );

    match coordinator.ensure_fresh(Some(&current)).await {
        Ok(credential) => {
            info!(
                fingerprint = credential.fingerprint(),
                "background credential refresh succeeded"
            );
        }
        Err(RefreshError::Denied(reason)) => {
            warn!(error = %reason, "refresh secret rejected during background refresh");
        }
        Err(RefreshError::NoCredential) => {
            debug!("session ended before background refresh");
        }
        Err(e) => {
            warn!(error = %e, "background refresh failed (transient), will retry next cycle");
        }
    }
    true
}
