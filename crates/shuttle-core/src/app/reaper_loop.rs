//! ReaperLoop - releases claims whose worker went quiet.
//!
//! Every `interval` the loop asks the coordinator to release working tasks
//! claimed longer than `threshold` ago. A released task either returns to
//! `ready` or, past the reclaim ceiling, lands on `failed`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::app::Coordinator;

/// Handle to a running reaper.
/// - dropping the handle without `shutdown_and_join` leaves the loop running
///   until the runtime stops
pub struct ReaperLoop {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReaperLoop {
    /// Spawn with the coordinator's configured interval and threshold.
    pub fn spawn(coordinator: Arc<Coordinator>) -> Self {
        let interval = coordinator.config().reaper_interval();
        let threshold = coordinator.config().liveness_threshold();
        Self::spawn_with(coordinator, interval, threshold)
    }

    pub fn spawn_with(coordinator: Arc<Coordinator>, interval: Duration, threshold: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            reaper_loop(coordinator, interval, threshold, &mut shutdown_rx).await;
        });
        Self { shutdown_tx, join }
    }

    pub fn request_shutdown(&self) {
        // receiver may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        if let Err(e) = self.join.await {
            warn!(error = %e, "reaper loop ended abnormally");
        }
    }
}

async fn reaper_loop(
    coordinator: Arc<Coordinator>,
    interval: Duration,
    threshold: Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    info!(
        interval_ms = interval.as_millis() as u64,
        threshold_ms = threshold.as_millis() as u64,
        "reaper started"
    );
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        match coordinator.reclaim_stale(Some(threshold)).await {
            Ok(released) if released.is_empty() => debug!("reaper pass: nothing stale"),
            Ok(released) => info!(count = released.len(), tasks = ?released, "reaper released stale claims"),
            // corrupt or quarantined boards are reported every pass until repaired
            Err(err) => warn!(error = %err, kind = ?err.kind(), "reaper pass failed"),
        }
    }
    info!("reaper stopped");
}
