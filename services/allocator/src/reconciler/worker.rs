//! Reconciliation background worker.
//!
//! Runs the reconciler on a periodic interval until shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, instrument};

use super::pass::Reconciler;

pub struct ReconcileWorker {
    reconciler: Arc<Reconciler>,
    interval: Duration,
}

impl ReconcileWorker {
    pub fn new(reconciler: Arc<Reconciler>, interval: Duration) -> Self {
        Self {
            reconciler,
            interval,
        }
    }

    /// Runs until `shutdown` turns true.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting reconcile worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        // First tick completes immediately; wait a full interval instead.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.reconciler.reconcile_once().await {
                        Ok(stats) if stats.changed_anything() => {
                            info!(
                                activated = stats.activated,
                                removed = stats.removed,
                                decommissions_finished = stats.decommissions_finished,
                                orphans_reclaimed = stats.orphans_reclaimed,
                                failed = stats.failed,
                                "Reconciliation made changes"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Reconciliation pass failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Reconcile worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}
