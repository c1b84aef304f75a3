//! Single reconciliation pass over dedicated nodes.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use capacity_events::NodeLifecycleState;
use capacity_id::{NodeId, WorkspaceId};
use capacity_reconcile::{RetryTracker, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW};
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::collaborators::HypervisorStatus;
use crate::coordinator::AllocationCoordinator;
use crate::error::CapacityResult;
use crate::locks::KeyedLocks;
use crate::model::DedicatedNode;
use crate::registry::NodeRegistry;

/// Counters for one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub pending_examined: u32,
    pub activated: u32,
    pub removed: u32,
    pub decommissions_finished: u32,
    pub orphans_reclaimed: u32,
    pub failed: u32,
}

impl ReconcileStats {
    pub fn changed_anything(&self) -> bool {
        self.activated + self.removed + self.decommissions_finished + self.orphans_reclaimed > 0
    }
}

enum PendingOutcome {
    Activated,
    Removed,
    Left,
}

pub struct Reconciler {
    registry: NodeRegistry,
    coordinator: AllocationCoordinator,
    locks: Arc<KeyedLocks<WorkspaceId>>,
    pending_grace: Duration,
    retries: Mutex<RetryTracker<NodeId>>,
}

impl Reconciler {
    pub fn new(
        registry: NodeRegistry,
        coordinator: AllocationCoordinator,
        locks: Arc<KeyedLocks<WorkspaceId>>,
        pending_grace: Duration,
    ) -> Self {
        Self {
            registry,
            coordinator,
            locks,
            pending_grace,
            retries: Mutex::new(RetryTracker::new(DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW)),
        }
    }

    /// Runs one pass. Per-node failures are counted, not returned; only a
    /// failure to list nodes aborts the pass.
    #[instrument(skip(self))]
    pub async fn reconcile_once(&self) -> CapacityResult<ReconcileStats> {
        let mut stats = ReconcileStats::default();
        let now = Utc::now();

        let pending = self
            .registry
            .list_nodes_in_states(&[
                NodeLifecycleState::PendingCreation,
                NodeLifecycleState::Provisioning,
            ])
            .await?;
        for node in pending {
            if node.idle_for(now) < self.pending_grace {
                continue;
            }
            stats.pending_examined += 1;
            let node_id = node.id;
            match self.reconcile_pending(node).await {
                Ok(PendingOutcome::Activated) => stats.activated += 1,
                Ok(PendingOutcome::Removed) => stats.removed += 1,
                Ok(PendingOutcome::Left) => {}
                Err(e) => {
                    warn!(node_id = %node_id, error = %e, "Failed to reconcile pending node");
                    stats.failed += 1;
                }
            }
        }

        let decommissioning = self
            .registry
            .list_nodes_in_states(&[NodeLifecycleState::Decommissioning])
            .await?;
        for node in decommissioning {
            let _guard = self.locks.lock(&node.workspace_id).await;
            match self.registry.decommission(node.id).await {
                Ok(_) => stats.decommissions_finished += 1,
                Err(e) => {
                    warn!(node_id = %node.id, error = %e, "Failed to finish decommission");
                    stats.failed += 1;
                }
            }
        }

        let workspaces: BTreeSet<WorkspaceId> = self
            .registry
            .list_nodes_in_states(&[NodeLifecycleState::Active])
            .await?
            .into_iter()
            .map(|n| n.workspace_id)
            .collect();
        for workspace_id in workspaces {
            match self
                .coordinator
                .reclaim_orphans(workspace_id, self.pending_grace)
                .await
            {
                Ok(n) => stats.orphans_reclaimed += n as u32,
                Err(e) => {
                    warn!(workspace_id = %workspace_id, error = %e, "Failed to reclaim orphans");
                    stats.failed += 1;
                }
            }
        }

        self.retries.lock().await.prune();

        debug!(
            pending_examined = stats.pending_examined,
            activated = stats.activated,
            removed = stats.removed,
            decommissions_finished = stats.decommissions_finished,
            orphans_reclaimed = stats.orphans_reclaimed,
            failed = stats.failed,
            "Reconciliation pass complete"
        );
        Ok(stats)
    }

    async fn reconcile_pending(&self, node: DedicatedNode) -> CapacityResult<PendingOutcome> {
        let _guard = self.locks.lock(&node.workspace_id).await;

        // Re-read under the workspace lock; a plan change may have moved it on.
        let node = self.registry.get_node(node.id).await?;
        if !node.state.is_pending() {
            return Ok(PendingOutcome::Left);
        }

        let Some(external_id) = node.external_id.clone() else {
            info!(node_id = %node.id, "Removing node that was never bound");
            self.registry.mark_deleted(node.id).await?;
            return Ok(PendingOutcome::Removed);
        };

        match self.registry.probe(&external_id).await {
            HypervisorStatus::Running => {
                info!(node_id = %node.id, external_id = %external_id, "Activating stuck node");
                self.registry.mark_active(node.id).await?;
                self.retries.lock().await.clear(&node.id);
                Ok(PendingOutcome::Activated)
            }
            status if status.is_terminal_failure() => {
                info!(node_id = %node.id, status = %status, "Removing failed node");
                self.registry.discard(node.id).await?;
                self.retries.lock().await.clear(&node.id);
                Ok(PendingOutcome::Removed)
            }
            status => {
                let exhausted = self.retries.lock().await.record_failure(&node.id);
                if exhausted {
                    warn!(
                        node_id = %node.id,
                        status = %status,
                        "Node never came up; removing it"
                    );
                    self.registry.discard(node.id).await?;
                    self.retries.lock().await.clear(&node.id);
                    return Ok(PendingOutcome::Removed);
                }
                debug!(node_id = %node.id, status = %status, "Leaving pending node");
                Ok(PendingOutcome::Left)
            }
        }
    }
}
