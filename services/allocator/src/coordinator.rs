//! Allocation coordinator.
//!
//! The only component that creates or changes a workspace's allocation.
//! Every operation runs inside the workspace's critical section, so plan
//! changes, reservations and teardown of one workspace never interleave.
//!
//! Plan changes follow expand before contract:
//!
//! 1. provision every node the new plan needs and wait until it is active
//! 2. commit the new allocation in a single versioned write
//! 3. only then decommission nodes the new allocation no longer references
//!
//! A failure before step 2 leaves the allocation at its previous version.
//! Cancellation is observed up to step 2; the contract phase always runs to
//! completion.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use capacity_events::{NodeEventType, NodeLifecycleState};
use capacity_id::{NodeId, WorkspaceId};
use capacity_reconcile::{select_for_decommission, DecommissionPriority, ResizeStrategy};
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::catalog::{Plan, PlanCatalog, PlanKind};
use crate::error::{CapacityError, CapacityResult};
use crate::ledger::QuotaLedger;
use crate::locks::KeyedLocks;
use crate::model::{
    AllocationCapacity, DedicatedNode, NodeUsageEntry, SharedQuota, WorkspaceAllocation,
    WorkspaceUsage,
};
use crate::observer::UsageObserver;
use crate::recorder::EventRecorder;
use crate::registry::NodeRegistry;
use crate::store::{Store, StoreError};

type Cancel<'a> = Option<&'a watch::Receiver<bool>>;

fn is_cancelled(cancel: Cancel<'_>) -> bool {
    cancel.map(|rx| *rx.borrow()).unwrap_or(false)
}

#[derive(Clone)]
pub struct AllocationCoordinator {
    store: Arc<dyn Store>,
    catalog: Arc<PlanCatalog>,
    ledger: QuotaLedger,
    registry: NodeRegistry,
    observer: UsageObserver,
    recorder: EventRecorder,
    locks: Arc<KeyedLocks<WorkspaceId>>,
    strategy: ResizeStrategy,
}

impl AllocationCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        catalog: Arc<PlanCatalog>,
        ledger: QuotaLedger,
        registry: NodeRegistry,
        observer: UsageObserver,
        recorder: EventRecorder,
        locks: Arc<KeyedLocks<WorkspaceId>>,
        strategy: ResizeStrategy,
    ) -> Self {
        Self {
            store,
            catalog,
            ledger,
            registry,
            observer,
            recorder,
            locks,
            strategy,
        }
    }

    // =========================================================================
    // Public operations
    // =========================================================================

    /// Binds the workspace to `plan_id`, creating or changing its allocation.
    ///
    /// Allocating the plan a workspace already has returns the existing
    /// allocation unchanged.
    #[instrument(skip(self), fields(workspace_id = %workspace_id))]
    pub async fn allocate(
        &self,
        workspace_id: WorkspaceId,
        plan_id: &str,
    ) -> CapacityResult<WorkspaceAllocation> {
        let plan = self.catalog.get_plan(plan_id)?;
        let _guard = self.locks.lock(&workspace_id).await;

        match self.store.get_allocation(workspace_id).await? {
            Some(existing) if existing.plan_id == plan.id => Ok(existing),
            Some(existing) => {
                ensure_purchasable(&plan)?;
                self.change_plan_locked(existing, &plan, None).await
            }
            None => {
                ensure_purchasable(&plan)?;
                let allocation = match plan.kind {
                    PlanKind::Shared => self.ledger.ensure_shared_locked(workspace_id, &plan).await?,
                    PlanKind::Dedicated => {
                        self.converge_dedicated(workspace_id, None, &plan, None)
                            .await?
                    }
                };
                self.recorder
                    .record_workspace(
                        workspace_id,
                        NodeEventType::PlanChanged,
                        format!("none -> {}", plan.id),
                    )
                    .await;
                Ok(allocation)
            }
        }
    }

    /// Moves the workspace to another plan.
    pub async fn change_plan(
        &self,
        workspace_id: WorkspaceId,
        new_plan_id: &str,
    ) -> CapacityResult<WorkspaceAllocation> {
        self.change_plan_inner(workspace_id, new_plan_id, None)
            .await
    }

    /// Like [`Self::change_plan`], giving up with `Cancelled` if `cancel`
    /// turns true before the new allocation is committed.
    pub async fn change_plan_with_cancel(
        &self,
        workspace_id: WorkspaceId,
        new_plan_id: &str,
        cancel: watch::Receiver<bool>,
    ) -> CapacityResult<WorkspaceAllocation> {
        self.change_plan_inner(workspace_id, new_plan_id, Some(&cancel))
            .await
    }

    /// The workspace's allocation, created on first read as the baseline
    /// shared plan.
    pub async fn get_allocation(
        &self,
        workspace_id: WorkspaceId,
    ) -> CapacityResult<WorkspaceAllocation> {
        if let Some(existing) = self.store.get_allocation(workspace_id).await? {
            return Ok(existing);
        }

        let _guard = self.locks.lock(&workspace_id).await;
        self.ledger
            .ensure_shared_locked(workspace_id, self.catalog.baseline_plan())
            .await
    }

    /// Tears the workspace's capacity down: every dedicated node is
    /// decommissioned and the allocation returns to the baseline shared
    /// plan with nothing in use.
    #[instrument(skip(self), fields(workspace_id = %workspace_id))]
    pub async fn release_workspace(
        &self,
        workspace_id: WorkspaceId,
    ) -> CapacityResult<WorkspaceAllocation> {
        let _guard = self.locks.lock(&workspace_id).await;
        let baseline = self.catalog.baseline_plan().clone();

        let Some(existing) = self.store.get_allocation(workspace_id).await? else {
            return self.ledger.ensure_shared_locked(workspace_id, &baseline).await;
        };
        let from_plan = existing.plan_id.clone();

        let released = match existing.plan_kind() {
            PlanKind::Dedicated => self.swap_to_shared(existing, &baseline).await?,
            PlanKind::Shared => {
                let next = existing.with_capacity(
                    &baseline.id,
                    AllocationCapacity::Shared {
                        quota: SharedQuota::from_envelope(&baseline.resources),
                    },
                );
                self.store.update_allocation(&next).await?
            }
        };

        // Nodes left behind by interrupted plan changes.
        for node in self.registry.list_nodes_for_workspace(workspace_id).await? {
            self.discard_quietly(node.id).await;
        }

        info!(from_plan = %from_plan, "Released workspace capacity");
        self.recorder
            .record_workspace(
                workspace_id,
                NodeEventType::PlanChanged,
                format!("{from_plan} -> {} (released)", baseline.id),
            )
            .await;

        Ok(released)
    }

    /// Capacity and consumption of a workspace.
    pub async fn workspace_usage(&self, workspace_id: WorkspaceId) -> CapacityResult<WorkspaceUsage> {
        let allocation = self.get_allocation(workspace_id).await?;

        let node_ids = match &allocation.capacity {
            AllocationCapacity::Shared { quota } => {
                return Ok(WorkspaceUsage::Shared {
                    workspace_id,
                    plan_id: allocation.plan_id.clone(),
                    quota: *quota,
                });
            }
            AllocationCapacity::Dedicated { node_ids } => node_ids.clone(),
        };

        let mut nodes = Vec::with_capacity(node_ids.len());
        let mut active_nodes = 0;
        let (mut total_cpu_cores, mut total_memory_gb, mut total_storage_gb) = (0i64, 0i64, 0i64);

        for node_id in node_ids {
            let node = self.registry.get_node(node_id).await?;
            if node.state.is_active() {
                active_nodes += 1;
            }
            if let Ok(plan) = self.catalog.get_plan(&node.plan_id) {
                total_cpu_cores += i64::from(plan.resources.cpu_cores);
                total_memory_gb += i64::from(plan.resources.memory_gb);
                total_storage_gb += i64::from(plan.resources.storage_gb);
            }

            let (usage, unavailable) = match self.observer.get_usage(node_id).await {
                Ok(usage) => (Some(usage), None),
                Err(e) => (None, Some(e.to_string())),
            };
            nodes.push(NodeUsageEntry {
                node_id,
                state: node.state,
                usage,
                unavailable,
            });
        }

        Ok(WorkspaceUsage::Dedicated {
            workspace_id,
            plan_id: allocation.plan_id,
            total_nodes: nodes.len(),
            active_nodes,
            total_cpu_cores,
            total_memory_gb,
            total_storage_gb,
            nodes,
        })
    }

    /// Decommissions active nodes of the workspace that no allocation
    /// references and that have been idle for at least `grace`.
    pub async fn reclaim_orphans(
        &self,
        workspace_id: WorkspaceId,
        grace: Duration,
    ) -> CapacityResult<usize> {
        let _guard = self.locks.lock(&workspace_id).await;

        let referenced: HashSet<NodeId> = self
            .store
            .get_allocation(workspace_id)
            .await?
            .map(|a| a.dedicated_node_ids().iter().copied().collect())
            .unwrap_or_default();

        let now = Utc::now();
        let mut reclaimed = 0;
        for node in self.registry.list_nodes_for_workspace(workspace_id).await? {
            if !node.state.is_active() || referenced.contains(&node.id) || node.idle_for(now) < grace {
                continue;
            }
            info!(node_id = %node.id, "Reclaiming unreferenced node");
            match self.registry.decommission(node.id).await {
                Ok(_) => reclaimed += 1,
                Err(e) => warn!(node_id = %node.id, error = %e, "Failed to reclaim node"),
            }
        }
        Ok(reclaimed)
    }

    // =========================================================================
    // Plan changes
    // =========================================================================

    #[instrument(skip(self, cancel), fields(workspace_id = %workspace_id))]
    async fn change_plan_inner(
        &self,
        workspace_id: WorkspaceId,
        new_plan_id: &str,
        cancel: Cancel<'_>,
    ) -> CapacityResult<WorkspaceAllocation> {
        let plan = self.catalog.get_plan(new_plan_id)?;
        let _guard = self.locks.lock(&workspace_id).await;

        let existing = self
            .ledger
            .ensure_shared_locked(workspace_id, self.catalog.baseline_plan())
            .await?;
        if existing.plan_id == plan.id {
            return Ok(existing);
        }

        ensure_purchasable(&plan)?;
        self.change_plan_locked(existing, &plan, cancel).await
    }

    async fn change_plan_locked(
        &self,
        existing: WorkspaceAllocation,
        plan: &Plan,
        cancel: Cancel<'_>,
    ) -> CapacityResult<WorkspaceAllocation> {
        let workspace_id = existing.workspace_id;
        if is_cancelled(cancel) {
            return Err(CapacityError::Cancelled(workspace_id));
        }

        let from_plan = existing.plan_id.clone();
        let from_kind = existing.plan_kind();

        let changed = match (from_kind, plan.kind) {
            (PlanKind::Shared, PlanKind::Shared) => {
                self.ledger.resize_locked(workspace_id, plan).await?
            }
            (_, PlanKind::Dedicated) => {
                self.converge_dedicated(workspace_id, Some(existing), plan, cancel)
                    .await?
            }
            (PlanKind::Dedicated, PlanKind::Shared) => self.swap_to_shared(existing, plan).await?,
        };

        info!(
            from_plan = %from_plan,
            to_plan = %plan.id,
            from_kind = %from_kind,
            to_kind = %plan.kind,
            version = changed.version,
            "Changed plan"
        );
        self.recorder
            .record_workspace(
                workspace_id,
                NodeEventType::PlanChanged,
                format!("{from_plan} -> {}", plan.id),
            )
            .await;

        Ok(changed)
    }

    /// Brings a workspace to exactly the nodes `plan` calls for.
    ///
    /// Active nodes of the same shape, whether referenced by the current
    /// allocation or left over from an interrupted attempt, are reused
    /// before anything new is provisioned. Same-shape nodes an earlier
    /// attempt left booting are resumed rather than replaced, so a retried
    /// plan change converges on the nodes it already asked for.
    async fn converge_dedicated(
        &self,
        workspace_id: WorkspaceId,
        existing: Option<WorkspaceAllocation>,
        plan: &Plan,
        cancel: Cancel<'_>,
    ) -> CapacityResult<WorkspaceAllocation> {
        let current_ids: HashSet<NodeId> = existing
            .as_ref()
            .map(|a| a.dedicated_node_ids().iter().copied().collect())
            .unwrap_or_default();
        let live = self.registry.list_nodes_for_workspace(workspace_id).await?;

        let reusable: Vec<DedicatedNode> = live
            .iter()
            .filter(|n| n.state.is_active() && self.same_shape(&n.plan_id, plan))
            .cloned()
            .collect();
        let shortfall = (plan.node_count as usize).saturating_sub(reusable.len());
        let resumable: Vec<DedicatedNode> = live
            .iter()
            .filter(|n| {
                n.state == NodeLifecycleState::Provisioning
                    && n.external_id.is_some()
                    && self.same_shape(&n.plan_id, plan)
            })
            .take(shortfall)
            .cloned()
            .collect();

        let actions = self.strategy.calculate_actions(
            plan.node_count,
            reusable.len() as u32,
            resumable.len() as u32,
        );
        debug!(
            reusable = reusable.len(),
            resumable = resumable.len(),
            to_provision = actions.to_provision,
            to_decommission = actions.to_decommission,
            "Planned dedicated resize"
        );

        // Oldest first, so the newest nodes are the ones kept.
        let ordered = select_for_decommission(reusable, decommission_priority);
        let split = (actions.to_decommission as usize).min(ordered.len());
        let kept = &ordered[split..];

        // Expand.
        let resumed = self
            .resume_nodes(workspace_id, &resumable, cancel)
            .await?;
        let fresh = self
            .provision_nodes(workspace_id, plan, actions.to_provision, cancel)
            .await?;
        if is_cancelled(cancel) {
            info!(provisioned = fresh.len(), "Plan change cancelled before commit");
            self.discard_all(&fresh).await;
            return Err(CapacityError::Cancelled(workspace_id));
        }

        let node_ids: Vec<NodeId> = kept
            .iter()
            .chain(resumed.iter())
            .chain(fresh.iter())
            .map(|n| n.id)
            .collect();

        // Commit.
        let committed = match self.commit_dedicated(workspace_id, existing, plan, node_ids.clone()).await {
            Ok(committed) => committed,
            Err(e) => {
                warn!(error = %e, "Failed to commit dedicated allocation");
                self.discard_all(&fresh).await;
                return Err(e);
            }
        };

        // Contract. Everything in `node_ids` is active, so at least
        // `plan.node_count` active nodes remain throughout.
        let keep: HashSet<NodeId> = node_ids.into_iter().collect();
        let surplus: Vec<DedicatedNode> = live
            .into_iter()
            .filter(|n| !keep.contains(&n.id))
            .filter(|n| current_ids.contains(&n.id) || n.state.is_active())
            .collect();
        for node in select_for_decommission(surplus, decommission_priority) {
            self.discard_quietly(node.id).await;
        }

        Ok(committed)
    }

    async fn commit_dedicated(
        &self,
        workspace_id: WorkspaceId,
        existing: Option<WorkspaceAllocation>,
        plan: &Plan,
        node_ids: Vec<NodeId>,
    ) -> CapacityResult<WorkspaceAllocation> {
        match existing {
            Some(existing) => {
                let next =
                    existing.with_capacity(&plan.id, AllocationCapacity::Dedicated { node_ids });
                Ok(self.store.update_allocation(&next).await?)
            }
            None => {
                let allocation = WorkspaceAllocation::new_dedicated(workspace_id, plan, node_ids);
                let stored = self.store.insert_allocation(&allocation).await?;
                if stored.id != allocation.id {
                    // Another writer created the allocation first.
                    return Err(StoreError::VersionConflict {
                        entity: "allocation",
                        id: stored.id.to_string(),
                        expected: 0,
                    }
                    .into());
                }
                info!(allocation_id = %stored.id, "Created dedicated allocation");
                Ok(stored)
            }
        }
    }

    /// Writes the shared allocation first, then decommissions the nodes the
    /// dedicated allocation held. Decommission failures are left to
    /// reconciliation.
    async fn swap_to_shared(
        &self,
        existing: WorkspaceAllocation,
        plan: &Plan,
    ) -> CapacityResult<WorkspaceAllocation> {
        let next = existing.with_capacity(
            &plan.id,
            AllocationCapacity::Shared {
                quota: SharedQuota::from_envelope(&plan.resources),
            },
        );
        let committed = self.store.update_allocation(&next).await?;

        for node_id in existing.dedicated_node_ids() {
            self.discard_quietly(*node_id).await;
        }

        Ok(committed)
    }

    /// Drives nodes left booting by an earlier attempt to `Active`.
    ///
    /// A node that times out again stays pending; one the hypervisor
    /// reports failed is discarded. Nodes that did come up stay active and
    /// are picked up by the next attempt.
    async fn resume_nodes(
        &self,
        workspace_id: WorkspaceId,
        nodes: &[DedicatedNode],
        cancel: Cancel<'_>,
    ) -> CapacityResult<Vec<DedicatedNode>> {
        let mut resumed = Vec::with_capacity(nodes.len());

        for node in nodes {
            if is_cancelled(cancel) {
                return Err(CapacityError::Cancelled(workspace_id));
            }

            match self.registry.resume(node).await {
                Ok(node) => resumed.push(node),
                Err(e) => {
                    if let CapacityError::ProvisioningFailed { node_id, .. } = &e {
                        self.discard_quietly(*node_id).await;
                    }
                    return Err(e);
                }
            }
        }

        Ok(resumed)
    }

    async fn provision_nodes(
        &self,
        workspace_id: WorkspaceId,
        plan: &Plan,
        count: u32,
        cancel: Cancel<'_>,
    ) -> CapacityResult<Vec<DedicatedNode>> {
        let mut fresh = Vec::with_capacity(count as usize);

        for _ in 0..count {
            if is_cancelled(cancel) {
                self.discard_all(&fresh).await;
                return Err(CapacityError::Cancelled(workspace_id));
            }

            match self.registry.provision(workspace_id, plan).await {
                Ok(node) => fresh.push(node),
                Err(e) => {
                    // A timed-out node may still come up at the hypervisor;
                    // it stays pending for reconciliation.
                    if let CapacityError::ProvisioningFailed { node_id, .. } = &e {
                        self.discard_quietly(*node_id).await;
                    }
                    self.discard_all(&fresh).await;
                    return Err(e);
                }
            }
        }

        Ok(fresh)
    }

    async fn discard_all(&self, nodes: &[DedicatedNode]) {
        for node in nodes {
            self.discard_quietly(node.id).await;
        }
    }

    async fn discard_quietly(&self, node_id: NodeId) {
        if let Err(e) = self.registry.discard(node_id).await {
            warn!(
                node_id = %node_id,
                error = %e,
                "Failed to discard node; leaving it for reconciliation"
            );
        }
    }

    fn same_shape(&self, plan_id: &str, plan: &Plan) -> bool {
        self.catalog
            .get_plan(plan_id)
            .map(|p| p.resources == plan.resources)
            .unwrap_or(false)
    }
}

fn decommission_priority(node: &DedicatedNode) -> DecommissionPriority {
    if node.state.is_active() {
        DecommissionPriority::Oldest
    } else {
        DecommissionPriority::NotActive
    }
}

fn ensure_purchasable(plan: &Plan) -> CapacityResult<()> {
    if plan.retired {
        return Err(CapacityError::InvalidRequest(format!(
            "plan {} is retired",
            plan.id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(state: NodeLifecycleState) -> DedicatedNode {
        let mut node = DedicatedNode::new(WorkspaceId::new(), "m-type-plan");
        node.state = state;
        node
    }

    #[test]
    fn test_non_active_nodes_go_first() {
        let active_old = node(NodeLifecycleState::Active);
        let pending = node(NodeLifecycleState::Provisioning);
        let active_new = node(NodeLifecycleState::Active);

        let ordered = select_for_decommission(
            vec![active_old.clone(), pending.clone(), active_new.clone()],
            decommission_priority,
        );
        let ids: Vec<NodeId> = ordered.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![pending.id, active_old.id, active_new.id]);
    }

    #[test]
    fn test_cancel_flag() {
        assert!(!is_cancelled(None));
        let (tx, rx) = watch::channel(false);
        assert!(!is_cancelled(Some(&rx)));
        tx.send(true).unwrap();
        assert!(is_cancelled(Some(&rx)));
    }

    #[test]
    fn test_retired_plans_are_not_purchasable() {
        let catalog = PlanCatalog::builtin().unwrap();
        let mut plan = catalog.get_plan("s-type-plan").unwrap();
        assert!(ensure_purchasable(&plan).is_ok());
        plan.retired = true;
        assert!(matches!(
            ensure_purchasable(&plan),
            Err(CapacityError::InvalidRequest(_))
        ));
    }
}
