//! Quota ledger.
//!
//! Tracks consumption of a workspace's shared pool. Every mutation runs in
//! the workspace's critical section and is written with a versioned update,
//! so `0 <= used <= limit` holds even with writers in other processes.

use std::sync::Arc;

use capacity_events::NodeEventType;
use capacity_id::WorkspaceId;
use tracing::{debug, info, instrument, warn};

use crate::catalog::Plan;
use crate::error::{CapacityError, CapacityResult};
use crate::locks::KeyedLocks;
use crate::model::{AllocationCapacity, ResourceDelta, SharedQuota, WorkspaceAllocation};
use crate::recorder::EventRecorder;
use crate::store::{Store, StoreError};

#[derive(Clone)]
pub struct QuotaLedger {
    store: Arc<dyn Store>,
    recorder: EventRecorder,
    locks: Arc<KeyedLocks<WorkspaceId>>,
    max_write_attempts: u32,
}

impl QuotaLedger {
    pub fn new(
        store: Arc<dyn Store>,
        recorder: EventRecorder,
        locks: Arc<KeyedLocks<WorkspaceId>>,
        max_write_attempts: u32,
    ) -> Self {
        Self {
            store,
            recorder,
            locks,
            max_write_attempts: max_write_attempts.max(1),
        }
    }

    /// Returns the workspace's allocation, creating a shared one with the
    /// plan's limits when none exists.
    ///
    /// An existing allocation is returned unchanged whatever its kind.
    pub async fn ensure_shared_allocation(
        &self,
        workspace_id: WorkspaceId,
        plan: &Plan,
    ) -> CapacityResult<WorkspaceAllocation> {
        let _guard = self.locks.lock(&workspace_id).await;
        self.ensure_shared_locked(workspace_id, plan).await
    }

    /// Atomically reserves both dimensions or neither.
    #[instrument(skip(self), fields(workspace_id = %workspace_id))]
    pub async fn reserve(
        &self,
        workspace_id: WorkspaceId,
        delta: ResourceDelta,
    ) -> CapacityResult<SharedQuota> {
        if delta.is_negative() {
            return Err(CapacityError::InvalidRequest(
                "reservation deltas must not be negative".to_string(),
            ));
        }

        let _guard = self.locks.lock(&workspace_id).await;

        let result = self
            .update_shared(workspace_id, |current, quota| {
                let next = quota
                    .reserve(delta)
                    .map_err(|breach| CapacityError::QuotaExceeded {
                        workspace_id,
                        dimension: breach.dimension,
                        requested: breach.requested,
                        available: breach.available,
                        limit: breach.limit,
                        used: breach.used,
                    })?;
                Ok(current.with_capacity(&current.plan_id, AllocationCapacity::Shared { quota: next }))
            })
            .await;

        let error = match result {
            Ok(allocation) => return Ok(shared_quota_of(&allocation)),
            Err(e) => e,
        };

        if let CapacityError::QuotaExceeded {
            dimension,
            requested,
            available,
            ..
        } = &error
        {
            warn!(
                dimension = %dimension,
                requested,
                available,
                "Shared quota exceeded"
            );
            self.recorder
                .record_workspace(
                    workspace_id,
                    NodeEventType::QuotaBreached,
                    format!(
                        "{dimension}: requested {requested} {}, available {available}",
                        dimension.unit()
                    ),
                )
                .await;
        }
        Err(error)
    }

    /// Returns consumption to the pool, clamping at zero.
    #[instrument(skip(self), fields(workspace_id = %workspace_id))]
    pub async fn release(
        &self,
        workspace_id: WorkspaceId,
        delta: ResourceDelta,
    ) -> CapacityResult<SharedQuota> {
        if delta.is_negative() {
            return Err(CapacityError::InvalidRequest(
                "release deltas must not be negative".to_string(),
            ));
        }

        let _guard = self.locks.lock(&workspace_id).await;

        let mut underflow = false;
        let allocation = self
            .update_shared(workspace_id, |current, quota| {
                let (next, over) = quota.release(delta);
                underflow = over;
                Ok(current.with_capacity(&current.plan_id, AllocationCapacity::Shared { quota: next }))
            })
            .await?;

        if underflow {
            warn!(
                cpu_millis = delta.cpu_millis,
                memory_bytes = delta.memory_bytes,
                "Released more than was reserved; usage clamped at zero"
            );
        }

        Ok(shared_quota_of(&allocation))
    }

    /// Whether `delta` would currently fit, without reserving it.
    pub async fn can_reserve(
        &self,
        workspace_id: WorkspaceId,
        delta: ResourceDelta,
    ) -> CapacityResult<bool> {
        if delta.is_negative() {
            return Ok(false);
        }

        let allocation = self
            .store
            .get_allocation(workspace_id)
            .await?
            .ok_or(CapacityError::AllocationNotFound(workspace_id))?;
        let quota = allocation
            .shared_quota()
            .ok_or(CapacityError::NotShared(workspace_id))?;

        Ok(quota.check_reserve(delta).is_ok())
    }

    /// Moves a shared allocation to another shared plan's limits.
    pub async fn resize(
        &self,
        workspace_id: WorkspaceId,
        plan: &Plan,
    ) -> CapacityResult<WorkspaceAllocation> {
        let _guard = self.locks.lock(&workspace_id).await;
        self.resize_locked(workspace_id, plan).await
    }

    // -------------------------------------------------------------------------
    // Callers below must hold the workspace lock.
    // -------------------------------------------------------------------------

    pub(crate) async fn ensure_shared_locked(
        &self,
        workspace_id: WorkspaceId,
        plan: &Plan,
    ) -> CapacityResult<WorkspaceAllocation> {
        if !plan.is_shared() {
            return Err(CapacityError::InvalidRequest(format!(
                "plan {} is not a shared plan",
                plan.id
            )));
        }

        if let Some(existing) = self.store.get_allocation(workspace_id).await? {
            return Ok(existing);
        }

        let allocation = WorkspaceAllocation::new_shared(workspace_id, plan);
        let stored = self.store.insert_allocation(&allocation).await?;
        if stored.id == allocation.id {
            info!(
                workspace_id = %workspace_id,
                allocation_id = %stored.id,
                plan_id = %plan.id,
                "Created shared allocation"
            );
        }
        Ok(stored)
    }

    #[instrument(skip(self, plan), fields(workspace_id = %workspace_id, plan_id = %plan.id))]
    pub(crate) async fn resize_locked(
        &self,
        workspace_id: WorkspaceId,
        plan: &Plan,
    ) -> CapacityResult<WorkspaceAllocation> {
        if !plan.is_shared() {
            return Err(CapacityError::InvalidRequest(format!(
                "plan {} is not a shared plan",
                plan.id
            )));
        }

        let allocation = self
            .update_shared(workspace_id, |current, quota| {
                let next = quota.resized(&plan.resources).map_err(|(dimension, new_limit, used)| {
                    CapacityError::QuotaShrinkBelowUsage {
                        workspace_id,
                        dimension,
                        new_limit,
                        used,
                    }
                })?;
                Ok(current.with_capacity(&plan.id, AllocationCapacity::Shared { quota: next }))
            })
            .await?;

        let quota = shared_quota_of(&allocation);
        info!(
            cpu_limit_millis = quota.cpu_limit_millis,
            memory_limit_bytes = quota.memory_limit_bytes,
            "Resized shared quota"
        );
        self.recorder
            .record_workspace(
                workspace_id,
                NodeEventType::QuotaResized,
                format!(
                    "{}: cpu {}m, memory {} bytes",
                    plan.id, quota.cpu_limit_millis, quota.memory_limit_bytes
                ),
            )
            .await;

        Ok(allocation)
    }

    /// Read-modify-write of a shared allocation, retried on version conflicts.
    async fn update_shared<F>(
        &self,
        workspace_id: WorkspaceId,
        mut apply: F,
    ) -> CapacityResult<WorkspaceAllocation>
    where
        F: FnMut(&WorkspaceAllocation, &SharedQuota) -> CapacityResult<WorkspaceAllocation>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let current = self
                .store
                .get_allocation(workspace_id)
                .await?
                .ok_or(CapacityError::AllocationNotFound(workspace_id))?;
            let quota = *current
                .shared_quota()
                .ok_or(CapacityError::NotShared(workspace_id))?;

            let next = apply(&current, &quota)?;
            match self.store.update_allocation(&next).await {
                Ok(stored) => return Ok(stored),
                Err(StoreError::VersionConflict { .. }) if attempt < self.max_write_attempts => {
                    debug!(attempt, "Allocation changed concurrently; retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn shared_quota_of(allocation: &WorkspaceAllocation) -> SharedQuota {
    // `update_shared` only ever writes shared capacity.
    allocation.shared_quota().copied().unwrap_or(SharedQuota {
        cpu_limit_millis: 0,
        memory_limit_bytes: 0,
        cpu_used_millis: 0,
        memory_used_bytes: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PlanCatalog;
    use crate::error::QuotaDimension;
    use crate::store::MemoryStore;

    fn ledger() -> (QuotaLedger, Arc<MemoryStore>, PlanCatalog) {
        let store = Arc::new(MemoryStore::new());
        let recorder = EventRecorder::new(store.clone());
        let ledger = QuotaLedger::new(store.clone(), recorder, Arc::new(KeyedLocks::new()), 5);
        (ledger, store, PlanCatalog::builtin().unwrap())
    }

    #[tokio::test]
    async fn test_ensure_shared_is_idempotent() {
        let (ledger, store, catalog) = ledger();
        let ws = WorkspaceId::new();

        let a = ledger
            .ensure_shared_allocation(ws, catalog.baseline_plan())
            .await
            .unwrap();
        let b = ledger
            .ensure_shared_allocation(ws, catalog.baseline_plan())
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(store.all_allocations().await.len(), 1);

        let quota = a.shared_quota().unwrap();
        assert_eq!(quota.cpu_limit_millis, 2_000);
        assert_eq!(quota.cpu_used_millis, 0);
    }

    #[tokio::test]
    async fn test_reserve_then_breach() {
        let (ledger, store, catalog) = ledger();
        let ws = WorkspaceId::new();
        ledger
            .ensure_shared_allocation(ws, catalog.baseline_plan())
            .await
            .unwrap();

        let quota = ledger.reserve(ws, ResourceDelta::cores_gb(2, 4)).await.unwrap();
        assert_eq!(quota.cpu_available(), 0);

        let err = ledger
            .reserve(ws, ResourceDelta::cores_gb(1, 0))
            .await
            .unwrap_err();
        assert_eq!(err.quota_dimension(), Some(QuotaDimension::Cpu));

        let stored = store.get_allocation(ws).await.unwrap().unwrap();
        let quota = stored.shared_quota().unwrap();
        assert_eq!(quota.cpu_used_millis, 2_000);
        assert_eq!(quota.memory_used_bytes, ResourceDelta::cores_gb(0, 4).memory_bytes);

        let events = store.list_workspace_events(ws, 10).await.unwrap();
        assert_eq!(events[0].event_type, NodeEventType::QuotaBreached);
        assert!(events[0].node_id.is_none());
    }

    #[tokio::test]
    async fn test_negative_delta_rejected() {
        let (ledger, _, catalog) = ledger();
        let ws = WorkspaceId::new();
        ledger
            .ensure_shared_allocation(ws, catalog.baseline_plan())
            .await
            .unwrap();

        let err = ledger
            .reserve(ws, ResourceDelta::new(-1, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, CapacityError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_release_clamps_at_zero() {
        let (ledger, _, catalog) = ledger();
        let ws = WorkspaceId::new();
        ledger
            .ensure_shared_allocation(ws, catalog.baseline_plan())
            .await
            .unwrap();
        ledger.reserve(ws, ResourceDelta::new(500, 0)).await.unwrap();

        let quota = ledger.release(ws, ResourceDelta::new(900, 1)).await.unwrap();
        assert_eq!(quota.cpu_used_millis, 0);
        assert_eq!(quota.memory_used_bytes, 0);
    }

    #[tokio::test]
    async fn test_can_reserve_does_not_commit() {
        let (ledger, _, catalog) = ledger();
        let ws = WorkspaceId::new();
        ledger
            .ensure_shared_allocation(ws, catalog.baseline_plan())
            .await
            .unwrap();

        assert!(ledger.can_reserve(ws, ResourceDelta::cores_gb(2, 4)).await.unwrap());
        assert!(ledger.can_reserve(ws, ResourceDelta::cores_gb(2, 4)).await.unwrap());
        assert!(!ledger.can_reserve(ws, ResourceDelta::cores_gb(3, 0)).await.unwrap());
    }

    #[tokio::test]
    async fn test_reserve_without_allocation() {
        let (ledger, _, _) = ledger();
        let ws = WorkspaceId::new();
        let err = ledger
            .reserve(ws, ResourceDelta::new(1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, CapacityError::AllocationNotFound(id) if id == ws));
    }
}
