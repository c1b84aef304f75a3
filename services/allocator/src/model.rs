//! Domain records owned by the engine.

use std::time::Duration;

use capacity_events::NodeLifecycleState;
use capacity_id::{AllocationId, ExternalNodeId, NodeId, WorkspaceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::{Plan, PlanKind, ResourceEnvelope};
use crate::error::QuotaDimension;

// =============================================================================
// Shared quota
// =============================================================================

/// A change in shared quota consumption, in ledger units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceDelta {
    pub cpu_millis: i64,
    pub memory_bytes: i64,
}

impl ResourceDelta {
    pub fn new(cpu_millis: i64, memory_bytes: i64) -> Self {
        Self {
            cpu_millis,
            memory_bytes,
        }
    }

    /// A delta expressed in whole cores and gigabytes.
    pub fn cores_gb(cpu_cores: i64, memory_gb: i64) -> Self {
        Self::new(cpu_cores * 1000, memory_gb * 1024 * 1024 * 1024)
    }

    pub fn is_negative(&self) -> bool {
        self.cpu_millis < 0 || self.memory_bytes < 0
    }
}

/// Why a reservation does not fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaBreach {
    pub dimension: QuotaDimension,
    pub requested: i64,
    pub available: i64,
    pub limit: i64,
    pub used: i64,
}

/// Limits and consumption of a shared pool.
///
/// `0 <= used <= limit` holds in every dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedQuota {
    pub cpu_limit_millis: i64,
    pub memory_limit_bytes: i64,
    pub cpu_used_millis: i64,
    pub memory_used_bytes: i64,
}

impl SharedQuota {
    /// Fresh quota with the envelope's limits and nothing used.
    pub fn from_envelope(envelope: &ResourceEnvelope) -> Self {
        Self {
            cpu_limit_millis: envelope.cpu_millis(),
            memory_limit_bytes: envelope.memory_bytes(),
            cpu_used_millis: 0,
            memory_used_bytes: 0,
        }
    }

    pub fn cpu_available(&self) -> i64 {
        self.cpu_limit_millis - self.cpu_used_millis
    }

    pub fn memory_available(&self) -> i64 {
        self.memory_limit_bytes - self.memory_used_bytes
    }

    pub fn is_within_limits(&self) -> bool {
        (0..=self.cpu_limit_millis).contains(&self.cpu_used_millis)
            && (0..=self.memory_limit_bytes).contains(&self.memory_used_bytes)
    }

    /// Checks both dimensions; cpu is reported first when both overflow.
    pub fn check_reserve(&self, delta: ResourceDelta) -> Result<(), QuotaBreach> {
        if delta.cpu_millis > self.cpu_available() {
            return Err(QuotaBreach {
                dimension: QuotaDimension::Cpu,
                requested: delta.cpu_millis,
                available: self.cpu_available(),
                limit: self.cpu_limit_millis,
                used: self.cpu_used_millis,
            });
        }
        if delta.memory_bytes > self.memory_available() {
            return Err(QuotaBreach {
                dimension: QuotaDimension::Memory,
                requested: delta.memory_bytes,
                available: self.memory_available(),
                limit: self.memory_limit_bytes,
                used: self.memory_used_bytes,
            });
        }
        Ok(())
    }

    /// Applies a reservation after both dimensions have been checked.
    pub fn reserve(&self, delta: ResourceDelta) -> Result<Self, QuotaBreach> {
        self.check_reserve(delta)?;
        Ok(Self {
            cpu_used_millis: self.cpu_used_millis + delta.cpu_millis,
            memory_used_bytes: self.memory_used_bytes + delta.memory_bytes,
            ..*self
        })
    }

    /// Subtracts a release, clamping at zero. The flag reports whether the
    /// release exceeded what was in use.
    pub fn release(&self, delta: ResourceDelta) -> (Self, bool) {
        let underflow =
            delta.cpu_millis > self.cpu_used_millis || delta.memory_bytes > self.memory_used_bytes;
        let released = Self {
            cpu_used_millis: (self.cpu_used_millis - delta.cpu_millis).max(0),
            memory_used_bytes: (self.memory_used_bytes - delta.memory_bytes).max(0),
            ..*self
        };
        (released, underflow)
    }

    /// New limits from `envelope`, keeping current usage.
    pub fn resized(&self, envelope: &ResourceEnvelope) -> Result<Self, (QuotaDimension, i64, i64)> {
        let cpu_limit = envelope.cpu_millis();
        let memory_limit = envelope.memory_bytes();
        if cpu_limit < self.cpu_used_millis {
            return Err((QuotaDimension::Cpu, cpu_limit, self.cpu_used_millis));
        }
        if memory_limit < self.memory_used_bytes {
            return Err((QuotaDimension::Memory, memory_limit, self.memory_used_bytes));
        }
        Ok(Self {
            cpu_limit_millis: cpu_limit,
            memory_limit_bytes: memory_limit,
            ..*self
        })
    }
}

// =============================================================================
// Allocation
// =============================================================================

/// What a workspace's capacity is drawn from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "plan_kind", rename_all = "snake_case")]
pub enum AllocationCapacity {
    Shared { quota: SharedQuota },
    Dedicated { node_ids: Vec<NodeId> },
}

/// The capacity grant bound to one workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceAllocation {
    pub id: AllocationId,
    pub workspace_id: WorkspaceId,
    pub plan_id: String,
    pub capacity: AllocationCapacity,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkspaceAllocation {
    /// A new shared allocation with the plan's limits and nothing used.
    pub fn new_shared(workspace_id: WorkspaceId, plan: &Plan) -> Self {
        Self::new(
            workspace_id,
            &plan.id,
            AllocationCapacity::Shared {
                quota: SharedQuota::from_envelope(&plan.resources),
            },
        )
    }

    pub fn new_dedicated(workspace_id: WorkspaceId, plan: &Plan, node_ids: Vec<NodeId>) -> Self {
        Self::new(workspace_id, &plan.id, AllocationCapacity::Dedicated { node_ids })
    }

    fn new(workspace_id: WorkspaceId, plan_id: &str, capacity: AllocationCapacity) -> Self {
        let now = Utc::now();
        Self {
            id: AllocationId::new(),
            workspace_id,
            plan_id: plan_id.to_string(),
            capacity,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn plan_kind(&self) -> PlanKind {
        match self.capacity {
            AllocationCapacity::Shared { .. } => PlanKind::Shared,
            AllocationCapacity::Dedicated { .. } => PlanKind::Dedicated,
        }
    }

    pub fn shared_quota(&self) -> Option<&SharedQuota> {
        match &self.capacity {
            AllocationCapacity::Shared { quota } => Some(quota),
            AllocationCapacity::Dedicated { .. } => None,
        }
    }

    /// Node ids of a dedicated allocation; empty for shared ones.
    pub fn dedicated_node_ids(&self) -> &[NodeId] {
        match &self.capacity {
            AllocationCapacity::Shared { .. } => &[],
            AllocationCapacity::Dedicated { node_ids } => node_ids,
        }
    }

    /// Structural invariants a stored allocation must satisfy.
    pub fn is_consistent(&self) -> bool {
        match &self.capacity {
            AllocationCapacity::Shared { quota } => quota.is_within_limits(),
            AllocationCapacity::Dedicated { node_ids } => !node_ids.is_empty(),
        }
    }

    /// Copy with a new capacity and plan, ready for a versioned update.
    pub(crate) fn with_capacity(&self, plan_id: &str, capacity: AllocationCapacity) -> Self {
        Self {
            plan_id: plan_id.to_string(),
            capacity,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }
}

// =============================================================================
// Dedicated nodes
// =============================================================================

/// A virtual node owned exclusively by one workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedicatedNode {
    pub id: NodeId,
    pub workspace_id: WorkspaceId,
    pub external_id: Option<ExternalNodeId>,
    pub plan_id: String,
    pub state: NodeLifecycleState,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl DedicatedNode {
    pub fn new(workspace_id: WorkspaceId, plan_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: NodeId::new(),
            workspace_id,
            external_id: None,
            plan_id: plan_id.to_string(),
            state: NodeLifecycleState::PendingCreation,
            version: 1,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Time since the node last changed state.
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.updated_at).to_std().unwrap_or_default()
    }
}

// =============================================================================
// Usage
// =============================================================================

/// Point-in-time resource consumption of one node. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub node_id: NodeId,
    pub cpu_cores: f64,
    pub memory_gb: f64,
    pub storage_gb: f64,
    pub pod_count: u32,
    pub observed_at: DateTime<Utc>,
}

/// Usage of one dedicated node within a workspace summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeUsageEntry {
    pub node_id: NodeId,
    pub state: NodeLifecycleState,
    pub usage: Option<ResourceUsage>,

    /// Why `usage` is missing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unavailable: Option<String>,
}

/// Aggregate view of a workspace's capacity and consumption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "plan_kind", rename_all = "snake_case")]
pub enum WorkspaceUsage {
    Shared {
        workspace_id: WorkspaceId,
        plan_id: String,
        quota: SharedQuota,
    },
    Dedicated {
        workspace_id: WorkspaceId,
        plan_id: String,
        total_nodes: usize,
        active_nodes: usize,
        total_cpu_cores: i64,
        total_memory_gb: i64,
        total_storage_gb: i64,
        nodes: Vec<NodeUsageEntry>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(cpu_cores: i32, memory_gb: i32) -> ResourceEnvelope {
        ResourceEnvelope {
            cpu_cores,
            memory_gb,
            storage_gb: 100,
            max_pods: 50,
            max_services: 10,
        }
    }

    #[test]
    fn test_reserve_is_all_or_nothing() {
        let quota = SharedQuota::from_envelope(&envelope(2, 4));
        let quota = quota.reserve(ResourceDelta::cores_gb(2, 4)).unwrap();
        assert_eq!(quota.cpu_available(), 0);
        assert_eq!(quota.memory_available(), 0);

        let breach = quota.reserve(ResourceDelta::cores_gb(1, 0)).unwrap_err();
        assert_eq!(breach.dimension, QuotaDimension::Cpu);
        assert_eq!(breach.requested, 1000);
        assert_eq!(breach.available, 0);
    }

    #[test]
    fn test_memory_breach_leaves_cpu_untouched() {
        let quota = SharedQuota::from_envelope(&envelope(2, 4));
        let breach = quota.reserve(ResourceDelta::cores_gb(1, 5)).unwrap_err();
        assert_eq!(breach.dimension, QuotaDimension::Memory);
        assert_eq!(quota.cpu_used_millis, 0);
    }

    #[test]
    fn test_release_clamps_and_flags_underflow() {
        let quota = SharedQuota::from_envelope(&envelope(2, 4))
            .reserve(ResourceDelta::new(500, 0))
            .unwrap();

        let (released, underflow) = quota.release(ResourceDelta::new(800, 0));
        assert!(underflow);
        assert_eq!(released.cpu_used_millis, 0);
        assert!(released.is_within_limits());

        let (_, underflow) = quota.release(ResourceDelta::new(500, 0));
        assert!(!underflow);
    }

    #[test]
    fn test_resize_below_usage() {
        let quota = SharedQuota::from_envelope(&envelope(4, 8))
            .reserve(ResourceDelta::cores_gb(3, 1))
            .unwrap();

        let (dimension, new_limit, used) = quota.resized(&envelope(2, 8)).unwrap_err();
        assert_eq!(dimension, QuotaDimension::Cpu);
        assert_eq!(new_limit, 2000);
        assert_eq!(used, 3000);

        let grown = quota.resized(&envelope(8, 16)).unwrap();
        assert_eq!(grown.cpu_limit_millis, 8000);
        assert_eq!(grown.cpu_used_millis, 3000);
    }

    #[test]
    fn test_allocation_capacity_json_shape() {
        let ws = WorkspaceId::new();
        let node = NodeId::new();
        let plan = crate::catalog::PlanCatalog::builtin()
            .unwrap()
            .get_plan("m-type-plan")
            .unwrap();

        let allocation = WorkspaceAllocation::new_dedicated(ws, &plan, vec![node]);
        let json = serde_json::to_value(&allocation).unwrap();
        assert_eq!(json["capacity"]["plan_kind"], "dedicated");
        assert_eq!(json["capacity"]["node_ids"][0], node.to_string());
        assert!(json["capacity"].get("quota").is_none());
        assert!(allocation.is_consistent());
        assert!(allocation.shared_quota().is_none());
    }
}
