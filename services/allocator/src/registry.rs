//! Node registry.
//!
//! Owns dedicated node records and their lifecycle:
//!
//! ```text
//! PendingCreation -> Provisioning -> Active -> Decommissioning -> Deleted
//!        |                |                                        ^
//!        +----------------+----------------------------------------+
//! ```
//!
//! Every transition is a versioned write made while holding the node's
//! lock, and its event is recorded before the lock is released, so the
//! history of one node is always in commit order. Illegal transitions
//! change nothing and are recorded as `node.transition_rejected`.
//!
//! The registry also drives the hypervisor when bringing nodes up and
//! tearing them down.

use std::sync::Arc;
use std::time::Duration;

use capacity_events::{NodeEventType, NodeLifecycleState};
use capacity_id::{ExternalNodeId, NodeId, WorkspaceId};
use chrono::Utc;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::catalog::Plan;
use crate::collaborators::{Hypervisor, HypervisorStatus, NodeSpec};
use crate::config::EngineConfig;
use crate::error::{CapacityError, CapacityResult};
use crate::locks::KeyedLocks;
use crate::model::DedicatedNode;
use crate::recorder::EventRecorder;
use crate::store::{Store, StoreError};

/// Engine state of a node next to what the hypervisor reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStatusView {
    pub node: DedicatedNode,

    /// `None` while the node has no external id.
    pub hypervisor_status: Option<HypervisorStatus>,
}

#[derive(Clone)]
pub struct NodeRegistry {
    store: Arc<dyn Store>,
    recorder: EventRecorder,
    hypervisor: Arc<dyn Hypervisor>,
    locks: Arc<KeyedLocks<NodeId>>,
    provision_timeout: Duration,
    status_poll_interval: Duration,
    hypervisor_timeout: Duration,
}

impl NodeRegistry {
    pub fn new(
        store: Arc<dyn Store>,
        recorder: EventRecorder,
        hypervisor: Arc<dyn Hypervisor>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            recorder,
            hypervisor,
            locks: Arc::new(KeyedLocks::new()),
            provision_timeout: config.provision_timeout,
            status_poll_interval: config.status_poll_interval,
            hypervisor_timeout: config.hypervisor_timeout,
        }
    }

    // =========================================================================
    // Records and transitions
    // =========================================================================

    /// Creates a node in `PendingCreation`.
    pub async fn create_node(
        &self,
        workspace_id: WorkspaceId,
        plan_id: &str,
    ) -> CapacityResult<DedicatedNode> {
        let node = DedicatedNode::new(workspace_id, plan_id);
        self.store.insert_node(&node).await?;

        info!(
            node_id = %node.id,
            workspace_id = %workspace_id,
            plan_id = %plan_id,
            "Created node"
        );
        self.recorder
            .record(node.id, workspace_id, NodeEventType::Created, plan_id)
            .await;

        Ok(node)
    }

    /// Attaches the hypervisor's handle and moves the node to `Provisioning`.
    pub async fn bind_external_id(
        &self,
        node_id: NodeId,
        external_id: ExternalNodeId,
    ) -> CapacityResult<DedicatedNode> {
        let _guard = self.locks.lock(&node_id).await;
        let node = self.load(node_id).await?;

        if let Some(bound) = &node.external_id {
            self.recorder
                .record(
                    node.id,
                    node.workspace_id,
                    NodeEventType::TransitionRejected,
                    format!("already bound to {bound}, refused {external_id}"),
                )
                .await;
            return Err(CapacityError::AlreadyBound {
                node_id,
                external_id: bound.clone(),
            });
        }

        let detail = external_id.to_string();
        self.transition_locked(node, NodeLifecycleState::Provisioning, Some(external_id), detail)
            .await
    }

    pub async fn mark_active(&self, node_id: NodeId) -> CapacityResult<DedicatedNode> {
        self.transition(node_id, NodeLifecycleState::Active, "hypervisor reports running")
            .await
    }

    pub async fn mark_decommissioning(&self, node_id: NodeId) -> CapacityResult<DedicatedNode> {
        self.transition(node_id, NodeLifecycleState::Decommissioning, "")
            .await
    }

    pub async fn mark_deleted(&self, node_id: NodeId) -> CapacityResult<DedicatedNode> {
        self.transition(node_id, NodeLifecycleState::Deleted, "")
            .await
    }

    pub async fn get_node(&self, node_id: NodeId) -> CapacityResult<DedicatedNode> {
        self.load(node_id).await
    }

    /// Live nodes of a workspace, oldest first.
    pub async fn list_nodes_for_workspace(
        &self,
        workspace_id: WorkspaceId,
    ) -> CapacityResult<Vec<DedicatedNode>> {
        Ok(self.store.list_nodes(workspace_id, false).await?)
    }

    /// Every node a workspace ever had, deleted ones included.
    pub async fn list_all_nodes_for_workspace(
        &self,
        workspace_id: WorkspaceId,
    ) -> CapacityResult<Vec<DedicatedNode>> {
        Ok(self.store.list_nodes(workspace_id, true).await?)
    }

    pub async fn list_nodes_in_states(
        &self,
        states: &[NodeLifecycleState],
    ) -> CapacityResult<Vec<DedicatedNode>> {
        Ok(self.store.list_nodes_in_states(states).await?)
    }

    async fn load(&self, node_id: NodeId) -> CapacityResult<DedicatedNode> {
        self.store
            .get_node(node_id)
            .await?
            .ok_or(CapacityError::NodeNotFound(node_id))
    }

    async fn transition(
        &self,
        node_id: NodeId,
        to: NodeLifecycleState,
        detail: &str,
    ) -> CapacityResult<DedicatedNode> {
        let _guard = self.locks.lock(&node_id).await;
        let node = self.load(node_id).await?;
        self.transition_locked(node, to, None, detail.to_string())
            .await
    }

    async fn transition_locked(
        &self,
        node: DedicatedNode,
        to: NodeLifecycleState,
        external_id: Option<ExternalNodeId>,
        detail: String,
    ) -> CapacityResult<DedicatedNode> {
        let from = node.state;
        if !from.can_transition_to(to) {
            warn!(node_id = %node.id, from = %from, to = %to, "Rejected node transition");
            self.recorder
                .record(
                    node.id,
                    node.workspace_id,
                    NodeEventType::TransitionRejected,
                    format!("{from} -> {to}"),
                )
                .await;
            return Err(CapacityError::InvalidTransition {
                node_id: node.id,
                from,
                to,
            });
        }

        let now = Utc::now();
        let mut next = node.clone();
        next.state = to;
        next.updated_at = now;
        if to.is_deleted() {
            next.deleted_at = Some(now);
        }
        if let Some(external_id) = external_id {
            next.external_id = Some(external_id);
        }

        let stored = self.store.update_node(&next).await.map_err(|e| match e {
            StoreError::Duplicate { .. } => match &next.external_id {
                Some(external_id) => CapacityError::ExternalIdInUse {
                    workspace_id: next.workspace_id,
                    external_id: external_id.clone(),
                },
                None => CapacityError::Store(e),
            },
            other => CapacityError::Store(other),
        })?;

        info!(node_id = %stored.id, from = %from, to = %to, "Node transitioned");
        self.recorder
            .record(
                stored.id,
                stored.workspace_id,
                NodeEventType::for_state(to),
                detail,
            )
            .await;

        Ok(stored)
    }

    // =========================================================================
    // Hypervisor-driven operations
    // =========================================================================

    /// Creates a node and drives it to `Active`.
    ///
    /// On timeout or failure the node is left where it stopped so that
    /// reconciliation can finish or remove it.
    #[instrument(skip(self, plan), fields(workspace_id = %workspace_id, plan_id = %plan.id))]
    pub async fn provision(
        &self,
        workspace_id: WorkspaceId,
        plan: &Plan,
    ) -> CapacityResult<DedicatedNode> {
        if !plan.is_dedicated() {
            return Err(CapacityError::InvalidRequest(format!(
                "plan {} does not grant dedicated nodes",
                plan.id
            )));
        }

        let node = self.create_node(workspace_id, &plan.id).await?;
        let deadline = Instant::now() + self.provision_timeout;
        let spec = NodeSpec::for_plan(node.id, workspace_id, plan);

        let external_id =
            match tokio::time::timeout_at(deadline, self.hypervisor.create_node(&spec)).await {
                Ok(Ok(external_id)) => external_id,
                Ok(Err(e)) => return Err(self.provisioning_failed(&node, e.to_string()).await),
                Err(_) => return Err(self.provisioning_timed_out(&node, "create").await),
            };

        let node = match self.bind_external_id(node.id, external_id.clone()).await {
            Ok(node) => node,
            Err(e @ CapacityError::ExternalIdInUse { .. }) => {
                // The handle belongs to another node; its VM is not ours to delete.
                error!(
                    node_id = %node.id,
                    external_id = %external_id,
                    "Hypervisor returned a handle already bound to another node"
                );
                return Err(e);
            }
            Err(e) => {
                // The VM exists but cannot be tracked; do not leak it.
                if let Err(reason) = self.delete_external(&external_id).await {
                    error!(
                        node_id = %node.id,
                        external_id = %external_id,
                        reason = %reason,
                        "Failed to delete untracked VM"
                    );
                }
                return Err(e);
            }
        };

        self.wait_until_active(node, &external_id, deadline).await
    }

    /// Picks up a node an earlier attempt left `Provisioning` and drives it
    /// to `Active`, waiting at most one provisioning timeout.
    #[instrument(skip(self, node), fields(node_id = %node.id))]
    pub async fn resume(&self, node: &DedicatedNode) -> CapacityResult<DedicatedNode> {
        let external_id = match (&node.state, &node.external_id) {
            (NodeLifecycleState::Provisioning, Some(external_id)) => external_id.clone(),
            _ => {
                return Err(CapacityError::InvalidRequest(format!(
                    "node {} is {} and cannot be resumed",
                    node.id, node.state
                )));
            }
        };

        info!(external_id = %external_id, "Resuming node provisioning");
        let deadline = Instant::now() + self.provision_timeout;
        self.wait_until_active(node.clone(), &external_id, deadline)
            .await
    }

    async fn wait_until_active(
        &self,
        node: DedicatedNode,
        external_id: &ExternalNodeId,
        deadline: Instant,
    ) -> CapacityResult<DedicatedNode> {
        loop {
            let status =
                match tokio::time::timeout_at(deadline, self.hypervisor.node_status(external_id))
                    .await
                {
                    Ok(Ok(status)) => status,
                    Ok(Err(e)) => {
                        warn!(node_id = %node.id, error = %e, "Hypervisor status check failed");
                        HypervisorStatus::Unknown
                    }
                    Err(_) => return Err(self.provisioning_timed_out(&node, "boot").await),
                };

            match status {
                HypervisorStatus::Running => return self.mark_active(node.id).await,
                status if status.is_terminal_failure() => {
                    return Err(self
                        .provisioning_failed(&node, format!("hypervisor reports {status}"))
                        .await);
                }
                status => debug!(node_id = %node.id, status = %status, "Waiting for node"),
            }

            if Instant::now() + self.status_poll_interval >= deadline {
                tokio::time::sleep_until(deadline).await;
                return Err(self.provisioning_timed_out(&node, "boot").await);
            }
            tokio::time::sleep(self.status_poll_interval).await;
        }
    }

    /// Takes an active node out of service and deletes its VM.
    ///
    /// Safe to repeat: a node already decommissioning resumes at the VM
    /// delete, a deleted node is returned as is. When the delete fails the
    /// node stays `Decommissioning`.
    #[instrument(skip(self), fields(node_id = %node_id))]
    pub async fn decommission(&self, node_id: NodeId) -> CapacityResult<DedicatedNode> {
        let node = self.load(node_id).await?;
        let node = match node.state {
            NodeLifecycleState::Deleted => return Ok(node),
            NodeLifecycleState::Decommissioning => node,
            _ => self.mark_decommissioning(node_id).await?,
        };

        if let Some(external_id) = &node.external_id {
            if let Err(reason) = self.delete_external(external_id).await {
                warn!(external_id = %external_id, reason = %reason, "VM delete failed");
                return Err(CapacityError::ProvisioningFailed { node_id, reason });
            }
        }

        self.mark_deleted(node_id).await
    }

    /// Removes a node that never became active, or decommissions one that did.
    #[instrument(skip(self), fields(node_id = %node_id))]
    pub async fn discard(&self, node_id: NodeId) -> CapacityResult<DedicatedNode> {
        let node = self.load(node_id).await?;
        match node.state {
            NodeLifecycleState::Deleted => Ok(node),
            NodeLifecycleState::Active | NodeLifecycleState::Decommissioning => {
                self.decommission(node_id).await
            }
            NodeLifecycleState::PendingCreation | NodeLifecycleState::Provisioning => {
                if let Some(external_id) = &node.external_id {
                    if let Err(reason) = self.delete_external(external_id).await {
                        warn!(external_id = %external_id, reason = %reason, "VM delete failed");
                        return Err(CapacityError::ProvisioningFailed { node_id, reason });
                    }
                }
                self.mark_deleted(node_id).await
            }
        }
    }

    /// Engine state together with the hypervisor's view of the VM.
    pub async fn node_status(&self, node_id: NodeId) -> CapacityResult<NodeStatusView> {
        let node = self.load(node_id).await?;
        let hypervisor_status = match &node.external_id {
            Some(external_id) if !node.state.is_deleted() => Some(self.probe(external_id).await),
            Some(_) => Some(HypervisorStatus::Missing),
            None => None,
        };
        Ok(NodeStatusView {
            node,
            hypervisor_status,
        })
    }

    /// Asks the hypervisor for a VM's status; `Unknown` when it cannot answer.
    pub async fn probe(&self, external_id: &ExternalNodeId) -> HypervisorStatus {
        match tokio::time::timeout(self.hypervisor_timeout, self.hypervisor.node_status(external_id))
            .await
        {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                warn!(external_id = %external_id, error = %e, "Hypervisor status check failed");
                HypervisorStatus::Unknown
            }
            Err(_) => {
                warn!(external_id = %external_id, "Hypervisor status check timed out");
                HypervisorStatus::Unknown
            }
        }
    }

    /// Deletes a VM. A VM the hypervisor no longer knows counts as deleted.
    async fn delete_external(&self, external_id: &ExternalNodeId) -> Result<(), String> {
        match tokio::time::timeout(self.hypervisor_timeout, self.hypervisor.delete_node(external_id))
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.is_not_found() => {
                debug!(external_id = %external_id, "VM already gone");
                Ok(())
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "hypervisor delete timed out after {:?}",
                self.hypervisor_timeout
            )),
        }
    }

    async fn provisioning_timed_out(&self, node: &DedicatedNode, phase: &str) -> CapacityError {
        warn!(
            node_id = %node.id,
            phase = %phase,
            timeout = ?self.provision_timeout,
            "Provisioning timed out"
        );
        self.recorder
            .record(
                node.id,
                node.workspace_id,
                NodeEventType::ProvisioningTimedOut,
                format!("{phase} exceeded {:?}", self.provision_timeout),
            )
            .await;
        CapacityError::ProvisioningTimeout {
            node_id: node.id,
            timeout: self.provision_timeout,
        }
    }

    async fn provisioning_failed(&self, node: &DedicatedNode, reason: String) -> CapacityError {
        error!(node_id = %node.id, reason = %reason, "Provisioning failed");
        self.recorder
            .record(
                node.id,
                node.workspace_id,
                NodeEventType::ProvisioningFailed,
                reason.clone(),
            )
            .await;
        CapacityError::ProvisioningFailed {
            node_id: node.id,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PlanCatalog;
    use crate::collaborators::MockHypervisor;
    use crate::store::MemoryStore;

    struct Fixture {
        registry: NodeRegistry,
        store: Arc<MemoryStore>,
        hypervisor: Arc<MockHypervisor>,
        plan: Plan,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let hypervisor = Arc::new(MockHypervisor::new());
        let config = EngineConfig {
            provision_timeout: Duration::from_millis(300),
            status_poll_interval: Duration::from_millis(5),
            hypervisor_timeout: Duration::from_millis(100),
            ..EngineConfig::default()
        };
        let registry = NodeRegistry::new(
            store.clone(),
            EventRecorder::new(store.clone()),
            hypervisor.clone(),
            &config,
        );
        let plan = PlanCatalog::builtin().unwrap().get_plan("m-type-plan").unwrap();
        Fixture {
            registry,
            store,
            hypervisor,
            plan,
        }
    }

    async fn event_types(store: &MemoryStore, node_id: NodeId) -> Vec<NodeEventType> {
        let mut events = store.list_node_events(node_id, 100).await.unwrap();
        events.reverse();
        events.into_iter().map(|e| e.event_type).collect()
    }

    #[tokio::test]
    async fn test_manual_lifecycle() {
        let f = fixture();
        let ws = WorkspaceId::new();

        let node = f.registry.create_node(ws, "m-type-plan").await.unwrap();
        assert_eq!(node.state, NodeLifecycleState::PendingCreation);

        let node = f
            .registry
            .bind_external_id(node.id, ExternalNodeId::parse("vm-1").unwrap())
            .await
            .unwrap();
        assert_eq!(node.state, NodeLifecycleState::Provisioning);

        let node = f.registry.mark_active(node.id).await.unwrap();
        let node = f.registry.mark_decommissioning(node.id).await.unwrap();
        let node = f.registry.mark_deleted(node.id).await.unwrap();
        assert!(node.deleted_at.is_some());

        assert_eq!(
            event_types(&f.store, node.id).await,
            vec![
                NodeEventType::Created,
                NodeEventType::Bound,
                NodeEventType::Activated,
                NodeEventType::Decommissioning,
                NodeEventType::Deleted,
            ]
        );
        assert!(f.registry.list_nodes_for_workspace(ws).await.unwrap().is_empty());
        assert_eq!(f.registry.list_all_nodes_for_workspace(ws).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_illegal_transition_is_rejected_and_recorded() {
        let f = fixture();
        let node = f.registry.create_node(WorkspaceId::new(), "m-type-plan").await.unwrap();

        let err = f.registry.mark_active(node.id).await.unwrap_err();
        assert!(matches!(
            err,
            CapacityError::InvalidTransition {
                from: NodeLifecycleState::PendingCreation,
                to: NodeLifecycleState::Active,
                ..
            }
        ));

        let stored = f.registry.get_node(node.id).await.unwrap();
        assert_eq!(stored.state, NodeLifecycleState::PendingCreation);
        assert_eq!(stored.version, node.version);
        assert_eq!(
            event_types(&f.store, node.id).await,
            vec![NodeEventType::Created, NodeEventType::TransitionRejected]
        );
    }

    #[tokio::test]
    async fn test_deleted_is_terminal() {
        let f = fixture();
        let node = f.registry.create_node(WorkspaceId::new(), "m-type-plan").await.unwrap();
        let deleted = f.registry.mark_deleted(node.id).await.unwrap();

        let err = f.registry.mark_deleted(node.id).await.unwrap_err();
        assert!(matches!(err, CapacityError::InvalidTransition { .. }));
        assert_eq!(
            f.registry.get_node(node.id).await.unwrap().deleted_at,
            deleted.deleted_at
        );
    }

    #[tokio::test]
    async fn test_bind_twice() {
        let f = fixture();
        let node = f.registry.create_node(WorkspaceId::new(), "m-type-plan").await.unwrap();
        f.registry
            .bind_external_id(node.id, ExternalNodeId::parse("vm-1").unwrap())
            .await
            .unwrap();

        let err = f
            .registry
            .bind_external_id(node.id, ExternalNodeId::parse("vm-2").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, CapacityError::AlreadyBound { .. }));
    }

    #[tokio::test]
    async fn test_external_id_in_use() {
        let f = fixture();
        let ws = WorkspaceId::new();
        let a = f.registry.create_node(ws, "m-type-plan").await.unwrap();
        let b = f.registry.create_node(ws, "m-type-plan").await.unwrap();
        let external_id = ExternalNodeId::parse("vm-1").unwrap();

        f.registry.bind_external_id(a.id, external_id.clone()).await.unwrap();
        let err = f
            .registry
            .bind_external_id(b.id, external_id)
            .await
            .unwrap_err();
        assert!(matches!(err, CapacityError::ExternalIdInUse { .. }));
        assert_eq!(
            f.registry.get_node(b.id).await.unwrap().state,
            NodeLifecycleState::PendingCreation
        );
    }

    #[tokio::test]
    async fn test_provision_reaches_active() {
        let f = fixture();
        f.hypervisor.set_polls_until_running(2);
        let ws = WorkspaceId::new();

        let node = f.registry.provision(ws, &f.plan).await.unwrap();
        assert_eq!(node.state, NodeLifecycleState::Active);
        let external_id = node.external_id.clone().unwrap();
        assert_eq!(
            f.hypervisor.spec_of(&external_id).unwrap().resources.cpu_cores,
            8
        );
        assert_eq!(
            event_types(&f.store, node.id).await,
            vec![
                NodeEventType::Created,
                NodeEventType::Bound,
                NodeEventType::Activated,
            ]
        );
    }

    #[tokio::test]
    async fn test_provision_timeout_leaves_node_pending() {
        let f = fixture();
        f.hypervisor.set_create_delay(Duration::from_secs(5));

        let err = f
            .registry
            .provision(WorkspaceId::new(), &f.plan)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        let CapacityError::ProvisioningTimeout { node_id, .. } = err else {
            panic!("expected timeout, got {err:?}");
        };

        let node = f.registry.get_node(node_id).await.unwrap();
        assert_eq!(node.state, NodeLifecycleState::PendingCreation);
        assert_eq!(
            event_types(&f.store, node_id).await,
            vec![NodeEventType::Created, NodeEventType::ProvisioningTimedOut]
        );
    }

    #[tokio::test]
    async fn test_resume_after_boot_timeout() {
        let f = fixture();
        f.hypervisor.set_polls_until_running(1_000_000);

        let err = f
            .registry
            .provision(WorkspaceId::new(), &f.plan)
            .await
            .unwrap_err();
        let CapacityError::ProvisioningTimeout { node_id, .. } = err else {
            panic!("expected timeout, got {err:?}");
        };
        let node = f.registry.get_node(node_id).await.unwrap();
        assert_eq!(node.state, NodeLifecycleState::Provisioning);

        f.hypervisor
            .set_status(node.external_id.as_ref().unwrap(), HypervisorStatus::Running);
        let node = f.registry.resume(&node).await.unwrap();
        assert_eq!(node.state, NodeLifecycleState::Active);
        assert_eq!(f.hypervisor.created_count(), 1);
        assert_eq!(
            event_types(&f.store, node_id).await,
            vec![
                NodeEventType::Created,
                NodeEventType::Bound,
                NodeEventType::ProvisioningTimedOut,
                NodeEventType::Activated,
            ]
        );
    }

    #[tokio::test]
    async fn test_resume_requires_bound_provisioning_node() {
        let f = fixture();
        let node = f.registry.create_node(WorkspaceId::new(), "m-type-plan").await.unwrap();

        let err = f.registry.resume(&node).await.unwrap_err();
        assert!(matches!(err, CapacityError::InvalidRequest(_)));
        assert_eq!(f.hypervisor.created_count(), 0);
    }

    #[tokio::test]
    async fn test_provision_keeps_vm_bound_to_another_node() {
        let f = fixture();
        let ws = WorkspaceId::new();
        // The mock hands out mock-vm-100 next; bind it to an existing node first.
        let owner = f.registry.create_node(ws, "m-type-plan").await.unwrap();
        let external_id = ExternalNodeId::parse("mock-vm-100").unwrap();
        f.registry
            .bind_external_id(owner.id, external_id.clone())
            .await
            .unwrap();

        let err = f.registry.provision(ws, &f.plan).await.unwrap_err();
        assert!(matches!(err, CapacityError::ExternalIdInUse { .. }));

        assert_eq!(f.hypervisor.vm_count(), 1);
        assert!(f.hypervisor.spec_of(&external_id).is_some());
        let owner = f.registry.get_node(owner.id).await.unwrap();
        assert_eq!(owner.external_id, Some(external_id));
        assert_eq!(owner.state, NodeLifecycleState::Provisioning);
    }

    #[tokio::test]
    async fn test_provision_failure_is_recorded() {
        let f = fixture();
        f.hypervisor.set_fail_creates(true);

        let err = f
            .registry
            .provision(WorkspaceId::new(), &f.plan)
            .await
            .unwrap_err();
        let CapacityError::ProvisioningFailed { node_id, .. } = err else {
            panic!("expected failure, got {err:?}");
        };
        assert_eq!(
            event_types(&f.store, node_id).await,
            vec![NodeEventType::Created, NodeEventType::ProvisioningFailed]
        );
    }

    #[tokio::test]
    async fn test_decommission_deletes_vm() {
        let f = fixture();
        let node = f.registry.provision(WorkspaceId::new(), &f.plan).await.unwrap();
        assert_eq!(f.hypervisor.vm_count(), 1);

        let node = f.registry.decommission(node.id).await.unwrap();
        assert_eq!(node.state, NodeLifecycleState::Deleted);
        assert_eq!(f.hypervisor.vm_count(), 0);

        // Repeating is harmless.
        let again = f.registry.decommission(node.id).await.unwrap();
        assert_eq!(again.version, node.version);
    }

    #[tokio::test]
    async fn test_decommission_failure_stays_decommissioning() {
        let f = fixture();
        let node = f.registry.provision(WorkspaceId::new(), &f.plan).await.unwrap();
        f.hypervisor.set_fail_deletes(true);

        let err = f.registry.decommission(node.id).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(
            f.registry.get_node(node.id).await.unwrap().state,
            NodeLifecycleState::Decommissioning
        );

        f.hypervisor.set_fail_deletes(false);
        let node = f.registry.decommission(node.id).await.unwrap();
        assert_eq!(node.state, NodeLifecycleState::Deleted);
    }

    #[tokio::test]
    async fn test_node_status_view() {
        let f = fixture();
        let node = f.registry.provision(WorkspaceId::new(), &f.plan).await.unwrap();

        let view = f.registry.node_status(node.id).await.unwrap();
        assert_eq!(view.hypervisor_status, Some(HypervisorStatus::Running));

        f.hypervisor.set_unreachable(true);
        let view = f.registry.node_status(node.id).await.unwrap();
        assert_eq!(view.hypervisor_status, Some(HypervisorStatus::Unknown));
        assert_eq!(view.node.state, NodeLifecycleState::Active);
    }
}
