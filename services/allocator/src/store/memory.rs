//! In-memory store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use capacity_events::{NewNodeEvent, NodeEvent, NodeLifecycleState};
use capacity_id::{EventSeq, ExternalNodeId, NodeId, WorkspaceId};
use tokio::sync::RwLock;

use super::{validate_node_write, Store, StoreError, StoreResult};
use crate::model::{DedicatedNode, WorkspaceAllocation};

#[derive(Debug, Default)]
struct Tables {
    allocations: HashMap<WorkspaceId, WorkspaceAllocation>,
    nodes: HashMap<NodeId, DedicatedNode>,
    events: Vec<NodeEvent>,
}

/// Store kept entirely in process memory, for tests and local development.
///
/// Every method holds the table lock only for the duration of the
/// in-memory mutation, never across an await on something else. Writes
/// from different workspaces still queue on that one lock, so deployments
/// that need independent workspaces to proceed in parallel use
/// [`PgStore`](super::PgStore), where contention is per row.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    fail_event_appends: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `append_event` fail.
    pub fn set_fail_event_appends(&self, fail: bool) {
        self.fail_event_appends.store(fail, Ordering::SeqCst);
    }

    /// Every stored event in append order.
    pub async fn all_events(&self) -> Vec<NodeEvent> {
        self.tables.read().await.events.clone()
    }

    /// Every stored allocation.
    pub async fn all_allocations(&self) -> Vec<WorkspaceAllocation> {
        self.tables.read().await.allocations.values().cloned().collect()
    }
}

fn oldest_first(mut nodes: Vec<DedicatedNode>) -> Vec<DedicatedNode> {
    nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    nodes
}

fn newest_first<'a>(events: impl Iterator<Item = &'a NodeEvent>, limit: usize) -> Vec<NodeEvent> {
    let mut events: Vec<NodeEvent> = events.cloned().collect();
    events.sort_by(|a, b| b.seq.cmp(&a.seq));
    events.truncate(limit);
    events
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_allocation(
        &self,
        workspace_id: WorkspaceId,
    ) -> StoreResult<Option<WorkspaceAllocation>> {
        Ok(self.tables.read().await.allocations.get(&workspace_id).cloned())
    }

    async fn insert_allocation(
        &self,
        allocation: &WorkspaceAllocation,
    ) -> StoreResult<WorkspaceAllocation> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .allocations
            .entry(allocation.workspace_id)
            .or_insert_with(|| allocation.clone());
        Ok(stored.clone())
    }

    async fn update_allocation(
        &self,
        allocation: &WorkspaceAllocation,
    ) -> StoreResult<WorkspaceAllocation> {
        let mut tables = self.tables.write().await;
        let current = tables
            .allocations
            .get_mut(&allocation.workspace_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "allocation",
                id: allocation.workspace_id.to_string(),
            })?;

        if current.version != allocation.version || current.id != allocation.id {
            return Err(StoreError::VersionConflict {
                entity: "allocation",
                id: allocation.id.to_string(),
                expected: allocation.version,
            });
        }
        if !allocation.is_consistent() {
            return Err(StoreError::Rejected {
                entity: "allocation",
                id: allocation.id.to_string(),
                reason: "capacity violates allocation invariants".to_string(),
            });
        }

        let mut next = allocation.clone();
        next.version += 1;
        *current = next.clone();
        Ok(next)
    }

    async fn insert_node(&self, node: &DedicatedNode) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if tables.nodes.contains_key(&node.id) {
            return Err(StoreError::Duplicate {
                entity: "node",
                detail: node.id.to_string(),
            });
        }
        tables.nodes.insert(node.id, node.clone());
        Ok(())
    }

    async fn update_node(&self, node: &DedicatedNode) -> StoreResult<DedicatedNode> {
        let mut tables = self.tables.write().await;

        if let Some(external_id) = &node.external_id {
            let taken = tables.nodes.values().any(|other| {
                other.id != node.id
                    && other.workspace_id == node.workspace_id
                    && other.external_id.as_ref() == Some(external_id)
            });
            if taken {
                return Err(StoreError::Duplicate {
                    entity: "node external id",
                    detail: format!("{} in {}", external_id, node.workspace_id),
                });
            }
        }

        let current = tables
            .nodes
            .get_mut(&node.id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "node",
                id: node.id.to_string(),
            })?;

        if current.version != node.version {
            return Err(StoreError::VersionConflict {
                entity: "node",
                id: node.id.to_string(),
                expected: node.version,
            });
        }
        validate_node_write(current, node)?;

        let mut next = node.clone();
        next.version += 1;
        *current = next.clone();
        Ok(next)
    }

    async fn get_node(&self, node_id: NodeId) -> StoreResult<Option<DedicatedNode>> {
        Ok(self.tables.read().await.nodes.get(&node_id).cloned())
    }

    async fn find_node_by_external_id(
        &self,
        workspace_id: WorkspaceId,
        external_id: &ExternalNodeId,
    ) -> StoreResult<Option<DedicatedNode>> {
        Ok(self
            .tables
            .read()
            .await
            .nodes
            .values()
            .find(|n| n.workspace_id == workspace_id && n.external_id.as_ref() == Some(external_id))
            .cloned())
    }

    async fn list_nodes(
        &self,
        workspace_id: WorkspaceId,
        include_deleted: bool,
    ) -> StoreResult<Vec<DedicatedNode>> {
        let tables = self.tables.read().await;
        let nodes = tables
            .nodes
            .values()
            .filter(|n| n.workspace_id == workspace_id)
            .filter(|n| include_deleted || !n.state.is_deleted())
            .cloned()
            .collect();
        Ok(oldest_first(nodes))
    }

    async fn list_nodes_in_states(
        &self,
        states: &[NodeLifecycleState],
    ) -> StoreResult<Vec<DedicatedNode>> {
        let tables = self.tables.read().await;
        let nodes = tables
            .nodes
            .values()
            .filter(|n| states.contains(&n.state))
            .cloned()
            .collect();
        Ok(oldest_first(nodes))
    }

    async fn append_event(&self, event: NewNodeEvent) -> StoreResult<NodeEvent> {
        if self.fail_event_appends.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("event appends disabled".to_string()));
        }

        let mut tables = self.tables.write().await;
        let seq = EventSeq::new(tables.events.len() as i64 + 1);
        let stored = event.into_stored(seq);
        tables.events.push(stored.clone());
        Ok(stored)
    }

    async fn list_node_events(
        &self,
        node_id: NodeId,
        limit: usize,
    ) -> StoreResult<Vec<NodeEvent>> {
        let tables = self.tables.read().await;
        Ok(newest_first(
            tables.events.iter().filter(|e| e.node_id == Some(node_id)),
            limit,
        ))
    }

    async fn list_workspace_events(
        &self,
        workspace_id: WorkspaceId,
        limit: usize,
    ) -> StoreResult<Vec<NodeEvent>> {
        let tables = self.tables.read().await;
        Ok(newest_first(
            tables.events.iter().filter(|e| e.workspace_id == workspace_id),
            limit,
        ))
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use capacity_events::NodeEventType;

    use super::*;
    use crate::catalog::PlanCatalog;

    fn shared_allocation(ws: WorkspaceId) -> WorkspaceAllocation {
        let catalog = PlanCatalog::builtin().unwrap();
        WorkspaceAllocation::new_shared(ws, catalog.baseline_plan())
    }

    #[tokio::test]
    async fn test_insert_allocation_keeps_first_row() {
        let store = MemoryStore::new();
        let ws = WorkspaceId::new();

        let first = store.insert_allocation(&shared_allocation(ws)).await.unwrap();
        let second = store.insert_allocation(&shared_allocation(ws)).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.all_allocations().await.len(), 1);
    }

    #[tokio::test]
    async fn test_update_allocation_checks_version() {
        let store = MemoryStore::new();
        let stored = store
            .insert_allocation(&shared_allocation(WorkspaceId::new()))
            .await
            .unwrap();

        let updated = store.update_allocation(&stored).await.unwrap();
        assert_eq!(updated.version, stored.version + 1);

        let err = store.update_allocation(&stored).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn test_external_id_unique_per_workspace() {
        let store = MemoryStore::new();
        let ws = WorkspaceId::new();
        let external = ExternalNodeId::parse("vm-100").unwrap();

        let mut a = DedicatedNode::new(ws, "m-type-plan");
        let b = DedicatedNode::new(ws, "m-type-plan");
        store.insert_node(&a).await.unwrap();
        store.insert_node(&b).await.unwrap();

        a.external_id = Some(external.clone());
        a.state = NodeLifecycleState::Provisioning;
        store.update_node(&a).await.unwrap();

        let mut b2 = b.clone();
        b2.external_id = Some(external.clone());
        let err = store.update_node(&b2).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { .. }));

        // The same external id in another workspace is fine.
        let mut other = DedicatedNode::new(WorkspaceId::new(), "m-type-plan");
        store.insert_node(&other).await.unwrap();
        other.external_id = Some(external.clone());
        store.update_node(&other).await.unwrap();

        let found = store.find_node_by_external_id(ws, &external).await.unwrap();
        assert_eq!(found.map(|n| n.id), Some(a.id));
    }

    #[tokio::test]
    async fn test_events_listed_newest_first() {
        let store = MemoryStore::new();
        let ws = WorkspaceId::new();
        let node = NodeId::new();

        for event_type in [
            NodeEventType::Created,
            NodeEventType::Bound,
            NodeEventType::Activated,
        ] {
            store
                .append_event(NewNodeEvent::for_node(node, ws, event_type, ""))
                .await
                .unwrap();
        }
        store
            .append_event(NewNodeEvent::for_workspace(ws, NodeEventType::QuotaBreached, "cpu"))
            .await
            .unwrap();

        let events = store.list_node_events(node, 2).await.unwrap();
        let types: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec![NodeEventType::Activated, NodeEventType::Bound]);

        let all = store.list_workspace_events(ws, 10).await.unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].event_type, NodeEventType::QuotaBreached);
    }
}
