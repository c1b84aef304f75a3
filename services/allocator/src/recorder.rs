//! Event recorder.
//!
//! Appends lifecycle and quota events to the history. Recording never
//! fails the operation that triggered it: a store failure is logged and
//! the event is dropped.

use std::sync::Arc;

use capacity_events::{NewNodeEvent, NodeEvent, NodeEventType};
use capacity_id::{NodeId, WorkspaceId};
use tracing::{debug, warn};

use crate::error::CapacityResult;
use crate::store::Store;

#[derive(Clone)]
pub struct EventRecorder {
    store: Arc<dyn Store>,
}

impl EventRecorder {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Records an event about one node.
    pub async fn record(
        &self,
        node_id: NodeId,
        workspace_id: WorkspaceId,
        event_type: NodeEventType,
        detail: impl Into<String>,
    ) {
        self.append(NewNodeEvent::for_node(node_id, workspace_id, event_type, detail))
            .await;
    }

    /// Records an event about a workspace as a whole.
    pub async fn record_workspace(
        &self,
        workspace_id: WorkspaceId,
        event_type: NodeEventType,
        detail: impl Into<String>,
    ) {
        self.append(NewNodeEvent::for_workspace(workspace_id, event_type, detail))
            .await;
    }

    async fn append(&self, event: NewNodeEvent) {
        let event_type = event.event_type;
        let workspace_id = event.workspace_id;
        let node_id = event.node_id;

        match self.store.append_event(event).await {
            Ok(stored) => {
                debug!(
                    seq = %stored.seq,
                    event_type = %event_type,
                    workspace_id = %workspace_id,
                    "Recorded event"
                );
            }
            Err(e) => {
                warn!(
                    error = %e,
                    event_type = %event_type,
                    workspace_id = %workspace_id,
                    node_id = ?node_id.map(|id| id.to_string()),
                    "Failed to record event"
                );
            }
        }
    }

    /// Most recent events of a node, newest first.
    pub async fn list_events(&self, node_id: NodeId, limit: usize) -> CapacityResult<Vec<NodeEvent>> {
        Ok(self.store.list_node_events(node_id, limit).await?)
    }

    /// Most recent events of a workspace and its nodes, newest first.
    pub async fn list_workspace_events(
        &self,
        workspace_id: WorkspaceId,
        limit: usize,
    ) -> CapacityResult<Vec<NodeEvent>> {
        Ok(self.store.list_workspace_events(workspace_id, limit).await?)
    }
}
