//! Stored event records.

use capacity_id::{EventSeq, NodeEventId, NodeId, WorkspaceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::NodeEventType;

/// An event as it sits in the append-only history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEvent {
    pub id: NodeEventId,

    /// Position in the history; assigned by the store at append time.
    pub seq: EventSeq,

    /// The node the event describes. `None` for workspace-scoped events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,

    pub workspace_id: WorkspaceId,
    pub event_type: NodeEventType,
    pub timestamp: DateTime<Utc>,
    pub detail: String,
}

/// An event that has not been appended yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewNodeEvent {
    pub id: NodeEventId,
    pub node_id: Option<NodeId>,
    pub workspace_id: WorkspaceId,
    pub event_type: NodeEventType,
    pub timestamp: DateTime<Utc>,
    pub detail: String,
}

impl NewNodeEvent {
    /// An event about a single node.
    pub fn for_node(
        node_id: NodeId,
        workspace_id: WorkspaceId,
        event_type: NodeEventType,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: NodeEventId::new(),
            node_id: Some(node_id),
            workspace_id,
            event_type,
            timestamp: Utc::now(),
            detail: detail.into(),
        }
    }

    /// An event about a workspace as a whole (quota, plan changes).
    pub fn for_workspace(
        workspace_id: WorkspaceId,
        event_type: NodeEventType,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: NodeEventId::new(),
            node_id: None,
            workspace_id,
            event_type,
            timestamp: Utc::now(),
            detail: detail.into(),
        }
    }

    /// Overrides the timestamp; mostly useful for deterministic tests.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Turns the pending event into a stored one at `seq`.
    pub fn into_stored(self, seq: EventSeq) -> NodeEvent {
        NodeEvent {
            id: self.id,
            seq,
            node_id: self.node_id,
            workspace_id: self.workspace_id,
            event_type: self.event_type,
            timestamp: self.timestamp,
            detail: self.detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_event_json_shape() {
        let node_id = NodeId::new();
        let event = NewNodeEvent::for_node(
            node_id,
            WorkspaceId::new(),
            NodeEventType::Activated,
            "hypervisor reports running",
        )
        .into_stored(EventSeq::new(7));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "activated");
        assert_eq!(json["seq"], 7);
        assert_eq!(json["node_id"], node_id.to_string());
    }

    #[test]
    fn test_workspace_event_omits_node_id() {
        let event = NewNodeEvent::for_workspace(
            WorkspaceId::new(),
            NodeEventType::QuotaBreached,
            "cpu",
        )
        .into_stored(EventSeq::new(1));

        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("node_id").is_none());
        let parsed: NodeEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, event);
    }
}
