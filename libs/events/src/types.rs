//! Lifecycle states and event type definitions.

use serde::{Deserialize, Serialize};

use crate::EventError;

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    // Node lifecycle
    pub const NODE_CREATED: &str = "node.created";
    pub const NODE_BOUND: &str = "node.bound";
    pub const NODE_ACTIVATED: &str = "node.activated";
    pub const NODE_DECOMMISSIONING: &str = "node.decommissioning";
    pub const NODE_DELETED: &str = "node.deleted";
    pub const NODE_TRANSITION_REJECTED: &str = "node.transition_rejected";
    pub const NODE_PROVISIONING_FAILED: &str = "node.provisioning_failed";
    pub const NODE_PROVISIONING_TIMED_OUT: &str = "node.provisioning_timed_out";

    // Shared quota
    pub const QUOTA_BREACHED: &str = "quota.breached";
    pub const QUOTA_RESIZED: &str = "quota.resized";

    // Allocation
    pub const ALLOCATION_PLAN_CHANGED: &str = "allocation.plan_changed";
}

// =============================================================================
// Node Lifecycle
// =============================================================================

/// Lifecycle state of a dedicated node.
///
/// The ordering of the variants is the lifecycle order; a legal transition
/// always moves to a strictly later variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeLifecycleState {
    PendingCreation,
    Provisioning,
    Active,
    Decommissioning,
    Deleted,
}

impl NodeLifecycleState {
    pub const ALL: [NodeLifecycleState; 5] = [
        Self::PendingCreation,
        Self::Provisioning,
        Self::Active,
        Self::Decommissioning,
        Self::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingCreation => "pending_creation",
            Self::Provisioning => "provisioning",
            Self::Active => "active",
            Self::Decommissioning => "decommissioning",
            Self::Deleted => "deleted",
        }
    }

    /// Position in the lifecycle, starting at 0.
    pub fn rank(&self) -> u8 {
        match self {
            Self::PendingCreation => 0,
            Self::Provisioning => 1,
            Self::Active => 2,
            Self::Decommissioning => 3,
            Self::Deleted => 4,
        }
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: NodeLifecycleState) -> bool {
        use NodeLifecycleState::*;
        matches!(
            (self, next),
            (PendingCreation, Provisioning)
                | (Provisioning, Active)
                | (Active, Decommissioning)
                | (Decommissioning, Deleted)
                | (PendingCreation, Deleted)
                | (Provisioning, Deleted)
        )
    }

    /// States a node passes through before it can serve workloads.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::PendingCreation | Self::Provisioning)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, Self::Deleted)
    }
}

impl std::fmt::Display for NodeLifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeLifecycleState {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| EventError::UnknownState(s.to_string()))
    }
}

// =============================================================================
// Event Types
// =============================================================================

/// Kind of an entry in the event history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeEventType {
    Created,
    Bound,
    Activated,
    Decommissioning,
    Deleted,
    TransitionRejected,
    ProvisioningFailed,
    ProvisioningTimedOut,
    QuotaBreached,
    QuotaResized,
    PlanChanged,
}

impl NodeEventType {
    const ALL: [NodeEventType; 11] = [
        Self::Created,
        Self::Bound,
        Self::Activated,
        Self::Decommissioning,
        Self::Deleted,
        Self::TransitionRejected,
        Self::ProvisioningFailed,
        Self::ProvisioningTimedOut,
        Self::QuotaBreached,
        Self::QuotaResized,
        Self::PlanChanged,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => event_types::NODE_CREATED,
            Self::Bound => event_types::NODE_BOUND,
            Self::Activated => event_types::NODE_ACTIVATED,
            Self::Decommissioning => event_types::NODE_DECOMMISSIONING,
            Self::Deleted => event_types::NODE_DELETED,
            Self::TransitionRejected => event_types::NODE_TRANSITION_REJECTED,
            Self::ProvisioningFailed => event_types::NODE_PROVISIONING_FAILED,
            Self::ProvisioningTimedOut => event_types::NODE_PROVISIONING_TIMED_OUT,
            Self::QuotaBreached => event_types::QUOTA_BREACHED,
            Self::QuotaResized => event_types::QUOTA_RESIZED,
            Self::PlanChanged => event_types::ALLOCATION_PLAN_CHANGED,
        }
    }

    /// The event recorded when a node enters `state`.
    pub fn for_state(state: NodeLifecycleState) -> Self {
        match state {
            NodeLifecycleState::PendingCreation => Self::Created,
            NodeLifecycleState::Provisioning => Self::Bound,
            NodeLifecycleState::Active => Self::Activated,
            NodeLifecycleState::Decommissioning => Self::Decommissioning,
            NodeLifecycleState::Deleted => Self::Deleted,
        }
    }

    /// The lifecycle state this event moved a node into, if it is a
    /// transition event.
    pub fn resulting_state(&self) -> Option<NodeLifecycleState> {
        match self {
            Self::Created => Some(NodeLifecycleState::PendingCreation),
            Self::Bound => Some(NodeLifecycleState::Provisioning),
            Self::Activated => Some(NodeLifecycleState::Active),
            Self::Decommissioning => Some(NodeLifecycleState::Decommissioning),
            Self::Deleted => Some(NodeLifecycleState::Deleted),
            _ => None,
        }
    }

    /// Whether this event describes a workspace rather than a single node.
    pub fn is_workspace_scoped(&self) -> bool {
        matches!(
            self,
            Self::QuotaBreached | Self::QuotaResized | Self::PlanChanged
        )
    }
}

impl std::fmt::Display for NodeEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeEventType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EventError::UnknownEventType(s.to_string()))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;
    use NodeLifecycleState::*;

    #[rstest]
    #[case(PendingCreation, Provisioning, true)]
    #[case(Provisioning, Active, true)]
    #[case(Active, Decommissioning, true)]
    #[case(Decommissioning, Deleted, true)]
    #[case(PendingCreation, Deleted, true)]
    #[case(Provisioning, Deleted, true)]
    #[case(PendingCreation, Active, false)]
    #[case(Active, Deleted, false)]
    #[case(Active, Provisioning, false)]
    #[case(Deleted, PendingCreation, false)]
    #[case(Decommissioning, Active, false)]
    #[case(Active, Active, false)]
    fn test_transition_table(
        #[case] from: NodeLifecycleState,
        #[case] to: NodeLifecycleState,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn test_legal_transitions_only_move_forward() {
        for from in NodeLifecycleState::ALL {
            for to in NodeLifecycleState::ALL {
                if from.can_transition_to(to) {
                    assert!(to.rank() > from.rank(), "{from} -> {to} goes backwards");
                }
            }
        }
    }

    #[test]
    fn test_deleted_is_terminal() {
        for to in NodeLifecycleState::ALL {
            assert!(!Deleted.can_transition_to(to));
        }
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(
            serde_json::to_string(&PendingCreation).unwrap(),
            "\"pending_creation\""
        );
        for state in NodeLifecycleState::ALL {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state.as_str()));
            let parsed: NodeLifecycleState = state.as_str().parse().unwrap();
            assert_eq!(parsed, state);
        }
    }

    #[test]
    fn test_unknown_state() {
        let err = "ready".parse::<NodeLifecycleState>().unwrap_err();
        assert_eq!(err, EventError::UnknownState("ready".to_string()));
    }

    #[test]
    fn test_event_type_names() {
        assert_eq!(NodeEventType::Created.as_str(), "node.created");
        assert_eq!(NodeEventType::QuotaBreached.as_str(), "quota.breached");
        for t in NodeEventType::ALL {
            assert_eq!(t.as_str().parse::<NodeEventType>().unwrap(), t);
        }
        assert!("node.exploded".parse::<NodeEventType>().is_err());
    }

    #[test]
    fn test_for_state_matches_resulting_state() {
        for state in NodeLifecycleState::ALL {
            assert_eq!(NodeEventType::for_state(state).resulting_state(), Some(state));
        }
        assert_eq!(NodeEventType::TransitionRejected.resulting_state(), None);
    }

    proptest! {
        #[test]
        fn prop_parsed_names_display_unchanged(s in "[a-z_.]{1,32}") {
            if let Ok(state) = s.parse::<NodeLifecycleState>() {
                prop_assert_eq!(state.to_string(), s.clone());
            }
            if let Ok(event_type) = s.parse::<NodeEventType>() {
                prop_assert_eq!(event_type.to_string(), s);
            }
        }

        #[test]
        fn prop_random_walk_never_moves_backwards(steps in prop::collection::vec(0usize..5, 0..40)) {
            let mut state = PendingCreation;
            for step in steps {
                let to = NodeLifecycleState::ALL[step];
                if state.can_transition_to(to) {
                    prop_assert!(to.rank() > state.rank());
                    state = to;
                }
            }
        }
    }
}
