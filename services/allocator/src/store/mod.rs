//! Persistence for allocations, nodes and the event history.
//!
//! Allocations and nodes use optimistic concurrency: every row carries a
//! `version`, and an update only applies when the caller's copy still holds
//! the stored version. The stored version is then incremented. Events are
//! append-only; the store assigns each one a monotonically increasing `seq`.
//!
//! Two implementations are provided:
//! - [`MemoryStore`] for tests and local runs
//! - [`PgStore`] backed by Postgres via SQLx

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{Database, DbConfig, PgStore};

use async_trait::async_trait;
use capacity_events::{NewNodeEvent, NodeEvent, NodeLifecycleState};
use capacity_id::{ExternalNodeId, NodeId, WorkspaceId};
use thiserror::Error;

use crate::model::{DedicatedNode, WorkspaceAllocation};

pub type StoreResult<T> = Result<T, StoreError>;

/// Store operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another writer updated the row first.
    #[error("version conflict on {entity} {id}: expected version {expected}")]
    VersionConflict {
        entity: &'static str,
        id: String,
        expected: i64,
    },

    /// A uniqueness constraint was violated.
    #[error("duplicate {entity}: {detail}")]
    Duplicate { entity: &'static str, detail: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A write would break a stored-row invariant.
    #[error("rejected write to {entity} {id}: {reason}")]
    Rejected {
        entity: &'static str,
        id: String,
        reason: String,
    },

    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    #[error("migration directory not found; tried {tried}. Last error: {last_error}")]
    MigrationDirNotFound { tried: String, last_error: String },

    /// A stored row could not be decoded.
    #[error("corrupt {entity} row: {detail}")]
    Corrupt { entity: &'static str, detail: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Injected by [`MemoryStore`] in tests.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::VersionConflict { .. } | Self::Connect(_) | Self::Unavailable(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Engine persistence.
#[async_trait]
pub trait Store: Send + Sync {
    // -------------------------------------------------------------------------
    // Allocations
    // -------------------------------------------------------------------------

    async fn get_allocation(
        &self,
        workspace_id: WorkspaceId,
    ) -> StoreResult<Option<WorkspaceAllocation>>;

    /// Inserts the allocation unless the workspace already has one, and
    /// returns whichever row ends up stored.
    async fn insert_allocation(
        &self,
        allocation: &WorkspaceAllocation,
    ) -> StoreResult<WorkspaceAllocation>;

    /// Writes `allocation` if the stored version equals `allocation.version`.
    /// Returns the stored row with the incremented version.
    async fn update_allocation(
        &self,
        allocation: &WorkspaceAllocation,
    ) -> StoreResult<WorkspaceAllocation>;

    // -------------------------------------------------------------------------
    // Nodes
    // -------------------------------------------------------------------------

    async fn insert_node(&self, node: &DedicatedNode) -> StoreResult<()>;

    /// Versioned node update. Fails with `Duplicate` when the external id is
    /// already bound to another node of the workspace.
    async fn update_node(&self, node: &DedicatedNode) -> StoreResult<DedicatedNode>;

    async fn get_node(&self, node_id: NodeId) -> StoreResult<Option<DedicatedNode>>;

    async fn find_node_by_external_id(
        &self,
        workspace_id: WorkspaceId,
        external_id: &ExternalNodeId,
    ) -> StoreResult<Option<DedicatedNode>>;

    /// Nodes of a workspace, oldest first.
    async fn list_nodes(
        &self,
        workspace_id: WorkspaceId,
        include_deleted: bool,
    ) -> StoreResult<Vec<DedicatedNode>>;

    /// Nodes in any of `states` across all workspaces, oldest first.
    async fn list_nodes_in_states(
        &self,
        states: &[NodeLifecycleState],
    ) -> StoreResult<Vec<DedicatedNode>>;

    // -------------------------------------------------------------------------
    // Events
    // -------------------------------------------------------------------------

    async fn append_event(&self, event: NewNodeEvent) -> StoreResult<NodeEvent>;

    /// Events of one node, newest first.
    async fn list_node_events(&self, node_id: NodeId, limit: usize)
        -> StoreResult<Vec<NodeEvent>>;

    /// Events of a workspace (node and workspace scoped), newest first.
    async fn list_workspace_events(
        &self,
        workspace_id: WorkspaceId,
        limit: usize,
    ) -> StoreResult<Vec<NodeEvent>>;

    async fn health_check(&self) -> StoreResult<()>;
}

/// Row-level checks shared by both implementations.
pub(crate) fn validate_node_write(
    current: &DedicatedNode,
    next: &DedicatedNode,
) -> StoreResult<()> {
    let rejected = |reason: &str| StoreError::Rejected {
        entity: "node",
        id: next.id.to_string(),
        reason: reason.to_string(),
    };

    if current.deleted_at.is_some() && current.deleted_at != next.deleted_at {
        return Err(rejected("deleted_at is immutable once set"));
    }
    if next.state.is_deleted() != next.deleted_at.is_some() {
        return Err(rejected("deleted_at must be set exactly when deleted"));
    }
    if current.workspace_id != next.workspace_id {
        return Err(rejected("workspace_id is immutable"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_classification() {
        assert!(StoreError::VersionConflict {
            entity: "allocation",
            id: "alloc_1".into(),
            expected: 1,
        }
        .is_retryable());
        assert!(!StoreError::Duplicate {
            entity: "node",
            detail: "x".into(),
        }
        .is_retryable());
        assert!(StoreError::NotFound {
            entity: "node",
            id: "node_1".into(),
        }
        .is_not_found());
    }

    #[test]
    fn test_deleted_at_is_immutable() {
        let mut node = DedicatedNode::new(WorkspaceId::new(), "m-type-plan");
        node.state = NodeLifecycleState::Deleted;
        node.deleted_at = Some(chrono::Utc::now());

        let mut next = node.clone();
        next.deleted_at = Some(chrono::Utc::now() + chrono::Duration::seconds(5));
        assert!(matches!(
            validate_node_write(&node, &next),
            Err(StoreError::Rejected { .. })
        ));
    }
}
