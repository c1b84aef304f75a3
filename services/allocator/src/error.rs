//! Engine error types.

use std::time::Duration;

use capacity_events::NodeLifecycleState;
use capacity_id::{ExternalNodeId, NodeId, WorkspaceId};
use thiserror::Error;

use crate::catalog::CatalogError;
use crate::store::StoreError;

/// Result alias used throughout the engine.
pub type CapacityResult<T> = Result<T, CapacityError>;

/// A quota dimension that can be exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaDimension {
    Cpu,
    Memory,
}

impl QuotaDimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
        }
    }

    /// Unit the ledger counts this dimension in.
    pub fn unit(&self) -> &'static str {
        match self {
            Self::Cpu => "millicores",
            Self::Memory => "bytes",
        }
    }
}

impl std::fmt::Display for QuotaDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a caller should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input; retrying the same call will fail the same way.
    Client,
    /// Request conflicts with current state (quota, lifecycle, plan).
    Conflict,
    /// Transient; the same call may succeed later.
    Retryable,
    /// A read-only view could not be produced.
    Degraded,
    /// Unexpected internal failure.
    Internal,
}

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum CapacityError {
    #[error("plan not found: {0}")]
    PlanNotFound(String),

    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("no allocation for workspace {0}")]
    AllocationNotFound(WorkspaceId),

    #[error(
        "quota exceeded for workspace {workspace_id} on {dimension}: requested {requested} {unit}, \
         available {available} (limit {limit}, used {used})",
        unit = .dimension.unit()
    )]
    QuotaExceeded {
        workspace_id: WorkspaceId,
        dimension: QuotaDimension,
        requested: i64,
        available: i64,
        limit: i64,
        used: i64,
    },

    #[error(
        "cannot shrink {dimension} limit of workspace {workspace_id} to {new_limit} {unit}: \
         {used} already in use",
        unit = .dimension.unit()
    )]
    QuotaShrinkBelowUsage {
        workspace_id: WorkspaceId,
        dimension: QuotaDimension,
        new_limit: i64,
        used: i64,
    },

    #[error("workspace {0} is not on a shared plan")]
    NotShared(WorkspaceId),

    #[error("node {node_id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        node_id: NodeId,
        from: NodeLifecycleState,
        to: NodeLifecycleState,
    },

    #[error("node {node_id} is already bound to {external_id}")]
    AlreadyBound {
        node_id: NodeId,
        external_id: ExternalNodeId,
    },

    #[error("external id {external_id} is already bound in workspace {workspace_id}")]
    ExternalIdInUse {
        workspace_id: WorkspaceId,
        external_id: ExternalNodeId,
    },

    #[error("provisioning node {node_id} timed out after {timeout:?}")]
    ProvisioningTimeout { node_id: NodeId, timeout: Duration },

    #[error("provisioning node {node_id} failed: {reason}")]
    ProvisioningFailed { node_id: NodeId, reason: String },

    #[error("usage for node {node_id} is unavailable: {reason}")]
    UsageUnavailable { node_id: NodeId, reason: String },

    #[error("usage for node {node_id} is stale ({age:?} old)")]
    UsageStale { node_id: NodeId, age: Duration },

    #[error("plan change for workspace {0} was cancelled")]
    Cancelled(WorkspaceId),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("plan catalog: {0}")]
    Catalog(#[from] CatalogError),

    #[error("store: {0}")]
    Store(#[from] StoreError),
}

impl CapacityError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::PlanNotFound(_)
            | Self::NodeNotFound(_)
            | Self::AllocationNotFound(_)
            | Self::InvalidRequest(_) => ErrorClass::Client,

            Self::QuotaExceeded { .. }
            | Self::QuotaShrinkBelowUsage { .. }
            | Self::NotShared(_)
            | Self::InvalidTransition { .. }
            | Self::AlreadyBound { .. }
            | Self::ExternalIdInUse { .. }
            | Self::Cancelled(_) => ErrorClass::Conflict,

            Self::ProvisioningTimeout { .. } | Self::ProvisioningFailed { .. } => {
                ErrorClass::Retryable
            }

            Self::UsageUnavailable { .. } | Self::UsageStale { .. } => ErrorClass::Degraded,

            Self::Catalog(_) => ErrorClass::Internal,

            Self::Store(e) if e.is_retryable() => ErrorClass::Retryable,
            Self::Store(e) if e.is_not_found() => ErrorClass::Client,
            Self::Store(_) => ErrorClass::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    /// The dimension named by a quota error, if any.
    pub fn quota_dimension(&self) -> Option<QuotaDimension> {
        match self {
            Self::QuotaExceeded { dimension, .. } | Self::QuotaShrinkBelowUsage { dimension, .. } => {
                Some(*dimension)
            }
            _ => None,
        }
    }
}
