//! Node and workspace capacity allocation engine.
//!
//! This crate primarily ships an `allocator` binary that runs reconciliation,
//! but the engine itself is a library so that it can be embedded and tested.
//!
//! A workspace is always in exactly one of two capacity modes:
//! - **shared**: a cpu/memory quota on shared infrastructure, tracked by the
//!   [`ledger::QuotaLedger`]
//! - **dedicated**: a set of nodes owned by the workspace, tracked by the
//!   [`registry::NodeRegistry`]
//!
//! The [`coordinator::AllocationCoordinator`] is the only component that moves
//! a workspace between plans.

pub mod catalog;
pub mod collaborators;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod locks;
pub mod model;
pub mod observer;
pub mod reconciler;
pub mod recorder;
pub mod registry;
pub mod store;

pub use catalog::{Plan, PlanCatalog, PlanKind, ResourceEnvelope};
pub use engine::CapacityEngine;
pub use error::{CapacityError, CapacityResult, ErrorClass, QuotaDimension};
pub use model::{
    AllocationCapacity, DedicatedNode, ResourceDelta, ResourceUsage, SharedQuota,
    WorkspaceAllocation, WorkspaceUsage,
};
