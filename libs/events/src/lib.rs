//! # capacity-events
//!
//! Node lifecycle states and event definitions for the capacity allocation
//! engine.
//!
//! ## Design Principles
//!
//! - Events are immutable records of committed state transitions
//! - A dedicated node only ever moves forward through its lifecycle
//! - Rejected transitions are recorded too, so misuse is auditable
//! - Events for one node are ordered; there is no global ordering requirement
//!
//! ## Lifecycle
//!
//! ```text
//! PendingCreation ─▶ Provisioning ─▶ Active ─▶ Decommissioning ─▶ Deleted
//!        │                 │                                         ▲
//!        └─────────────────┴──────── failed provisioning ────────────┘
//! ```
//!
//! ## Event Types
//!
//! - Node events (`node.*`): one per lifecycle transition, plus
//!   provisioning failures and rejected transitions
//! - Quota events (`quota.*`): breaches and limit changes on shared plans
//! - Allocation events (`allocation.*`): plan changes on a workspace

mod error;
mod record;
mod types;

pub use error::EventError;
pub use record::*;
pub use types::*;
