//! Background reconciliation of dedicated nodes.
//!
//! Repairs what interrupted operations leave behind:
//! - nodes stuck pending past a grace period are activated or removed
//! - nodes stuck decommissioning have their teardown finished
//! - active nodes no allocation references are decommissioned

mod pass;
mod worker;

pub use pass::{ReconcileStats, Reconciler};
pub use worker::ReconcileWorker;
