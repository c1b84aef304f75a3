//! # capacity-id
//!
//! Stable ID types, parsing, and validation for the capacity allocation engine.
//!
//! ## Design Principles
//!
//! - Engine-assigned IDs are ULID-based and carry a resource prefix
//! - All IDs have a canonical string representation with strict parsing
//! - IDs are typed so a node ID can never be passed where a workspace ID is expected
//! - Handles issued by external systems (the hypervisor) stay opaque
//!
//! ## ID Format
//!
//! Engine resource IDs use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `ws_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `node_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `alloc_01HV4Z4NYPLTRS0JTUA8XDME5F`

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
