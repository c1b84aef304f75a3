//! Error types for event handling.

use thiserror::Error;

/// Errors that can occur when decoding events or lifecycle states.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The event type is unknown.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// The lifecycle state name is unknown.
    #[error("unknown node lifecycle state: {0}")]
    UnknownState(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
