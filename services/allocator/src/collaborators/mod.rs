//! External collaborators: the hypervisor that creates VMs and the metrics
//! pipeline that reports their usage.
//!
//! Both are injected as trait objects. HTTP clients are provided for the
//! binary, mocks for tests and local runs.

pub mod hypervisor;
pub mod metrics;

pub use hypervisor::{
    HttpHypervisor, Hypervisor, HypervisorStatus, MockHypervisor, NodeSpec,
};
pub use metrics::{HttpMetricsSource, MetricsSource, MockMetricsSource, UsageSample};

use thiserror::Error;

/// Errors reported by a collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollaboratorError {
    /// The collaborator has no record of the resource.
    #[error("not found: {0}")]
    NotFound(String),

    /// The collaborator refused the request.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The collaborator could not be reached or failed internally.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl CollaboratorError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<reqwest::Error> for CollaboratorError {
    fn from(e: reqwest::Error) -> Self {
        Self::Unavailable(e.to_string())
    }
}

/// Maps a non-success HTTP response onto a collaborator error.
pub(crate) async fn error_from_response(
    what: &str,
    response: reqwest::Response,
) -> CollaboratorError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = format!("{what}: {status} - {body}");

    if status == reqwest::StatusCode::NOT_FOUND {
        CollaboratorError::NotFound(message)
    } else if status.is_client_error() {
        CollaboratorError::Rejected(message)
    } else {
        CollaboratorError::Unavailable(message)
    }
}
