//! Request-surface error taxonomy.

use thiserror::Error;

/// Errors reported through operation responses.
///
/// `NotFound` and `InvalidRequest` stay in the response only; external and
/// artifact failures are additionally surfaced as events by their owners.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("external failure: {0}")]
    External(String),
    #[error("artifact parse failure: {0}")]
    ArtifactParse(String),
    #[error("terminal daemon unavailable: {0}")]
    DaemonUnavailable(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Stable machine tag for the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidRequest(_) => "invalid_request",
            Self::External(_) => "external_failure",
            Self::ArtifactParse(_) => "artifact_parse",
            Self::DaemonUnavailable(_) => "daemon_unavailable",
            Self::Io(_) => "io",
        }
    }
}
