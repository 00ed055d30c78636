//! Error types for virtkube

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("hypervisor connection failed: {0}")]
    ConnectionFailed(String),

    #[error("domain not found: {0}")]
    DomainNotFound(String),

    #[error("invalid state: VM is {current}, expected {expected}")]
    InvalidState { current: String, expected: String },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("operation timed out: {0}")]
    OperationTimeout(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<virt::error::Error> for Error {
    fn from(e: virt::error::Error) -> Self {
        Error::Internal(e.to_string())
    }
}

impl Error {
    /// Build an `InvalidState` from a state's display form.
    pub fn invalid_state(current: impl ToString, expected: impl Into<String>) -> Self {
        Error::InvalidState {
            current: current.to_string(),
            expected: expected.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed(_) | Error::OperationTimeout(_) | Error::Internal(_)
        )
    }
}
