//! Error taxonomy for the realtime core.
//!
//! Every public operation returns [`Result<T>`]; the nine kinds below are
//! the full classification callers need to decide whether to retry.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid: {0}")]
    Invalid(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("full: {0}")]
    Full(String),

    #[error("closed: {0}")]
    Closed(String),

    #[error("shutting down")]
    ShuttingDown,

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Timeout(_) | CoreError::Full(_))
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for CoreError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        CoreError::Internal(format!("channel closed: {e}"))
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for CoreError {
    fn from(e: tokio::sync::oneshot::error::RecvError) -> Self {
        CoreError::Internal(format!("callback dropped: {e}"))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Invalid(format!("malformed json: {e}"))
    }
}
