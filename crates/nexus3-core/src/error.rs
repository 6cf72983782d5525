//! Crate-wide error kinds, following the ten categories laid out for error
//! handling: validation, permission, confirmation, provider, cancellation,
//! timeout, storage, persistence, symlink and security failures.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("confirmation denied by user")]
    ConfirmationDenied,

    #[error("provider error: {0}")]
    Provider(String),

    #[error("cancelled")]
    Cancelled,

    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("refused to follow symlink at {0}")]
    Symlink(std::path::PathBuf),

    #[error("security policy violation: {0}")]
    Security(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn permission(msg: impl Into<String>) -> Self {
        Error::Permission(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Error::Persistence(msg.into())
    }

    pub fn security(msg: impl Into<String>) -> Self {
        Error::Security(msg.into())
    }

    /// Cancellation is never surfaced as an error to the end user; it is a
    /// silent stream end. This predicate lets call sites distinguish the
    /// case where propagation should stop quietly.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
