//! Session-crate error kinds: storage, persistence and symlink failures
//! layered on top of `nexus3_core::Error`, plus the conversions needed so
//! `?` works across the SQLite/filesystem boundary.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("refused to follow symlink at {0}")]
    Symlink(PathBuf),

    #[error("missing parent directory for {0}")]
    MissingParentDir(PathBuf),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("core error: {0}")]
    Core(#[from] nexus3_core::Error),
}

impl From<rusqlite::Error> for SessionError {
    fn from(e: rusqlite::Error) -> Self {
        SessionError::Storage(e.to_string())
    }
}

impl From<SessionError> for nexus3_core::Error {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Storage(msg) => nexus3_core::Error::Storage(msg),
            SessionError::Persistence(msg) => nexus3_core::Error::Persistence(msg),
            SessionError::Symlink(p) => nexus3_core::Error::Symlink(p),
            SessionError::MissingParentDir(p) => {
                nexus3_core::Error::Storage(format!("missing parent directory: {}", p.display()))
            }
            SessionError::SessionNotFound(id) => nexus3_core::Error::SessionNotFound(id),
            SessionError::Io(e) => nexus3_core::Error::Io(e),
            SessionError::Json(e) => nexus3_core::Error::Json(e),
            SessionError::Core(e) => e,
        }
    }
}
