//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("account not found: {0}")]
    NotFound(String),

    #[error("credential error: {0}")]
    Credential(String),

    #[error("pool persistence failed: {0}")]
    Persist(String),
}

impl From<common::Error> for Error {
    fn from(e: common::Error) -> Self {
        Error::Persist(e.to_string())
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
