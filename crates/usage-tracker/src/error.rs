//! Error types for usage snapshot persistence

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("usage snapshot I/O failed: {0}")]
    Io(String),

    #[error("usage snapshot serialization failed: {0}")]
    Serialize(String),
}

impl From<common::Error> for Error {
    fn from(e: common::Error) -> Self {
        Error::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
