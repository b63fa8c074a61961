//! Error handling for Seedkeep

use thiserror::Error;

use crate::engine::EngineError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("protocol engine error: {0}")]
    Engine(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("channel error: {0}")]
    Channel(String),
}

/// Failure categories surfaced to API callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidInput,
    Timeout,
    PermissionDenied,
    Internal,
}

impl ErrorKind {
    /// HTTP status code a transport should answer with
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::InvalidInput => 400,
            ErrorKind::Timeout => 504,
            ErrorKind::PermissionDenied => 403,
            ErrorKind::Internal => 500,
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::InvalidInput(_) | Error::Parse(_) => ErrorKind::InvalidInput,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Error::Cancelled
            | Error::Engine(_)
            | Error::Database(_)
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::Sqlite(_)
            | Error::Channel(_) => ErrorKind::Internal,
        }
    }
}

impl From<EngineError> for Error {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotFound(msg) => Error::NotFound(msg),
            EngineError::Rejected(msg) => Error::InvalidInput(msg),
            other => Error::Engine(other.to_string()),
        }
    }
}

impl<T> From<async_channel::SendError<T>> for Error {
    fn from(err: async_channel::SendError<T>) -> Self {
        Error::Channel(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(Error::NotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(Error::Parse("x".into()).kind(), ErrorKind::InvalidInput);
        assert_eq!(Error::Timeout("x".into()).kind().http_status(), 504);
        assert_eq!(
            Error::PermissionDenied("x".into()).kind().http_status(),
            403
        );
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_engine_error_conversion() {
        let err: Error = EngineError::NotFound("abc".into()).into();
        assert!(matches!(err, Error::NotFound(_)));

        let err: Error = EngineError::Unavailable("session closed".into()).into();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
