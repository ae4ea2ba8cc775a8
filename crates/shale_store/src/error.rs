//! Status errors for the request and lifecycle paths.
//!
//! Startup and shutdown errors are surfaced to the caller (the process exits
//! non-zero), per-request errors become RESP error replies and the session
//! continues, and per-shard stop/destroy errors are logged but do not abort
//! the overall teardown.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("protocol error: {0}")]
    ParsePacket(String),

    #[error("{0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("commit conflict, retry: {0}")]
    CommitRetry(String),
}

impl Error {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    pub fn busy(msg: impl Into<String>) -> Self {
        Error::Busy(msg.into())
    }

    pub fn parse_packet(msg: impl Into<String>) -> Self {
        Error::ParsePacket(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Error::Auth(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Error::Network(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<fjall::Error> for Error {
    fn from(err: fjall::Error) -> Self {
        Error::Internal(format!("storage: {err}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Network(format!("io: {err}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("decode: {err}"))
    }
}
