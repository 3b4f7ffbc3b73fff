//! Core error types.

use thiserror::Error;

/// Which layer an error belongs to, for callers that report structured
/// diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDomain {
    /// Document-level conditions, reported as HTTP status codes.
    Http,
    /// Conditions surfaced from the storage layer.
    Storage,
    /// Unexpected internal failures.
    Core,
}

/// Core database errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Key or document absent.
    #[error("not found")]
    NotFound,

    /// Disallowed concurrent branch, or duplicate revision with a
    /// different body.
    #[error("revision conflict")]
    Conflict,

    /// Malformed revision id, non-monotone history, or bad inputs.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Revision body has been compacted away.
    #[error("revision body is gone")]
    Gone,

    /// Write attempted on a read-only database.
    #[error("database is read-only")]
    ReadOnly,

    /// Stored data failed to decode.
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// Operation not supported by the current configuration.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Engine error.
    #[error("engine error: {0}")]
    Engine(#[from] sled::Error),

    /// Unexpected internal failure.
    #[error("unknown internal error")]
    Unknown,
}

impl Error {
    /// The domain this error is reported under.
    pub fn domain(&self) -> ErrorDomain {
        match self {
            Error::Conflict | Error::BadRequest(_) | Error::Gone => ErrorDomain::Http,
            Error::Unknown => ErrorDomain::Core,
            _ => ErrorDomain::Storage,
        }
    }

    /// The integer code within the domain.
    pub fn code(&self) -> i32 {
        match self {
            Error::NotFound => 1,
            Error::Conflict => 409,
            Error::BadRequest(_) => 400,
            Error::Gone => 410,
            Error::Io(_) => 2,
            Error::Corrupt(_) => 3,
            Error::Unsupported(_) => 4,
            Error::ReadOnly => 5,
            Error::Engine(_) => 6,
            Error::Unknown => 2,
        }
    }

    /// Records an unexpected internal failure and returns `Unknown`.
    pub(crate) fn unknown(context: &str) -> Self {
        tracing::warn!(context, "unexpected internal failure");
        Error::Unknown
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
