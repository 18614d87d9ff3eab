//! Typed errors for the connector boundary.
//!
//! Upstream fetches and record mapping fail in a small number of well-known
//! ways, and the orchestrator needs to tell them apart when it files a
//! [`SoftError`](crate::models::SoftError). Everything above the connector
//! boundary (store, config, CLI, server) uses `anyhow`.

use thiserror::Error;

/// Failure of a single upstream page fetch.
///
/// None of these are retried inside a Run; the next scheduled Run picks the
/// partition up again from its first page.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The call exceeded the per-call timeout and was cancelled.
    #[error("request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// Upstream answered with a non-success status.
    #[error("upstream returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// Upstream answered `429 Too Many Requests`.
    #[error("upstream rate limited the request")]
    RateLimited,

    /// Connection, TLS, or body read failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The response body did not have the expected shape.
    #[error("malformed page: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout { ms: 0 }
        } else if err.is_decode() {
            FetchError::Malformed(err.to_string())
        } else {
            FetchError::Transport(err.to_string())
        }
    }
}

/// Failure to turn a raw upstream record into a canonical one.
///
/// A record that fails mapping is dropped and counted; it is never written.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MapError {
    /// A field that forms part of the natural key is absent, null, or blank.
    #[error("missing identity field `{field}`")]
    MissingIdentity { field: String },

    /// The raw payload is not a JSON object.
    #[error("raw record is not an object")]
    NotAnObject,
}

impl MapError {
    pub fn missing(field: &str) -> Self {
        MapError::MissingIdentity {
            field: field.to_string(),
        }
    }
}
