//! Caller-facing error taxonomy.
//!
//! Storage helpers return `anyhow::Result`; everything a caller of the relay or
//! the HTTP surface can observe is folded into [`RelayError`].

use crate::upstream::UpstreamError;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid vocabulary unit {0:?}: expected exactly one character")]
    InvalidUnit(String),

    #[error("upstream unavailable: {0}")]
    UpstreamTransient(String),

    #[error("upstream rejected the request: {0}")]
    UpstreamFatal(String),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl RelayError {
    pub fn session_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            what: "session",
            id: id.into(),
        }
    }
}

impl From<UpstreamError> for RelayError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::Transient(msg) => Self::UpstreamTransient(msg),
            UpstreamError::Fatal(msg) => Self::UpstreamFatal(msg),
        }
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
