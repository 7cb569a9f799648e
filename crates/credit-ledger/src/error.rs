use thiserror::Error;

/// Failures surfaced by the ledger and the metered completion path.
#[derive(Debug, Error)]
pub enum Error {
    /// The persistent store could not be reached or rejected the statement.
    #[error("ledger store unavailable: {0}")]
    StoreUnavailable(String),

    /// The completion service failed; nothing was billed.
    #[error("upstream service error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("failed to serialize request: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors reported by a [`crate::CompletionService`] implementation.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::StoreUnavailable(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::StoreUnavailable(format!("store task failed: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
