//! Error taxonomy shared by the store, the mapper, and both sync paths.

use thiserror::Error;

use crate::upstream::FunctionCode;

/// Upstream failures worth retrying. Both kinds are caught by the poller and
/// the sync retry loop; nothing else is.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {key} does not exist")]
    Missing { entity: &'static str, key: String },
    #[error("{entity} {key} already exists")]
    Duplicate { entity: &'static str, key: String },
    #[error("store lock poisoned by a panicked writer")]
    Poisoned,
    #[error("store IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("transient upstream error: {0}")]
    Transient(#[from] UpstreamError),
    #[error("malformed payload for {function}: {reason}")]
    Malformed {
        function: FunctionCode,
        reason: String,
    },
    #[error("upstream rejected {function} with HTTP {status}")]
    Rejected { function: FunctionCode, status: u16 },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("upstream request failed: {0}")]
    Request(reqwest::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    pub fn malformed(function: FunctionCode, reason: impl ToString) -> Self {
        Error::Malformed {
            function,
            reason: reason.to_string(),
        }
    }

    /// Retried with backoff by the poller and by [`crate::sync::StaticSync::run_with_retry`].
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Error::Transient(UpstreamError::RateLimited(_)))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
