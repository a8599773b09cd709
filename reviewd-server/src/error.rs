//! Error taxonomy for the review pipeline.
//!
//! Each enum corresponds to one failure domain and carries enough
//! structure for callers to decide between retrying, giving up, and
//! escalating. Diff parse failures use `reviewd_core::ParseError`.

use std::time::Duration;

use thiserror::Error;

/// Webhook authentication failures. Never retried: the request is
/// rejected and the detail is logged, not returned to the sender.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing signature header")]
    MissingHeader,
    #[error("invalid webhook signature")]
    InvalidSignature,
}

/// Failures fetching a diff from the origin.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The commit or comparison no longer exists (force-pushed away).
    /// Terminal: retrying cannot succeed.
    #[error("diff not found at origin")]
    NotFound,
    /// The origin asked us to back off; `retry_after` is its hint if
    /// one was provided.
    #[error("rate limited by origin")]
    RateLimited { retry_after: Option<Duration> },
    /// Network errors, 5xx responses, token exchange failures.
    #[error("transient fetch failure: {0}")]
    Transient(String),
}

impl FetchError {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FetchError::NotFound)
    }

    /// The origin's backoff hint, when it gave one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Failures from the rate-limited review client.
#[derive(Debug, Error)]
pub enum ReviewError {
    /// No rate-limit token became available within the configured wait.
    #[error("timed out waiting for a rate-limit token")]
    RateLimitTimeout,
    /// Non-2xx response, network error, timeout, or a body that does
    /// not parse. Retryable under the job queue's retry policy.
    #[error("upstream review call failed: {0}")]
    UpstreamFailure(String),
    /// The upstream rejected our credentials. A configuration fault,
    /// not a transient condition; escalated rather than retried.
    #[error("upstream rejected credentials (check OPENAI_API_KEY)")]
    InvalidCredentials,
}

impl ReviewError {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReviewError::InvalidCredentials)
    }
}

/// Persistence failures. Retryable with backoff: a job whose review
/// cannot be stored stays in the queue rather than being dropped.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database task panicked: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}
