//! Client-side error taxonomy.

use thiserror::Error;

/// Statuses worth retrying at the transport layer.
pub const RETRYABLE_STATUSES: [u16; 7] = [408, 429, 500, 502, 503, 504, 525];

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("unauthorised")]
    Unauthorised,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rate limited")]
    RateLimited,
    #[error("unexpected api error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("codec error: {0}")]
    Codec(String),
    /// The remote function rejected; the payload is the packed error value.
    #[error("function rejected")]
    Rejection { payload: Vec<u8> },
    #[error("job timed out waiting for a result")]
    JobTimeout,
    #[error("too many network errors")]
    TooManyNetworkErrors,
}

impl ClientError {
    pub fn is_retryable_status(status: u16) -> bool {
        RETRYABLE_STATUSES.contains(&status)
    }
}
