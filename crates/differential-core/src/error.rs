//! Shared error type for store and control-plane operations.

use thiserror::Error;

/// Errors surfaced by the job store and the operations layered on it.
///
/// The variants map one-to-one onto the HTTP statuses the control plane
/// answers with, so handlers can convert without inspecting messages.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl StoreError {
    /// Wrap a database driver error with operation context.
    pub fn storage(context: &str, err: impl std::fmt::Display) -> Self {
        StoreError::Storage(format!("{}: {}", context, err))
    }
}
