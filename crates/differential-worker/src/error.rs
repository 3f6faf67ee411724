//! Worker-side errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("function name already registered: {0}")]
    AlreadyRegistered(String),
    #[error("task queue is closed")]
    QueueClosed,
}
