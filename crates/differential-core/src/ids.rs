//! Identity types for the job lifecycle engine.
//!
//! Ids are UUIDv7 strings: unique, opaque to callers, and time-ordered so
//! that `ORDER BY id` on the jobs table yields creation (FIFO) order.

/// Identifies a single job (one durable invocation).
pub type JobId = String;

/// Identifies a tenant cluster.
pub type ClusterId = String;

/// Identifies a worker process instance; minted anew on every worker start.
pub type MachineId = String;

/// Identifies a packaged worker deployment.
pub type DeploymentId = String;

/// Mint a fresh time-ordered id.
pub fn fresh_id() -> String {
    uuid::Uuid::now_v7().to_string()
}
