//! Cluster: the tenant boundary.

use serde::{Deserialize, Serialize};

use crate::ids::ClusterId;

/// A tenant cluster. The shared secret authenticates workers and clients;
/// only its SHA-256 digest is persisted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,
    pub secret_hash: String,
    /// Non-operational clusters refuse admission with `Forbidden`.
    pub operational: bool,
    pub predictive_retries_enabled: bool,
    pub auto_retry_stalled_jobs: bool,
}
