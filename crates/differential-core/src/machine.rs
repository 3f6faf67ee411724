//! Worker machine records, upserted on every poll.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ClusterId, DeploymentId, MachineId};

/// A worker process instance. Unique per `(id, cluster_id)`; rows are
/// upserted on ping and never deleted on the hot path.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Machine {
    pub id: MachineId,
    pub cluster_id: ClusterId,
    pub service: Option<String>,
    pub ip: Option<String>,
    pub deployment_id: Option<DeploymentId>,
    pub last_ping_at: DateTime<Utc>,
}
