//! Deployments: packaged worker images bound to `(cluster, service)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ClusterId, DeploymentId};

/// Deployment lifecycle. At most one `Active` per `(cluster, service)`;
/// releasing a deployment demotes the current active one to `Inactive`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Uploading,
    Ready,
    Active,
    Inactive,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploading => "uploading",
            Self::Ready => "ready",
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "uploading" => Some(Self::Uploading),
            "ready" => Some(Self::Ready),
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub cluster_id: ClusterId,
    pub service: String,
    /// Provider name, resolved against the server's provider registry.
    pub provider: String,
    pub status: DeploymentStatus,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            DeploymentStatus::Uploading,
            DeploymentStatus::Ready,
            DeploymentStatus::Active,
            DeploymentStatus::Inactive,
        ] {
            assert_eq!(DeploymentStatus::from_str(status.as_str()), Some(status));
        }
    }
}
