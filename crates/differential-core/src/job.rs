//! Job entity and its status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ClusterId, DeploymentId, JobId, MachineId};

/// Attempts a job gets when the caller does not configure stall retries
/// (one initial attempt plus one retry).
pub const DEFAULT_REMAINING_ATTEMPTS: u32 = 2;

/// Persisted job status.
///
/// The vocabulary is wire-compatible with the platform contract: `Failure`
/// is the *stalled-and-retryable* state, not a terminal outcome. Terminal
/// rejections are persisted as `Success` with [`ResultType::Rejection`].
/// A job is claimable iff it is `Pending` or `Failure` with attempts left.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failure,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            _ => None,
        }
    }

    /// True once a result has been persisted; the status never leaves
    /// `Success` afterwards.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the executed function concluded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultType {
    Resolution,
    Rejection,
}

impl ResultType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resolution => "resolution",
            Self::Rejection => "rejection",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "resolution" => Some(Self::Resolution),
            "rejection" => Some(Self::Rejection),
            _ => None,
        }
    }
}

/// One durable invocation of `(service, target_fn, target_args)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub cluster_id: ClusterId,
    pub service: String,
    pub target_fn: String,
    /// Packed argument bytes; the engine never inspects them.
    pub target_args: Vec<u8>,
    pub status: JobStatus,
    pub result: Option<Vec<u8>>,
    pub result_type: Option<ResultType>,
    /// Admission deduplication key; defaults to the job id itself.
    pub idempotency_key: String,
    pub cache_key: Option<String>,
    pub remaining_attempts: u32,
    pub timeout_interval_seconds: Option<u64>,
    pub predictive_retries_on_rejection: bool,
    pub executing_machine_id: Option<MachineId>,
    pub deployment_id: Option<DeploymentId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_retrieved_at: Option<DateTime<Utc>>,
    pub resulted_at: Option<DateTime<Utc>>,
    pub function_execution_time_ms: Option<u64>,
}

impl Job {
    /// Claim eligibility: pending or stalled, with attempts to spend.
    pub fn is_claimable(&self) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Failure)
            && self.remaining_attempts > 0
    }
}

/// Caller-supplied admission options. Serialized camelCase because this
/// struct rides the admission request body as-is.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CallConfig {
    pub idempotency_key: Option<String>,
    pub cache_key: Option<String>,
    pub cache_ttl_seconds: Option<u64>,
    /// Extra claim attempts granted beyond the first.
    pub retry_count_on_stall: Option<u32>,
    pub timeout_seconds: Option<u64>,
    pub predictive_retries_on_rejection: Option<bool>,
    /// Caller-chosen job id; minted when absent.
    pub execution_id: Option<JobId>,
    /// Pins execution to a specific deployed version.
    pub deployment_id: Option<DeploymentId>,
}

impl CallConfig {
    pub fn initial_attempts(&self) -> u32 {
        match self.retry_count_on_stall {
            Some(retries) => 1 + retries,
            None => DEFAULT_REMAINING_ATTEMPTS,
        }
    }
}

/// Claim projection handed to a polling worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClaimedJob {
    pub id: JobId,
    pub target_fn: String,
    pub target_args: Vec<u8>,
}

/// Outcome a worker posts back after executing a job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobResult {
    pub result: Vec<u8>,
    pub result_type: ResultType,
    pub function_execution_time_ms: Option<u64>,
}

/// Status read projection served to polling callers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobStatusRow {
    pub id: JobId,
    pub status: JobStatus,
    pub result: Option<Vec<u8>>,
    pub result_type: Option<ResultType>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(status: JobStatus, attempts: u32) -> Job {
        Job {
            id: "job-1".into(),
            cluster_id: "cluster-1".into(),
            service: "orders".into(),
            target_fn: "refund".into(),
            target_args: Vec::new(),
            status,
            result: None,
            result_type: None,
            idempotency_key: "job-1".into(),
            cache_key: None,
            remaining_attempts: attempts,
            timeout_interval_seconds: None,
            predictive_retries_on_rejection: false,
            executing_machine_id: None,
            deployment_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_retrieved_at: None,
            resulted_at: None,
            function_execution_time_ms: None,
        }
    }

    #[test]
    fn claimable_states() {
        assert!(job(JobStatus::Pending, 1).is_claimable());
        assert!(job(JobStatus::Failure, 2).is_claimable());
        assert!(!job(JobStatus::Running, 2).is_claimable());
        assert!(!job(JobStatus::Success, 2).is_claimable());
        assert!(!job(JobStatus::Pending, 0).is_claimable());
    }

    #[test]
    fn default_attempts_is_one_retry() {
        assert_eq!(CallConfig::default().initial_attempts(), 2);
        let config = CallConfig {
            retry_count_on_stall: Some(4),
            ..CallConfig::default()
        };
        assert_eq!(config.initial_attempts(), 5);
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Success,
            JobStatus::Failure,
        ] {
            assert_eq!(JobStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::from_str("terminated"), None);
    }
}
