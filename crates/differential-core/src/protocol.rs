//! Wire DTOs for the control-plane surface, shared by server and clients.
//! Packed payloads ride base64; field names are camelCase on the wire.

use serde::{Deserialize, Serialize};

use crate::job::{CallConfig, ClaimedJob, JobStatus, JobStatusRow, ResultType};
use crate::packed;
use crate::service::FunctionSpec;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    pub service: String,
    pub target_fn: String,
    #[serde(with = "packed")]
    pub target_args: Vec<u8>,
    #[serde(default)]
    pub call_config: CallConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateJobResponse {
    pub id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextJobsRequest {
    pub service: String,
    #[serde(default)]
    pub limit: Option<usize>,
    /// Worker keepalive budget in seconds; accepted for contract
    /// compatibility, the claim itself never blocks.
    #[serde(default)]
    pub ttl: Option<u64>,
    #[serde(default)]
    pub deployment_id: Option<String>,
    /// Registry projection the worker carries: upserted as the service
    /// definition on every successful poll.
    #[serde(default)]
    pub functions: Option<Vec<FunctionSpec>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimedJobDto {
    pub id: String,
    pub target_fn: String,
    #[serde(with = "packed")]
    pub target_args: Vec<u8>,
}

impl From<ClaimedJob> for ClaimedJobDto {
    fn from(job: ClaimedJob) -> Self {
        Self {
            id: job.id,
            target_fn: job.target_fn,
            target_args: job.target_args,
        }
    }
}

impl From<ClaimedJobDto> for ClaimedJob {
    fn from(dto: ClaimedJobDto) -> Self {
        Self {
            id: dto.id,
            target_fn: dto.target_fn,
            target_args: dto.target_args,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub status: JobStatus,
    #[serde(with = "packed::option", default)]
    pub result: Option<Vec<u8>>,
    pub result_type: Option<ResultType>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStatusRequest {
    pub job_ids: Vec<String>,
    #[serde(default)]
    pub long_poll_timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStatusRow {
    pub id: String,
    pub status: JobStatus,
    #[serde(with = "packed::option", default)]
    pub result: Option<Vec<u8>>,
    pub result_type: Option<ResultType>,
}

impl From<JobStatusRow> for BatchStatusRow {
    fn from(row: JobStatusRow) -> Self {
        Self {
            id: row.id,
            status: row.status,
            result: row.result,
            result_type: row.result_type,
        }
    }
}

impl From<BatchStatusRow> for JobStatusRow {
    fn from(row: BatchStatusRow) -> Self {
        Self {
            id: row.id,
            status: row.status,
            result: row.result,
            result_type: row.result_type,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistResultRequest {
    #[serde(with = "packed")]
    pub result: Vec<u8>,
    pub result_type: ResultType,
    #[serde(default)]
    pub function_execution_time_ms: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventIngestItem {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub machine_id: Option<String>,
    #[serde(default)]
    pub deployment_id: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub meta: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDeploymentRequest {
    #[serde(default)]
    pub provider: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentResponse {
    pub id: String,
    pub service: String,
    pub provider: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_upload_url: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LiveResponse {
    pub status: String,
}
