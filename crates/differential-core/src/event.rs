//! Append-only audit events. The engine only ever writes to the sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ClusterId, DeploymentId, JobId, MachineId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    JobCreated,
    JobReceived,
    JobResulted,
    JobStalled,
    JobStalledTerminal,
    JobStatusRequest,
    MachinePing,
    DeploymentNotified,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobCreated => "jobCreated",
            Self::JobReceived => "jobReceived",
            Self::JobResulted => "jobResulted",
            Self::JobStalled => "jobStalled",
            Self::JobStalledTerminal => "jobStalledTerminal",
            Self::JobStatusRequest => "jobStatusRequest",
            Self::MachinePing => "machinePing",
            Self::DeploymentNotified => "deploymentNotified",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "jobCreated" => Some(Self::JobCreated),
            "jobReceived" => Some(Self::JobReceived),
            "jobResulted" => Some(Self::JobResulted),
            "jobStalled" => Some(Self::JobStalled),
            "jobStalledTerminal" => Some(Self::JobStalledTerminal),
            "jobStatusRequest" => Some(Self::JobStatusRequest),
            "machinePing" => Some(Self::MachinePing),
            "deploymentNotified" => Some(Self::DeploymentNotified),
            _ => None,
        }
    }
}

/// One audit record referencing a job, machine or deployment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobEvent {
    pub kind: EventKind,
    pub cluster_id: ClusterId,
    pub job_id: Option<JobId>,
    pub machine_id: Option<MachineId>,
    pub deployment_id: Option<DeploymentId>,
    pub service: Option<String>,
    pub meta: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl JobEvent {
    pub fn job(kind: EventKind, cluster_id: impl Into<ClusterId>, job_id: impl Into<JobId>) -> Self {
        Self {
            kind,
            cluster_id: cluster_id.into(),
            job_id: Some(job_id.into()),
            machine_id: None,
            deployment_id: None,
            service: None,
            meta: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_machine(mut self, machine_id: impl Into<MachineId>) -> Self {
        self.machine_id = Some(machine_id.into());
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// Write-only event stream. Emission must never fail the calling operation;
/// implementations log and swallow their own errors.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: JobEvent);
}

/// Sink that forwards events to the tracing subscriber. Used as the default
/// when no durable sink is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: JobEvent) {
        tracing::info!(
            kind = event.kind.as_str(),
            cluster_id = %event.cluster_id,
            job_id = event.job_id.as_deref().unwrap_or(""),
            machine_id = event.machine_id.as_deref().unwrap_or(""),
            "event"
        );
    }
}
