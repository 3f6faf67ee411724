//! Domain model shared by the differential control plane, store, worker and client.

pub mod cluster;
pub mod error;
pub mod event;
pub mod ids;
pub mod job;
pub mod machine;
pub mod packed;
pub mod protocol;
pub mod service;

pub mod deployment;

pub use cluster::Cluster;
pub use deployment::{Deployment, DeploymentStatus};
pub use error::StoreError;
pub use event::{EventKind, EventSink, JobEvent, TracingEventSink};
pub use ids::{fresh_id, ClusterId, DeploymentId, JobId, MachineId};
pub use job::{CallConfig, ClaimedJob, Job, JobResult, JobStatus, JobStatusRow, ResultType};
pub use machine::Machine;
pub use service::{FunctionRate, FunctionRetryConfig, FunctionSpec, ServiceDefinition};
