//! Service proxy: request/response and fire-and-forget calls against a named
//! service. Type safety is restored by thin generated wrappers that pin the
//! argument and return types per function; this descriptor does the work.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use differential_core::protocol::CreateJobRequest;
use differential_core::{CallConfig, ResultType};

use crate::api::ControlApi;
use crate::codec::Codec;
use crate::error::ClientError;
use crate::poller::ResultsPoller;

pub struct ServiceClient {
    service: String,
    control: Arc<dyn ControlApi>,
    codec: Arc<dyn Codec>,
    poller: Arc<ResultsPoller>,
}

impl ServiceClient {
    pub fn new(
        service: impl Into<String>,
        control: Arc<dyn ControlApi>,
        codec: Arc<dyn Codec>,
        poller: Arc<ResultsPoller>,
    ) -> Self {
        Self {
            service: service.into(),
            control,
            codec,
            poller,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Fire-and-forget: admit the job and return its id without awaiting the
    /// result.
    pub async fn background<A: Serialize>(
        &self,
        target_fn: &str,
        args: &A,
        config: CallConfig,
    ) -> Result<String, ClientError> {
        let value = serde_json::to_value(args).map_err(|e| ClientError::Codec(e.to_string()))?;
        let target_args = self.codec.pack(&value)?;
        let response = self
            .control
            .create_job(&CreateJobRequest {
                service: self.service.clone(),
                target_fn: target_fn.to_string(),
                target_args,
                call_config: config,
            })
            .await?;
        Ok(response.id)
    }

    /// Request/response: admit, await the terminal status through the shared
    /// results poller, and unpack the outcome. A remote rejection surfaces as
    /// [`ClientError::Rejection`] carrying the packed error payload.
    pub async fn call<A: Serialize, R: DeserializeOwned>(
        &self,
        target_fn: &str,
        args: &A,
        config: CallConfig,
    ) -> Result<R, ClientError> {
        let job_id = self.background(target_fn, args, config).await?;
        let row = self.poller.wait_for(job_id).await?;
        match row.result_type {
            Some(ResultType::Resolution) => {
                let value = self.codec.unpack(&row.result.unwrap_or_default())?;
                serde_json::from_value(value).map_err(|e| ClientError::Codec(e.to_string()))
            }
            Some(ResultType::Rejection) => Err(ClientError::Rejection {
                payload: row.result.unwrap_or_default(),
            }),
            None => Err(ClientError::Transport(
                "terminal job carries no result type".to_string(),
            )),
        }
    }
}
