//! HTTP transport for the control-plane surface.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client as ReqwestClient, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use differential_core::protocol::{
    BatchStatusRequest, BatchStatusRow, ClaimedJobDto, CreateJobRequest, CreateJobResponse,
    EventIngestItem, JobStatusResponse, NextJobsRequest, PersistResultRequest,
};

use crate::error::ClientError;

pub const MACHINE_ID_HEADER: &str = "x-machine-id";

/// The control-plane operations workers and clients drive. A trait so the
/// polling agent and results poller can be tested against a fake plane.
#[async_trait]
pub trait ControlApi: Send + Sync {
    async fn create_job(&self, request: &CreateJobRequest)
        -> Result<CreateJobResponse, ClientError>;
    async fn next_jobs(&self, request: &NextJobsRequest) -> Result<Vec<ClaimedJobDto>, ClientError>;
    async fn get_job_status(&self, job_id: &str) -> Result<JobStatusResponse, ClientError>;
    async fn get_job_statuses(
        &self,
        request: &BatchStatusRequest,
    ) -> Result<Vec<BatchStatusRow>, ClientError>;
    async fn persist_job_result(
        &self,
        job_id: &str,
        request: &PersistResultRequest,
    ) -> Result<(), ClientError>;
    async fn ingest_events(&self, items: &[EventIngestItem]) -> Result<(), ClientError>;
}

#[derive(Clone, Debug)]
pub struct ApiClientConfig {
    pub base_url: String,
    /// The cluster's shared secret; sent as the bearer token.
    pub api_secret: String,
    /// Attached as `x-machine-id` on every request when present.
    pub machine_id: Option<String>,
    pub timeout: Duration,
    /// Total attempts per request across the retryable status set.
    pub attempts: u32,
    pub retry_backoff: Duration,
}

impl ApiClientConfig {
    pub fn new(base_url: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_secret: api_secret.into(),
            machine_id: None,
            timeout: Duration::from_secs(30),
            attempts: 3,
            retry_backoff: Duration::from_millis(250),
        }
    }

    pub fn with_machine_id(mut self, machine_id: impl Into<String>) -> Self {
        self.machine_id = Some(machine_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Clone)]
pub struct HttpControlClient {
    http: ReqwestClient,
    config: ApiClientConfig,
}

impl HttpControlClient {
    pub fn new(config: ApiClientConfig) -> Result<Self, ClientError> {
        let http = ReqwestClient::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(Self { http, config })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let mut builder = self
            .http
            .request(method, url)
            .bearer_auth(&self.config.api_secret);
        if let Some(machine_id) = &self.config.machine_id {
            builder = builder.header(MACHINE_ID_HEADER, machine_id);
        }
        builder
    }

    async fn send_with_retry<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response, ClientError> {
        let attempts = self.config.attempts.max(1);
        let mut last_error = ClientError::Transport("request not attempted".to_string());
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_backoff * attempt).await;
            }
            let mut request = self.request(method.clone(), path);
            if let Some(body) = body {
                request = request.json(body);
            }
            match request.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if response.status().is_success() {
                        return Ok(response);
                    }
                    if ClientError::is_retryable_status(status) && attempt + 1 < attempts {
                        tracing::debug!(path, status, "retrying request");
                        last_error = status_error(response).await;
                        continue;
                    }
                    return Err(status_error(response).await);
                }
                Err(e) if e.is_timeout() => last_error = ClientError::Timeout,
                Err(e) => last_error = ClientError::Transport(e.to_string()),
            }
        }
        Err(last_error)
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let response = self.send_with_retry(Method::POST, path, Some(body)).await?;
        response
            .json()
            .await
            .map_err(|e| ClientError::Transport(format!("decode response: {}", e)))
    }

    async fn post_no_content<B: Serialize>(&self, path: &str, body: &B) -> Result<(), ClientError> {
        self.send_with_retry(Method::POST, path, Some(body)).await?;
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let response = self
            .send_with_retry::<()>(Method::GET, path, None)
            .await?;
        response
            .json()
            .await
            .map_err(|e| ClientError::Transport(format!("decode response: {}", e)))
    }
}

async fn status_error(response: Response) -> ClientError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED => ClientError::Unauthorised,
        StatusCode::NOT_FOUND => ClientError::NotFound(body),
        StatusCode::TOO_MANY_REQUESTS => ClientError::RateLimited,
        other => ClientError::Api {
            status: other.as_u16(),
            body,
        },
    }
}

#[async_trait]
impl ControlApi for HttpControlClient {
    async fn create_job(
        &self,
        request: &CreateJobRequest,
    ) -> Result<CreateJobResponse, ClientError> {
        self.post_json("/jobs", request).await
    }

    async fn next_jobs(
        &self,
        request: &NextJobsRequest,
    ) -> Result<Vec<ClaimedJobDto>, ClientError> {
        self.post_json("/jobs-request", request).await
    }

    async fn get_job_status(&self, job_id: &str) -> Result<JobStatusResponse, ClientError> {
        self.get_json(&format!("/jobs/{}", job_id)).await
    }

    async fn get_job_statuses(
        &self,
        request: &BatchStatusRequest,
    ) -> Result<Vec<BatchStatusRow>, ClientError> {
        self.post_json("/jobs/statuses", request).await
    }

    async fn persist_job_result(
        &self,
        job_id: &str,
        request: &PersistResultRequest,
    ) -> Result<(), ClientError> {
        self.post_no_content(&format!("/jobs/{}/result", job_id), request)
            .await
    }

    async fn ingest_events(&self, items: &[EventIngestItem]) -> Result<(), ClientError> {
        self.post_no_content("/metrics", &items).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use differential_core::JobStatus;
    use mockito::Server;

    fn client_for(server: &Server) -> HttpControlClient {
        let config = ApiClientConfig::new(server.url(), "test-secret")
            .with_machine_id("m-test")
            .with_timeout(Duration::from_secs(2));
        HttpControlClient::new(config).expect("build client")
    }

    #[tokio::test]
    async fn create_job_sends_bearer_and_machine_headers() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/jobs")
            .match_header("authorization", "Bearer test-secret")
            .match_header("x-machine-id", "m-test")
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"job-1"}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        let response = client
            .create_job(&CreateJobRequest {
                service: "greeter".into(),
                target_fn: "hello".into(),
                target_args: b"{}".to_vec(),
                call_config: Default::default(),
            })
            .await
            .expect("create job");
        assert_eq!(response.id, "job-1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unauthorised_is_not_retried() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/jobs-request")
            .with_status(401)
            .with_body("no")
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server);
        let err = client
            .next_jobs(&NextJobsRequest {
                service: "greeter".into(),
                limit: None,
                ttl: None,
                deployment_id: None,
                functions: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Unauthorised));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn status_read_decodes_the_wire_shape() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/jobs/j1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status":"pending","result":null,"resultType":null}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        let status = client.get_job_status("j1").await.expect("status");
        assert_eq!(status.status, JobStatus::Pending);
        assert!(status.result.is_none());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn retryable_status_exhausts_all_attempts() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/jobs/j1")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let client = client_for(&server);
        let err = client.get_job_status("j1").await.unwrap_err();
        assert!(matches!(err, ClientError::Api { status: 503, .. }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn rate_limit_surfaces_after_retries() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/jobs/statuses")
            .with_status(429)
            .expect(3)
            .create_async()
            .await;

        let client = client_for(&server);
        let err = client
            .get_job_statuses(&BatchStatusRequest {
                job_ids: vec!["j1".into()],
                long_poll_timeout_ms: Some(5_000),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::RateLimited));
        mock.assert_async().await;
    }
}
