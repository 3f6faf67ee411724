//! Control-plane handlers.

use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{middleware, Extension, Json, Router};
use chrono::Utc;

use differential_core::protocol::{
    BatchStatusRequest, BatchStatusRow, ClaimedJobDto, CreateDeploymentRequest, CreateJobRequest,
    CreateJobResponse, DeploymentResponse, EventIngestItem, JobStatusResponse, LiveResponse,
    NextJobsRequest, PersistResultRequest,
};
use differential_core::{Deployment, EventKind, JobEvent, JobResult, ServiceDefinition};

use crate::api_errors::ApiError;
use crate::auth::{
    auth_middleware, machine_id_from_headers, peer_ip_from_headers, AuthedCluster,
};
use crate::state::AppState;

pub const LONG_POLL_MIN_MS: u64 = 5_000;
pub const LONG_POLL_MAX_MS: u64 = 20_000;
pub const LONG_POLL_TICK: Duration = Duration::from_millis(500);

const MAX_CLAIM_LIMIT: usize = 100;
const DEFAULT_CLAIM_LIMIT: usize = 10;

pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/jobs", post(create_job))
        .route("/jobs-request", post(next_jobs))
        .route("/jobs/statuses", post(get_job_statuses))
        .route("/jobs/:job_id", get(get_job_status))
        .route("/jobs/:job_id/result", post(persist_job_result))
        .route("/metrics", post(ingest_events))
        .route(
            "/clusters/:cluster_id/services/:service/deployments",
            post(create_deployment),
        )
        .route(
            "/clusters/:cluster_id/services/:service/deployments/:deployment_id/release",
            post(release_deployment),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/live", get(live))
        .merge(protected)
        .with_state(state)
}

pub async fn live() -> Json<LiveResponse> {
    Json(LiveResponse {
        status: "ok".to_string(),
    })
}

pub async fn create_job(
    State(state): State<AppState>,
    Extension(AuthedCluster(cluster)): Extension<AuthedCluster>,
    Json(req): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<CreateJobResponse>), ApiError> {
    let admission = state.store.create_job(
        &cluster,
        &req.service,
        &req.target_fn,
        &req.target_args,
        &req.call_config,
        Utc::now(),
    )?;
    if admission.created {
        state.emit(
            JobEvent::job(EventKind::JobCreated, cluster.id.clone(), admission.id.clone())
                .with_service(req.service.clone()),
        );
    }
    Ok((StatusCode::CREATED, Json(CreateJobResponse { id: admission.id })))
}

pub async fn next_jobs(
    State(state): State<AppState>,
    Extension(AuthedCluster(cluster)): Extension<AuthedCluster>,
    headers: HeaderMap,
    Json(req): Json<NextJobsRequest>,
) -> Result<Json<Vec<ClaimedJobDto>>, ApiError> {
    let Some(machine_id) = machine_id_from_headers(&headers) else {
        return Err(ApiError::bad_request("x-machine-id header is required"));
    };
    if req.service.trim().is_empty() {
        return Err(ApiError::bad_request("service must not be empty"));
    }
    let limit = req.limit.unwrap_or(DEFAULT_CLAIM_LIMIT).clamp(1, MAX_CLAIM_LIMIT);
    let now = Utc::now();

    state.store.record_machine_ping(
        &cluster.id,
        &machine_id,
        Some(&req.service),
        peer_ip_from_headers(&headers).as_deref(),
        req.deployment_id.as_deref(),
        now,
    )?;

    // The worker's registry projection doubles as the service definition.
    // Upsert failures are logged, never surfaced to the poll.
    if let Some(functions) = &req.functions {
        let definition = ServiceDefinition {
            name: req.service.clone(),
            functions: functions.clone(),
        };
        if let Err(e) = state
            .store
            .upsert_service_definition(&cluster.id, &definition, now)
        {
            tracing::warn!(service = %req.service, error = %e, "service definition upsert failed");
        }
    }

    let claimed = state.store.next_jobs(
        &cluster.id,
        &req.service,
        &machine_id,
        req.deployment_id.as_deref(),
        limit,
        now,
    )?;
    for job in &claimed {
        state.emit(
            JobEvent::job(EventKind::JobReceived, cluster.id.clone(), job.id.clone())
                .with_machine(machine_id.clone())
                .with_service(req.service.clone()),
        );
    }
    Ok(Json(claimed.into_iter().map(Into::into).collect()))
}

pub async fn get_job_status(
    State(state): State<AppState>,
    Extension(AuthedCluster(cluster)): Extension<AuthedCluster>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let row = state
        .store
        .get_job_status(&cluster.id, &job_id)?
        .ok_or_else(|| ApiError::not_found(format!("unknown job: {}", job_id)))?;
    state.emit(JobEvent::job(
        EventKind::JobStatusRequest,
        cluster.id.clone(),
        job_id,
    ));
    Ok(Json(JobStatusResponse {
        status: row.status,
        result: row.result,
        result_type: row.result_type,
    }))
}

pub fn clamp_long_poll(timeout_ms: Option<u64>) -> Duration {
    Duration::from_millis(
        timeout_ms
            .unwrap_or(LONG_POLL_MAX_MS)
            .clamp(LONG_POLL_MIN_MS, LONG_POLL_MAX_MS),
    )
}

/// Batched status long-poll: returns as soon as any requested job is
/// terminal, otherwise re-reads every 500 ms until the bounded timeout and
/// answers with whatever subset exists.
pub async fn get_job_statuses(
    State(state): State<AppState>,
    Extension(AuthedCluster(cluster)): Extension<AuthedCluster>,
    Json(req): Json<BatchStatusRequest>,
) -> Result<Json<Vec<BatchStatusRow>>, ApiError> {
    if req.job_ids.is_empty() {
        return Ok(Json(Vec::new()));
    }
    let deadline = tokio::time::Instant::now() + clamp_long_poll(req.long_poll_timeout_ms);
    loop {
        let rows = state.store.get_job_statuses(&cluster.id, &req.job_ids)?;
        let any_terminal = rows.iter().any(|row| row.status.is_terminal());
        if any_terminal || tokio::time::Instant::now() >= deadline {
            for row in &rows {
                state.emit(JobEvent::job(
                    EventKind::JobStatusRequest,
                    cluster.id.clone(),
                    row.id.clone(),
                ));
            }
            return Ok(Json(rows.into_iter().map(Into::into).collect()));
        }
        tokio::time::sleep(LONG_POLL_TICK).await;
    }
}

pub async fn persist_job_result(
    State(state): State<AppState>,
    Extension(AuthedCluster(cluster)): Extension<AuthedCluster>,
    Path(job_id): Path<String>,
    Json(req): Json<PersistResultRequest>,
) -> Result<StatusCode, ApiError> {
    let applied = state.store.persist_result(
        &cluster.id,
        &job_id,
        &JobResult {
            result: req.result,
            result_type: req.result_type,
            function_execution_time_ms: req.function_execution_time_ms,
        },
        Utc::now(),
    )?;
    if applied {
        state.emit(JobEvent::job(
            EventKind::JobResulted,
            cluster.id.clone(),
            job_id,
        ));
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn ingest_events(
    State(state): State<AppState>,
    Extension(AuthedCluster(cluster)): Extension<AuthedCluster>,
    Json(items): Json<Vec<EventIngestItem>>,
) -> Result<StatusCode, ApiError> {
    for item in items {
        let Some(kind) = EventKind::from_str(&item.kind) else {
            tracing::warn!(kind = %item.kind, "skipping unknown event kind");
            continue;
        };
        // Ingested events are attributed to the authenticated cluster only.
        state.emit(JobEvent {
            kind,
            cluster_id: cluster.id.clone(),
            job_id: item.job_id,
            machine_id: item.machine_id,
            deployment_id: item.deployment_id,
            service: item.service,
            meta: item.meta,
            created_at: Utc::now(),
        });
    }
    Ok(StatusCode::NO_CONTENT)
}

fn deployment_response(state: &AppState, deployment: Deployment, with_upload: bool) -> DeploymentResponse {
    let package_upload_url = if with_upload {
        state.config.package_upload_base.as_ref().map(|base| {
            format!(
                "{}/{}/{}/{}.zip",
                base.trim_end_matches('/'),
                deployment.cluster_id,
                deployment.service,
                deployment.id
            )
        })
    } else {
        None
    };
    DeploymentResponse {
        id: deployment.id,
        service: deployment.service,
        provider: deployment.provider,
        status: deployment.status.as_str().to_string(),
        package_upload_url,
    }
}

pub async fn create_deployment(
    State(state): State<AppState>,
    Extension(AuthedCluster(cluster)): Extension<AuthedCluster>,
    Path((cluster_id, service)): Path<(String, String)>,
    Json(req): Json<CreateDeploymentRequest>,
) -> Result<Json<DeploymentResponse>, ApiError> {
    if cluster_id != cluster.id {
        return Err(ApiError::Forbidden("cluster mismatch".to_string()));
    }
    let provider = req
        .provider
        .unwrap_or_else(|| state.config.default_deployment_provider.clone());
    let deployment = state
        .store
        .create_deployment(&cluster.id, &service, &provider, Utc::now())?;
    Ok(Json(deployment_response(&state, deployment, true)))
}

pub async fn release_deployment(
    State(state): State<AppState>,
    Extension(AuthedCluster(cluster)): Extension<AuthedCluster>,
    Path((cluster_id, service, deployment_id)): Path<(String, String, String)>,
) -> Result<Json<DeploymentResponse>, ApiError> {
    if cluster_id != cluster.id {
        return Err(ApiError::Forbidden("cluster mismatch".to_string()));
    }
    let deployment = state
        .store
        .release_deployment(&cluster.id, &service, &deployment_id)?;
    Ok(Json(deployment_response(&state, deployment, false)))
}
