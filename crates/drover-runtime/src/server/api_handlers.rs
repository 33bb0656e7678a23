//! Axum handlers for the worker take/finish protocol and the job operator
//! endpoints.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{from_fn, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;

use drover_execution_runtime::QueueMetrics;
use drover_kernel::{ClusterJob, JobId, KernelError};

use crate::delivery::TaskDelivery;
use crate::job_scheduler::{JobScheduler, JobView};

use super::api_errors::ApiError;
use super::api_models::{
    AbortJobRequest, ApiEnvelope, FinishTaskRequest, FinishTaskResponse, JobActionResponse,
    TakeTaskRequest,
};

#[derive(Clone)]
pub struct TaskApiState {
    pub delivery: Arc<TaskDelivery>,
    pub jobs: Arc<JobScheduler>,
}

impl TaskApiState {
    pub fn new(delivery: Arc<TaskDelivery>, jobs: Arc<JobScheduler>) -> Self {
        Self { delivery, jobs }
    }
}

pub fn build_router(state: TaskApiState) -> Router {
    Router::new()
        .route("/v1/tasks/take", post(take_task))
        .route("/v1/tasks/finish", post(finish_task))
        .route("/tasks/take", post(take_task))
        .route("/tasks/finish", post(finish_task))
        .route("/v1/queues/:tenant_id/metrics", get(queue_metrics))
        .route("/v1/jobs/:job_id", get(job_status))
        .route("/v1/jobs/:job_id/pause", post(pause_job))
        .route("/v1/jobs/:job_id/resume", post(resume_job))
        .route("/v1/jobs/:job_id/abort", post(abort_job))
        .layer(from_fn(request_log_middleware))
        .with_state(state)
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

async fn request_log_middleware(
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let rid = request_id(&headers);
    tracing::info!(
        "task_api_request request_id={} method={} path={}",
        rid,
        request.method(),
        request.uri().path()
    );
    next.run(request).await
}

fn require_non_empty(field: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::bad_request(format!("{} must not be empty", field)));
    }
    Ok(())
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>, rid: &str) -> Result<T, ApiError> {
    body.map(|Json(req)| req).map_err(|e| {
        ApiError::bad_request(format!("malformed request body: {}", e.body_text()))
            .with_request_id(rid.to_string())
    })
}

fn parse_job_id(job_id: &str, rid: &str) -> Result<JobId, ApiError> {
    job_id
        .parse::<JobId>()
        .map_err(|e| ApiError::from(e).with_request_id(rid.to_string()))
}

/// Runs a synchronous core call off the async workers.
async fn run_blocking<T, F>(rid: &str, f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, KernelError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| {
            ApiError::internal(format!("blocking task failed: {}", e)).with_request_id(rid.to_string())
        })?
        .map_err(|e| ApiError::from(e).with_request_id(rid.to_string()))
}

fn job_action_response(job: ClusterJob) -> JobActionResponse {
    JobActionResponse {
        job_id: job.id.to_string(),
        status: job.status,
        current_stage: job.current_stage,
        message: job.message,
    }
}

pub async fn take_task(
    State(state): State<TaskApiState>,
    headers: HeaderMap,
    body: Result<Json<TakeTaskRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let rid = request_id(&headers);
    let req = json_body(body, &rid)?;
    require_non_empty("workerId", &req.worker_id)
        .and_then(|_| require_non_empty("provisionerId", &req.provisioner_id))
        .and_then(|_| require_non_empty("tenantId", &req.tenant_id))
        .map_err(|e| e.with_request_id(rid.clone()))?;

    let delivery = state.delivery.clone();
    let taken = run_blocking(&rid, move || {
        delivery.take_next(&req.worker_id, &req.provisioner_id, &req.tenant_id, Utc::now())
    })
    .await?;
    Ok(match taken {
        Some(payload) => (StatusCode::OK, Json(payload)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

pub async fn finish_task(
    State(state): State<TaskApiState>,
    headers: HeaderMap,
    body: Result<Json<FinishTaskRequest>, JsonRejection>,
) -> Result<Json<FinishTaskResponse>, ApiError> {
    let rid = request_id(&headers);
    let req = json_body(body, &rid)?;
    require_non_empty("workerId", &req.worker_id)
        .and_then(|_| require_non_empty("provisionerId", &req.provisioner_id))
        .and_then(|_| require_non_empty("tenantId", &req.tenant_id))
        .and_then(|_| require_non_empty("taskId", &req.task_id))
        .map_err(|e| e.with_request_id(rid.clone()))?;

    let delivery = state.delivery.clone();
    let report = run_blocking(&rid, move || {
        delivery.finish(
            &req.worker_id,
            &req.provisioner_id,
            &req.tenant_id,
            &req.task_id,
            req.outcome(),
            Utc::now(),
        )
    })
    .await?;
    Ok(Json(report.into()))
}

pub async fn queue_metrics(
    State(state): State<TaskApiState>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
) -> Result<Json<ApiEnvelope<QueueMetrics>>, ApiError> {
    let rid = request_id(&headers);
    require_non_empty("tenant_id", &tenant_id).map_err(|e| e.with_request_id(rid.clone()))?;
    let delivery = state.delivery.clone();
    let metrics = run_blocking(&rid, move || delivery.queue_metrics(&tenant_id)).await?;
    Ok(Json(ApiEnvelope::ok(rid, metrics)))
}

pub async fn job_status(
    State(state): State<TaskApiState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<Json<ApiEnvelope<JobView>>, ApiError> {
    let rid = request_id(&headers);
    let job_id = parse_job_id(&job_id, &rid)?;
    let jobs = state.jobs.clone();
    let view = run_blocking(&rid, move || jobs.job_status(&job_id)).await?;
    Ok(Json(ApiEnvelope::ok(rid, view)))
}

pub async fn pause_job(
    State(state): State<TaskApiState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<Json<ApiEnvelope<JobActionResponse>>, ApiError> {
    let rid = request_id(&headers);
    let job_id = parse_job_id(&job_id, &rid)?;
    let jobs = state.jobs.clone();
    let job = run_blocking(&rid, move || jobs.pause(&job_id, Utc::now())).await?;
    Ok(Json(ApiEnvelope::ok(rid, job_action_response(job))))
}

pub async fn resume_job(
    State(state): State<TaskApiState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<Json<ApiEnvelope<JobActionResponse>>, ApiError> {
    let rid = request_id(&headers);
    let job_id = parse_job_id(&job_id, &rid)?;
    let jobs = state.jobs.clone();
    let job = run_blocking(&rid, move || jobs.resume(&job_id, Utc::now())).await?;
    Ok(Json(ApiEnvelope::ok(rid, job_action_response(job))))
}

pub async fn abort_job(
    State(state): State<TaskApiState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
    body: Result<Json<AbortJobRequest>, JsonRejection>,
) -> Result<Json<ApiEnvelope<JobActionResponse>>, ApiError> {
    let rid = request_id(&headers);
    let job_id = parse_job_id(&job_id, &rid)?;
    let req = json_body(body, &rid)?;
    let reason = req
        .reason
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| "aborted by operator".to_string());
    let jobs = state.jobs.clone();
    let job = run_blocking(&rid, move || jobs.abort(&job_id, &reason, Utc::now())).await?;
    Ok(Json(ApiEnvelope::ok(rid, job_action_response(job))))
}
