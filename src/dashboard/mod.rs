use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::channel::ChannelView;
use crate::driver::DriverContext;
use crate::error::GridError;
use crate::policy::SystemInfo;
use crate::scheduler::job::{Job, JobSpec, JobStatus, Metadata, TaskState};
use crate::stats::StatsSnapshot;

#[derive(Clone)]
pub struct DashboardState {
    pub ctx: Arc<DriverContext>,
}

impl DashboardState {
    pub fn new(ctx: Arc<DriverContext>) -> Self {
        Self { ctx }
    }
}

#[derive(Serialize)]
struct DriverResponse {
    uuid: String,
    stats: StatsSnapshot,
    properties: SystemInfo,
    connections: usize,
    idle_nodes: Vec<String>,
    offline_units: usize,
}

#[derive(Serialize)]
struct JobSummary {
    uuid: Uuid,
    name: String,
    status: JobStatus,
    priority: i32,
    broadcast_uuid: Option<String>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    tasks: usize,
    queued: usize,
    in_flight: usize,
    returned: usize,
    failed: usize,
    cancelled: usize,
}

#[derive(Serialize)]
struct TaskResponse {
    position: usize,
    #[serde(flatten)]
    state: TaskState,
    resubmit_count: u32,
    expiration_count: u32,
    result: Option<String>,
}

#[derive(Serialize)]
struct JobDetailResponse {
    #[serde(flatten)]
    summary: JobSummary,
    uuid_path: Vec<String>,
    metadata: Metadata,
    dispatches: Vec<u64>,
    task_states: Vec<TaskResponse>,
}

#[derive(Serialize)]
struct SubmitJobResponse {
    success: bool,
    job_id: Option<String>,
    error: Option<String>,
}

#[derive(Serialize)]
struct CancelJobResponse {
    cancelled: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Maps driver errors onto HTTP statuses.
struct ApiError(GridError);

impl From<GridError> for ApiError {
    fn from(e: GridError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GridError::JobNotFound(_) | GridError::ChannelNotFound(_) => StatusCode::NOT_FOUND,
            GridError::InvalidArgument(_) | GridError::InvalidState(_) => StatusCode::BAD_REQUEST,
            GridError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorResponse { error: self.0.to_string() })).into_response()
    }
}

/// Management routes, without CORS. Tests drive this router directly.
pub fn router(state: DashboardState) -> Router {
    Router::new()
        .route("/api/driver", get(driver_handler))
        .route("/api/nodes", get(list_nodes_handler))
        .route("/api/nodes/:uuid/enable", post(enable_node_handler))
        .route("/api/nodes/:uuid/disable", post(disable_node_handler))
        .route("/api/nodes/:uuid/close", post(close_node_handler))
        .route("/api/jobs", get(list_jobs_handler).post(submit_job_handler))
        .route("/api/jobs/:id", get(job_handler))
        .route("/api/jobs/:id/cancel", post(cancel_job_handler))
        .route("/api/reservations", get(reservations_handler))
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState) {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = router(state).layer(cors);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn driver_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let ctx = &state.ctx;
    let idle_nodes = ctx
        .idle_pool
        .snapshot()
        .await
        .iter()
        .map(|c| c.uuid().to_string())
        .collect();
    Json(DriverResponse {
        uuid: ctx.config.uuid.clone(),
        stats: ctx.stats.snapshot(),
        properties: ctx.driver_info().await,
        connections: ctx.connection_count().await,
        idle_nodes,
        offline_units: ctx.offline.len().await,
    })
}

async fn list_nodes_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let mut nodes: Vec<ChannelView> = Vec::new();
    for channel in state.ctx.connections().await {
        nodes.push(channel.view().await);
    }
    Json(nodes)
}

async fn enable_node_handler(
    State(state): State<DashboardState>,
    Path(uuid): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.ctx.set_node_enabled(&uuid, true).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn disable_node_handler(
    State(state): State<DashboardState>,
    Path(uuid): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.ctx.set_node_enabled(&uuid, false).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn close_node_handler(
    State(state): State<DashboardState>,
    Path(uuid): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.ctx.close_node(&uuid).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_jobs_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let mut jobs = Vec::new();
    for job in state.ctx.queue.jobs().await {
        jobs.push(summarize(&job).await);
    }
    Json(jobs)
}

async fn job_handler(
    State(state): State<DashboardState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobDetailResponse>, ApiError> {
    let job = state.ctx.queue.get(&id).await.ok_or(GridError::JobNotFound(id))?;
    let summary = summarize(&job).await;
    let js = job.lock().await;
    let mut dispatches: Vec<u64> = js.dispatches.keys().copied().collect();
    dispatches.sort_unstable();
    let task_states = js
        .tasks
        .iter()
        .map(|t| TaskResponse {
            position: t.position,
            state: t.state.clone(),
            resubmit_count: t.resubmit_count,
            expiration_count: t.expiration_count,
            result: t.result.as_ref().map(|r| String::from_utf8_lossy(r).into_owned()),
        })
        .collect();
    Ok(Json(JobDetailResponse {
        summary,
        uuid_path: job.uuid_path().to_vec(),
        metadata: job.metadata().clone(),
        dispatches,
        task_states,
    }))
}

async fn submit_job_handler(
    State(state): State<DashboardState>,
    Json(spec): Json<JobSpec>,
) -> impl IntoResponse {
    match state.ctx.submit_job(spec).await {
        Ok(job) => (
            StatusCode::OK,
            Json(SubmitJobResponse {
                success: true,
                job_id: Some(job.uuid().to_string()),
                error: None,
            }),
        ),
        Err(e) => {
            let status = match e {
                GridError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_REQUEST,
            };
            (
                status,
                Json(SubmitJobResponse {
                    success: false,
                    job_id: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

async fn cancel_job_handler(
    State(state): State<DashboardState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CancelJobResponse>, ApiError> {
    let cancelled = state.ctx.cancel_job(id).await?;
    tracing::info!(job = %id, cancelled, "Job cancel requested");
    Ok(Json(CancelJobResponse { cancelled }))
}

async fn reservations_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.ctx.reservations.view().await)
}

async fn summarize(job: &Job) -> JobSummary {
    let js = job.lock().await;
    let count = |f: fn(&TaskState) -> bool| js.tasks.iter().filter(|t| f(&t.state)).count();
    JobSummary {
        uuid: job.uuid(),
        name: job.name().to_string(),
        status: js.status(),
        priority: job.sla().priority,
        broadcast_uuid: job.broadcast_uuid().map(str::to_string),
        created_at: job.created_at(),
        completed_at: js.completed_at,
        tasks: js.tasks.len(),
        queued: js.queued.len(),
        in_flight: count(|s| matches!(s, TaskState::Dispatched { .. })),
        returned: count(|s| matches!(s, TaskState::Returned)),
        failed: count(|s| matches!(s, TaskState::Failed { .. })),
        cancelled: count(|s| matches!(s, TaskState::Cancelled)),
    }
}
