//! REST API handlers.
//!
//! Engine and step-manager calls take locks and may read `/proc`, so each
//! one runs on the blocking pool.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use coregrid_acct::{AcctError, StepKey, StepLimits};
use coregrid_core::{JobId, JobRequest, JobResources};
use coregrid_select::{CancelToken, PlaceMode, ReleaseMode, SelectError};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

pub fn select_status(err: &SelectError) -> StatusCode {
    match err {
        SelectError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        SelectError::UnknownJob(_) => StatusCode::NOT_FOUND,
        SelectError::NoResources(_)
        | SelectError::Conflict(_)
        | SelectError::AlreadyCommitted(_)
        | SelectError::HeldNoPriority(_)
        | SelectError::PreemptionWouldLoop(_) => StatusCode::CONFLICT,
        SelectError::GresInfeasible(_) | SelectError::NodeMemoryExceeded(_) => StatusCode::UNPROCESSABLE_ENTITY,
        SelectError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
    }
}

pub fn acct_status(err: &AcctError) -> StatusCode {
    match err {
        AcctError::ShutdownInProgress => StatusCode::SERVICE_UNAVAILABLE,
        AcctError::UnknownStep(_) => StatusCode::NOT_FOUND,
        AcctError::BadPid(_) | AcctError::Options(_) => StatusCode::BAD_REQUEST,
        AcctError::StepExists(_) | AcctError::MemoryLimitExceeded { .. } => StatusCode::CONFLICT,
        AcctError::SamplerIo { .. } | AcctError::Parse { .. } | AcctError::Signal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn select_error(err: SelectError) -> Response {
    let status = select_status(&err);
    debug!(error = %err, status = status.as_u16(), "select request failed");
    error_response(&err.to_string(), status)
}

fn acct_error(err: AcctError) -> Response {
    let status = acct_status(&err);
    debug!(error = %err, status = status.as_u16(), "accounting request failed");
    error_response(&err.to_string(), status)
}

/// Run `f` on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, Response>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        warn!(error = %e, "blocking task failed");
        error_response("internal error", StatusCode::INTERNAL_SERVER_ERROR)
    })
}

// ── Placement ──────────────────────────────────────────────────

/// Place request body.
#[derive(Debug, Deserialize)]
pub struct PlaceRequest {
    pub job: JobRequest,
    #[serde(default)]
    pub mode: PlaceMode,
    #[serde(default)]
    pub preemptee_candidates: Vec<JobId>,
}

/// POST /api/v1/jobs/place
pub async fn place_job(State(state): State<ApiState>, Json(req): Json<PlaceRequest>) -> Response {
    let engine = state.engine.clone();
    let result = blocking(move || {
        engine.place_job(&req.job, req.mode, &req.preemptee_candidates, &CancelToken::new())
    })
    .await;
    match result {
        Ok(Ok(placement)) => ApiResponse::ok(placement).into_response(),
        Ok(Err(e)) => select_error(e),
        Err(resp) => resp,
    }
}

// ── Allocations ────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct EpochResponse {
    pub job_id: JobId,
    pub epoch: u64,
}

/// POST /api/v1/allocations
pub async fn commit_allocation(State(state): State<ApiState>, Json(res): Json<JobResources>) -> Response {
    let engine = state.engine.clone();
    let job_id = res.job_id;
    match blocking(move || engine.commit_allocation(res)).await {
        Ok(Ok(epoch)) => {
            info!(job = job_id, epoch, "allocation committed");
            (StatusCode::CREATED, ApiResponse::ok(EpochResponse { job_id, epoch })).into_response()
        }
        Ok(Err(e)) => select_error(e),
        Err(resp) => resp,
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ReleaseQuery {
    #[serde(default)]
    pub mode: ReleaseMode,
}

/// DELETE /api/v1/allocations/{job_id}?mode=
pub async fn release_allocation(
    State(state): State<ApiState>,
    Path(job_id): Path<JobId>,
    Query(query): Query<ReleaseQuery>,
) -> Response {
    let engine = state.engine.clone();
    let mode = query.mode;
    match blocking(move || engine.release_allocation(job_id, mode)).await {
        Ok(Ok(())) => {
            info!(job = job_id, ?mode, "allocation released");
            ApiResponse::ok("released").into_response()
        }
        Ok(Err(e)) => select_error(e),
        Err(resp) => resp,
    }
}

/// POST /api/v1/allocations/{job_id}/resume
pub async fn resume_allocation(State(state): State<ApiState>, Path(job_id): Path<JobId>) -> Response {
    let engine = state.engine.clone();
    match blocking(move || engine.resume_allocation(job_id)).await {
        Ok(Ok(epoch)) => ApiResponse::ok(EpochResponse { job_id, epoch }).into_response(),
        Ok(Err(e)) => select_error(e),
        Err(resp) => resp,
    }
}

// ── Nodes ──────────────────────────────────────────────────────

/// GET /api/v1/nodes
pub async fn node_states(State(state): State<ApiState>) -> Response {
    let engine = state.engine.clone();
    match blocking(move || engine.node_states()).await {
        Ok(nodes) => ApiResponse::ok(nodes).into_response(),
        Err(resp) => resp,
    }
}

// ── Steps ──────────────────────────────────────────────────────

/// Add-task request body.
#[derive(Debug, Deserialize)]
pub struct AddTaskRequest {
    pub pid: u32,
    #[serde(default)]
    pub node_id: u32,
    #[serde(default)]
    pub task_id: u32,
    /// Applied when this is the step's first task.
    #[serde(default)]
    pub limits: Option<StepLimits>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PollQuery {
    #[serde(default)]
    pub profile: bool,
}

/// POST /api/v1/steps/{job_id}/{step_id}/tasks
pub async fn step_add_task(
    State(state): State<ApiState>,
    Path((job_id, step_id)): Path<(u32, u32)>,
    Json(req): Json<AddTaskRequest>,
) -> Response {
    let steps = state.steps.clone();
    let step = StepKey::new(job_id, step_id);
    let pid = req.pid;
    match blocking(move || steps.step_add_task(step, req.pid, req.node_id, req.task_id, req.limits)).await {
        Ok(Ok(())) => (StatusCode::CREATED, ApiResponse::ok(serde_json::json!({ "step": step, "pid": pid })))
            .into_response(),
        Ok(Err(e)) => acct_error(e),
        Err(resp) => resp,
    }
}

/// GET /api/v1/steps/{job_id}/{step_id}?profile=
pub async fn step_poll(
    State(state): State<ApiState>,
    Path((job_id, step_id)): Path<(u32, u32)>,
    Query(query): Query<PollQuery>,
) -> Response {
    let steps = state.steps.clone();
    let step = StepKey::new(job_id, step_id);
    match blocking(move || steps.step_poll(step, query.profile)).await {
        Ok(Ok(acct)) => ApiResponse::ok(acct).into_response(),
        Ok(Err(e)) => acct_error(e),
        Err(resp) => resp,
    }
}

/// DELETE /api/v1/steps/{job_id}/{step_id}
pub async fn step_end(State(state): State<ApiState>, Path((job_id, step_id)): Path<(u32, u32)>) -> Response {
    let steps = state.steps.clone();
    let step = StepKey::new(job_id, step_id);
    match blocking(move || steps.step_end(step)).await {
        Ok(Ok(acct)) => ApiResponse::ok(acct).into_response(),
        Ok(Err(e)) => acct_error(e),
        Err(resp) => resp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_errors_map_to_statuses() {
        assert_eq!(select_status(&SelectError::InvalidRequest("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(select_status(&SelectError::UnknownJob(1)), StatusCode::NOT_FOUND);
        assert_eq!(select_status(&SelectError::NoResources("x".into())), StatusCode::CONFLICT);
        assert_eq!(select_status(&SelectError::AlreadyCommitted(1)), StatusCode::CONFLICT);
        assert_eq!(select_status(&SelectError::HeldNoPriority(1)), StatusCode::CONFLICT);
        assert_eq!(
            select_status(&SelectError::GresInfeasible("gpu".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            select_status(&SelectError::NodeMemoryExceeded("n0".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn acct_errors_map_to_statuses() {
        assert_eq!(acct_status(&AcctError::ShutdownInProgress), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(acct_status(&AcctError::UnknownStep(StepKey::new(1, 0))), StatusCode::NOT_FOUND);
        assert_eq!(acct_status(&AcctError::BadPid(0)), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn release_mode_defaults_to_normal() {
        let q: ReleaseQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(q.mode, ReleaseMode::Normal);
        let q: ReleaseQuery = serde_json::from_str(r#"{"mode":"suspend_mem_keep"}"#).unwrap();
        assert_eq!(q.mode, ReleaseMode::SuspendMemKeep);
    }
}
