//! coregrid-api — REST API for the coregrid workload manager.
//!
//! Maps HTTP verbs onto [`SelectEngine`] placement and allocation
//! bookkeeping and onto [`StepManager`] step accounting.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/jobs/place` | Place a job (run now, will-run, test-only) |
//! | POST | `/api/v1/allocations` | Commit a placement |
//! | DELETE | `/api/v1/allocations/{job_id}?mode=` | Release or suspend an allocation |
//! | POST | `/api/v1/allocations/{job_id}/resume` | Resume a suspended allocation |
//! | GET | `/api/v1/nodes` | Node allocation state |
//! | POST | `/api/v1/steps/{job_id}/{step_id}/tasks` | Start accounting a task |
//! | GET | `/api/v1/steps/{job_id}/{step_id}?profile=` | Poll a step's usage |
//! | DELETE | `/api/v1/steps/{job_id}/{step_id}` | End a step |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post};
use coregrid_acct::StepManager;
use coregrid_select::SelectEngine;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<SelectEngine>,
    pub steps: Arc<StepManager>,
}

/// Build the complete API router.
pub fn build_router(engine: Arc<SelectEngine>, steps: Arc<StepManager>) -> Router {
    let state = ApiState { engine, steps };

    let api_routes = Router::new()
        .route("/jobs/place", post(handlers::place_job))
        .route("/allocations", post(handlers::commit_allocation))
        .route("/allocations/{job_id}", delete(handlers::release_allocation))
        .route("/allocations/{job_id}/resume", post(handlers::resume_allocation))
        .route("/nodes", get(handlers::node_states))
        .route("/steps/{job_id}/{step_id}/tasks", post(handlers::step_add_task))
        .route("/steps/{job_id}/{step_id}", get(handlers::step_poll).delete(handlers::step_end))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
