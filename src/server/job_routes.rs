//! HTTP routes for job admission and inspection.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use super::auth::ApiKeyIdentity;
use super::state::ServerState;
use crate::admission::{ApiError, CreateJobRequest, JobService};
use crate::job_store::JobStatus;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Validation(_) | ApiError::State(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Dependency(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn job_routes() -> Router<ServerState> {
    Router::new()
        .route("/jobs", post(create_job).get(list_jobs))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/retry", post(retry_job))
        .route("/jobs/{id}/cancel", post(cancel_job))
}

async fn create_job(
    State(jobs): State<Arc<JobService>>,
    identity: Option<Extension<ApiKeyIdentity>>,
    Json(body): Json<CreateJobRequest>,
) -> Result<Response, ApiError> {
    if let Some(Extension(ApiKeyIdentity(name))) = identity {
        debug!(api_key = %name, source = %body.source, track_id = %body.track_id, "create job request");
    }
    let response = jobs.create(body)?;
    Ok(Json(response).into_response())
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
}

async fn list_jobs(
    State(jobs): State<Arc<JobService>>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    let status = match query.status.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => Some(
            JobStatus::from_str(raw)
                .ok_or_else(|| ApiError::Validation(format!("invalid status {raw:?}")))?,
        ),
        None => None,
    };
    let response = jobs.list(status)?;
    Ok(Json(response).into_response())
}

async fn get_job(
    State(jobs): State<Arc<JobService>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let job = jobs.get(&id)?;
    Ok(Json(job).into_response())
}

async fn retry_job(
    State(jobs): State<Arc<JobService>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let response = jobs.retry(&id)?;
    Ok(Json(response).into_response())
}

async fn cancel_job(
    State(jobs): State<Arc<JobService>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let response = jobs.cancel(&id)?;
    Ok(Json(response).into_response())
}

/// Health body shared by /healthz and /readyz. Reports 503 when the
/// store cannot be reached.
pub(super) async fn health(State(state): State<ServerState>) -> Response {
    match state.jobs.queued_jobs() {
        Ok(queued_jobs) => Json(json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": state.start_time.elapsed().as_secs(),
            "components": {
                "database": "healthy",
                "queue": "healthy",
            },
            "stats": {
                "queued_jobs": queued_jobs,
            },
        }))
        .into_response(),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "error": "database connection failed",
            })),
        )
            .into_response(),
    }
}
