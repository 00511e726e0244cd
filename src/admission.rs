//! Job admission: validation, idempotency, retry and cancel semantics.
//!
//! Thin facade between the HTTP surface and the store/queue pair. This is
//! where duplicate create requests collapse onto one job and where the
//! retry/cancel state rules are enforced.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

use crate::job_store::{Job, JobStatus, JobStore};
use crate::queue::{DownloadPayload, JobQueue};

/// Admission error taxonomy, mapped onto HTTP status codes by the server
/// layer: validation and state errors are the caller's fault, dependency
/// errors are ours.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    State(String),
    #[error("{0}")]
    Dependency(String),
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Dependency(format!("{e:#}"))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateJobRequest {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub track_id: String,
    #[serde(default)]
    pub pic_id: String,
    #[serde(default)]
    pub lyric_id: String,
    #[serde(default)]
    pub library_id: String,
    #[serde(default)]
    pub quality: String,
    #[serde(default)]
    pub idempotency_key: String,
    /// Accepted for forward compatibility; the path builder currently
    /// derives everything from metadata.
    #[serde(default)]
    pub path_policy: Option<serde_json::Value>,

    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub album: String,
    #[serde(default)]
    pub track_number: i64,
    #[serde(default)]
    pub year: i64,
}

#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct JobActionResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ListJobsResponse {
    pub jobs: Vec<Job>,
    pub count: usize,
}

/// Admission service over the job store and the task queue.
pub struct JobService {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
}

impl JobService {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn JobQueue>) -> Self {
        Self { store, queue }
    }

    /// Admit a download request. Requests sharing an idempotency key
    /// collapse onto the existing job without a second enqueue.
    pub fn create(&self, request: CreateJobRequest) -> Result<CreateJobResponse, ApiError> {
        let source = request.source.trim().to_string();
        let track_id = request.track_id.trim().to_string();
        let library_id = request.library_id.trim().to_string();
        if source.is_empty() {
            return Err(ApiError::Validation("source is required".to_string()));
        }
        if track_id.is_empty() {
            return Err(ApiError::Validation("track_id is required".to_string()));
        }
        if library_id.is_empty() {
            return Err(ApiError::Validation("library_id is required".to_string()));
        }

        let quality = if request.quality.trim().is_empty() {
            "best".to_string()
        } else {
            request.quality.trim().to_string()
        };

        let idempotency_key = if request.idempotency_key.trim().is_empty() {
            format!("{source}:{track_id}:{library_id}")
        } else {
            request.idempotency_key.trim().to_string()
        };

        if let Some(existing) = self.store.find_by_idempotency_key(&idempotency_key)? {
            info!(job_id = %existing.id, "job already exists");
            return Ok(CreateJobResponse {
                job_id: existing.id,
                status: existing.status,
                message: Some("job already exists".to_string()),
            });
        }

        let job = Job::new(
            uuid::Uuid::new_v4().to_string(),
            idempotency_key,
            source.clone(),
            track_id.clone(),
        )
        .with_library(library_id.clone(), quality.clone())
        .with_aux_ids(request.pic_id.clone(), request.lyric_id.clone())
        .with_metadata(
            request.title,
            request.artist,
            request.album,
            request.track_number,
            request.year,
        );

        self.store.insert(&job)?;

        let payload = build_payload(&job);
        if let Err(e) = self.queue.enqueue(&payload) {
            error!(job_id = %job.id, "failed to enqueue task: {e:#}");
            if let Err(mark_err) = self.store.mark_failed(&job.id, &format!("{e:#}")) {
                error!(job_id = %job.id, "failed to mark job as failed: {mark_err:#}");
            }
            return Err(ApiError::Dependency("failed to enqueue task".to_string()));
        }

        info!(job_id = %job.id, source = %source, track_id = %track_id, "job created and enqueued");
        Ok(CreateJobResponse {
            job_id: job.id,
            status: JobStatus::Queued,
            message: Some("job created successfully".to_string()),
        })
    }

    pub fn get(&self, id: &str) -> Result<Job, ApiError> {
        self.store
            .get(id)?
            .ok_or_else(|| ApiError::NotFound("job not found".to_string()))
    }

    pub fn list(&self, status: Option<JobStatus>) -> Result<ListJobsResponse, ApiError> {
        let jobs = self.store.list(status, 50)?;
        let count = jobs.len();
        Ok(ListJobsResponse { jobs, count })
    }

    /// Re-run a failed job. The only transition that moves a job backward.
    pub fn retry(&self, id: &str) -> Result<JobActionResponse, ApiError> {
        let job = self.get(id)?;
        if job.status != JobStatus::Failed {
            return Err(ApiError::State(
                "only failed jobs can be retried".to_string(),
            ));
        }

        // Guarded reset: a concurrent retry loses the race here.
        if !self.store.try_reset_for_retry(id)? {
            return Err(ApiError::State(
                "only failed jobs can be retried".to_string(),
            ));
        }

        let payload = build_payload(&job);
        if let Err(e) = self.queue.enqueue(&payload) {
            error!(job_id = %id, "failed to enqueue retry: {e:#}");
            if let Err(mark_err) = self.store.mark_failed(id, &format!("{e:#}")) {
                error!(job_id = %id, "failed to mark job as failed: {mark_err:#}");
            }
            return Err(ApiError::Dependency("failed to enqueue task".to_string()));
        }

        info!(job_id = %id, "job queued for retry");
        Ok(JobActionResponse {
            job_id: id.to_string(),
            status: JobStatus::Queued,
            message: "job queued for retry".to_string(),
        })
    }

    /// Cancel a job. Best-effort against an in-flight worker: the worker
    /// abandons the job at its next stage boundary.
    pub fn cancel(&self, id: &str) -> Result<JobActionResponse, ApiError> {
        let job = self.get(id)?;
        if job.status == JobStatus::Done || job.status == JobStatus::Failed {
            return Err(ApiError::State(
                "cannot cancel completed or failed job".to_string(),
            ));
        }

        if !self.store.try_cancel(id, "cancelled by user")? {
            return Err(ApiError::State(
                "cannot cancel completed or failed job".to_string(),
            ));
        }

        info!(job_id = %id, "job cancelled");
        Ok(JobActionResponse {
            job_id: id.to_string(),
            status: JobStatus::Cancelled,
            message: "job cancelled successfully".to_string(),
        })
    }

    /// Number of queued jobs, surfaced by the health endpoints. An error
    /// here means the store is unreachable.
    pub fn queued_jobs(&self) -> Result<i64> {
        self.store.count_by_status(JobStatus::Queued)
    }
}

/// Build the queue envelope for a job, defaulting pic/lyric ids to the
/// track id when absent.
fn build_payload(job: &Job) -> DownloadPayload {
    let pic_id = if job.pic_id.is_empty() {
        job.track_id.clone()
    } else {
        job.pic_id.clone()
    };
    let lyric_id = if job.lyric_id.is_empty() {
        job.track_id.clone()
    } else {
        job.lyric_id.clone()
    };

    DownloadPayload {
        job_id: job.id.clone(),
        source: job.source.clone(),
        track_id: job.track_id.clone(),
        pic_id,
        lyric_id,
        library_id: job.library_id.clone(),
        quality: job.quality.clone(),
    }
}
