//! Handlers for job submission, polling, stopping and cleanup.
//!
//! Handlers only read the registry; job records are written by each job's
//! supervisor (see [`crate::engine::supervisor`]).

use std::time::{Duration, Instant};

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use adgen_core::artifact::Artifact;
use adgen_core::job::{Job, JobCounts, JobStatus};
use adgen_core::request::PipelineRequest;
use adgen_core::step::PipelineStep;
use adgen_core::types::{JobId, Timestamp};

use crate::error::{AppError, AppResult};
use crate::metrics::SystemMetrics;
use crate::state::AppState;

/// Extra time a stop request waits beyond the kill grace period for the
/// supervisor to record the final status.
const STOP_WAIT_MARGIN: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct StartedResponse {
    pub job_id: JobId,
    pub status: &'static str,
}

/// Full view of one job for `GET /status/{job_id}`.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    pub progress_percent: u8,
    pub current_step: PipelineStep,
    pub sub_step: Option<String>,
    pub message: String,
    pub elapsed_sec: f64,
    pub eta_seconds: i64,
    pub step_eta_seconds: i64,
    pub system_metrics: SystemMetrics,
    pub parameters: PipelineRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step1_result: Option<Artifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step2_result: Option<Artifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_result: Option<Artifact>,
}

impl StatusResponse {
    fn from_job(job: Job, now: Timestamp, system_metrics: SystemMetrics) -> Self {
        let (eta_seconds, step_eta_seconds) = job.eta_at(now);
        Self {
            elapsed_sec: round_tenths(job.elapsed_secs(now)),
            job_id: job.id,
            status: job.status,
            progress_percent: job.progress_percent,
            current_step: job.current_step,
            sub_step: job.sub_step,
            message: job.message,
            eta_seconds,
            step_eta_seconds,
            system_metrics,
            parameters: job.parameters,
            step1_result: job.step1_image,
            step2_result: job.step2_image,
            final_result: job.final_image,
        }
    }
}

/// One row of `GET /jobs`. Artifacts are left out to keep the list small.
#[derive(Debug, Serialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub status: JobStatus,
    pub progress_percent: u8,
    pub current_step: PipelineStep,
    pub message: String,
    pub start_time: Option<Timestamp>,
    pub elapsed_sec: f64,
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    #[serde(flatten)]
    pub counts: JobCounts,
    pub jobs: Vec<JobSummary>,
}

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub job_id: JobId,
    pub status: JobStatus,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub job_id: JobId,
    pub status: &'static str,
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ResetStatistics {
    pub stopped_jobs: usize,
    pub deleted_jobs: usize,
    pub terminated_processes: usize,
    pub elapsed_sec: f64,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub status: &'static str,
    pub message: &'static str,
    pub statistics: ResetStatistics,
}

fn round_tenths(secs: f64) -> f64 {
    (secs * 10.0).round() / 10.0
}

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

/// POST /generate
///
/// Admit a new job and return its id immediately. Responds 503 with a
/// `Retry-After` hint while another job is active.
pub async fn generate(
    State(state): State<AppState>,
    body: Result<Json<PipelineRequest>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(request) = body.map_err(|e| AppError::BadRequest(e.body_text()))?;

    let job_id = state.admission.submit(request).await?;

    tracing::info!(job_id = %job_id, "Generation job started");

    Ok(Json(StartedResponse {
        job_id,
        status: "started",
    }))
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// GET /status/{job_id}
pub async fn get_status(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let job = state.registry.get(&job_id).await?;
    let metrics = state.monitor.collect();
    Ok(Json(StatusResponse::from_job(job, Utc::now(), metrics)))
}

/// GET /jobs
pub async fn list_jobs(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let now = Utc::now();
    let jobs = state.registry.list().await;
    let counts = JobCounts::tally(&jobs);

    let jobs = jobs
        .into_iter()
        .map(|job| JobSummary {
            elapsed_sec: round_tenths(job.elapsed_secs(now)),
            job_id: job.id,
            status: job.status,
            progress_percent: job.progress_percent,
            current_step: job.current_step,
            message: job.message,
            start_time: job.start_time,
        })
        .collect();

    Ok(Json(JobListResponse { counts, jobs }))
}

// ---------------------------------------------------------------------------
// Stop
// ---------------------------------------------------------------------------

/// POST /stop/{job_id}
///
/// Ask the worker to stop at its next step boundary, kill it if it has not
/// exited within the grace period, and report the resulting status. Jobs
/// that already finished are left untouched.
pub async fn stop_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let job = state.registry.get(&job_id).await?;
    if job.status.is_terminal() {
        return Ok(Json(StopResponse {
            job_id,
            status: job.status,
        }));
    }

    match state.processes.get(&job_id).await {
        Some(handle) => {
            tracing::info!(job_id = %job_id, pid = ?handle.pid(), "Stop requested");
            handle.request_stop();
            let grace = state.admission.stop_grace();
            if !handle.wait_finished(grace * 2 + STOP_WAIT_MARGIN).await {
                tracing::warn!(job_id = %job_id, "Worker has not exited yet");
            }
        }
        None => {
            tracing::warn!(job_id = %job_id, "Active job has no worker handle");
        }
    }

    let job = state.registry.get(&job_id).await?;
    Ok(Json(StopResponse {
        job_id,
        status: job.status,
    }))
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

/// DELETE /jobs/{job_id}
///
/// Remove a finished job and its worker handle. Active jobs must be stopped
/// first.
pub async fn delete_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    state.registry.delete(&job_id).await?;
    state.processes.remove(&job_id).await;

    tracing::info!(job_id = %job_id, "Job deleted");

    Ok(Json(DeleteResponse {
        job_id,
        status: "deleted",
        message: "Job successfully deleted from memory",
    }))
}

// ---------------------------------------------------------------------------
// Reset
// ---------------------------------------------------------------------------

/// POST /server-reset
///
/// Development aid: stop every running worker and forget all jobs.
pub async fn server_reset(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let started = Instant::now();
    let grace = state.admission.stop_grace();

    let stopped_jobs = state.processes.stop_all(grace * 2 + STOP_WAIT_MARGIN).await;
    let deleted_jobs = state.registry.clear().await;
    let terminated_processes = state.processes.clear().await;

    let elapsed_sec = round_tenths(started.elapsed().as_secs_f64());
    tracing::warn!(
        stopped_jobs,
        deleted_jobs,
        terminated_processes,
        elapsed_sec,
        "Server reset",
    );

    Ok(Json(ResetResponse {
        status: "success",
        message: "Server reset completed successfully",
        statistics: ResetStatistics {
            stopped_jobs,
            deleted_jobs,
            terminated_processes,
            elapsed_sec,
        },
    }))
}
