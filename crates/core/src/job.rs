//! Job records and the patches that mutate them.
//!
//! A [`Job`] is created `Pending` at admission and afterwards only changes
//! through [`JobPatch`]es produced by its worker. Once a job reaches a
//! terminal status it is frozen.

use serde::{Deserialize, Serialize};

use crate::artifact::Artifact;
use crate::request::PipelineRequest;
use crate::step::PipelineStep;
use crate::types::{JobId, Timestamp};

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl JobStatus {
    /// Pending or Running: the job occupies the accelerator.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full state of one generation job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub progress_percent: u8,
    pub current_step: PipelineStep,
    pub sub_step: Option<String>,
    pub message: String,
    pub created_at: Timestamp,
    pub start_time: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    pub eta_seconds: i64,
    pub step_eta_seconds: i64,
    /// When the worker last reported the ETA values above.
    pub eta_updated_at: Option<Timestamp>,
    /// The submitted request, kept for reproducibility and resubmission.
    pub parameters: PipelineRequest,
    pub step1_image: Option<Artifact>,
    pub step2_image: Option<Artifact>,
    pub final_image: Option<Artifact>,
}

impl Job {
    /// A freshly admitted job that has not started yet.
    pub fn pending(id: JobId, parameters: PipelineRequest, now: Timestamp) -> Self {
        let current_step = parameters.step_range().start;
        Self {
            id,
            status: JobStatus::Pending,
            progress_percent: 0,
            current_step,
            sub_step: None,
            message: "Initializing...".to_string(),
            created_at: now,
            start_time: None,
            finished_at: None,
            eta_seconds: 0,
            step_eta_seconds: 0,
            eta_updated_at: None,
            parameters,
            step1_image: None,
            step2_image: None,
            final_image: None,
        }
    }

    /// Seconds since the job started running, frozen once it finished.
    pub fn elapsed_secs(&self, now: Timestamp) -> f64 {
        let Some(start) = self.start_time else {
            return 0.0;
        };
        let end = self.finished_at.unwrap_or(now);
        ((end - start).num_milliseconds().max(0) as f64) / 1000.0
    }

    /// Total and step ETA as of `now`.
    ///
    /// While running, the time since the worker's last report is deducted, so
    /// the countdown keeps moving during a long model call and goes negative
    /// once the call overruns its estimate.
    pub fn eta_at(&self, now: Timestamp) -> (i64, i64) {
        let since_report = match (self.status, self.eta_updated_at) {
            (JobStatus::Running, Some(at)) => (now - at).num_seconds().max(0),
            _ => 0,
        };
        (
            self.eta_seconds - since_report,
            self.step_eta_seconds - since_report,
        )
    }

    /// Apply a patch. Terminal jobs are frozen and ignore further patches.
    ///
    /// Returns `false` if the patch was discarded.
    pub fn apply(&mut self, patch: JobPatch) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(progress) = patch.progress_percent {
            self.progress_percent = progress.min(100);
        }
        if let Some(step) = patch.current_step {
            self.current_step = step;
        }
        if let Some(sub_step) = patch.sub_step {
            self.sub_step = Some(sub_step);
        }
        if let Some(message) = patch.message {
            self.message = message;
        }
        if let Some(start) = patch.start_time {
            self.start_time = Some(start);
        }
        if let Some(finished) = patch.finished_at {
            self.finished_at = Some(finished);
        }
        if let Some(eta) = patch.eta_seconds {
            self.eta_seconds = eta;
        }
        if let Some(eta) = patch.step_eta_seconds {
            self.step_eta_seconds = eta;
        }
        if let Some(at) = patch.eta_updated_at {
            self.eta_updated_at = Some(at);
        }
        if let Some(img) = patch.step1_image {
            self.step1_image = Some(img);
        }
        if let Some(img) = patch.step2_image {
            self.step2_image = Some(img);
        }
        if let Some(img) = patch.final_image {
            self.final_image = Some(img);
        }
        true
    }
}

/// A partial update to a [`Job`]. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_percent: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<PipelineStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_eta_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_updated_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step1_image: Option<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step2_image: Option<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_image: Option<Artifact>,
}

impl JobPatch {
    /// Patch that moves the job to a terminal status.
    pub fn terminal(status: JobStatus, message: impl Into<String>, now: Timestamp) -> Self {
        Self {
            status: Some(status),
            message: Some(message.into()),
            finished_at: Some(now),
            ..Default::default()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_some_and(JobStatus::is_terminal)
    }
}

/// Aggregate counts reported by `GET /jobs`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub total_jobs: usize,
    pub active_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
}

impl JobCounts {
    pub fn tally<'a>(jobs: impl IntoIterator<Item = &'a Job>) -> Self {
        jobs.into_iter().fold(Self::default(), |mut acc, job| {
            acc.total_jobs += 1;
            match job.status {
                s if s.is_active() => acc.active_jobs += 1,
                JobStatus::Completed => acc.completed_jobs += 1,
                JobStatus::Failed => acc.failed_jobs += 1,
                _ => {}
            }
            acc
        })
    }
}
