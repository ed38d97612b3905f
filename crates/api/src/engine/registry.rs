use std::collections::HashMap;

use tokio::sync::RwLock;

use adgen_core::error::CoreError;
use adgen_core::job::{Job, JobPatch};
use adgen_core::request::PipelineRequest;
use adgen_core::types::{JobId, Timestamp};

/// The job that currently holds the accelerator.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveJob {
    pub id: JobId,
    /// Seconds since it started running, or since admission if still pending.
    pub elapsed_secs: f64,
}

/// Why a job could not be deleted.
#[derive(Debug, thiserror::Error)]
pub enum DeleteError {
    #[error(transparent)]
    NotFound(#[from] CoreError),

    #[error("job {0} is still active")]
    Active(JobId),
}

/// In-memory store of every job this process has admitted.
///
/// Thread-safe via interior `RwLock`; designed to be wrapped in `Arc` and
/// shared across the application. Job state only changes through
/// [`JobRegistry::update`], which the job's supervisor is the sole caller of.
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a new pending job, unless another job is already active.
    ///
    /// The check and the insert happen under one write lock, so two
    /// concurrent submissions can never both be admitted.
    pub async fn insert_if_idle(
        &self,
        id: JobId,
        request: PipelineRequest,
        now: Timestamp,
    ) -> Result<(), ActiveJob> {
        let mut jobs = self.jobs.write().await;
        if let Some(active) = jobs.values().find(|j| j.status.is_active()) {
            let since = active.start_time.unwrap_or(active.created_at);
            return Err(ActiveJob {
                id: active.id.clone(),
                elapsed_secs: ((now - since).num_milliseconds().max(0) as f64) / 1000.0,
            });
        }
        jobs.insert(id.clone(), Job::pending(id, request, now));
        Ok(())
    }

    /// Insert or replace a job record unconditionally.
    pub async fn insert(&self, job: Job) {
        self.jobs.write().await.insert(job.id.clone(), job);
    }

    pub async fn get(&self, id: &str) -> Result<Job, CoreError> {
        self.jobs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| not_found(id))
    }

    /// Apply a patch to a job.
    ///
    /// Returns `false` if the job is unknown or already terminal.
    pub async fn update(&self, id: &str, patch: JobPatch) -> bool {
        match self.jobs.write().await.get_mut(id) {
            Some(job) => job.apply(patch),
            None => false,
        }
    }

    /// Delete a finished job. Active jobs must be stopped first.
    pub async fn delete(&self, id: &str) -> Result<Job, DeleteError> {
        let mut jobs = self.jobs.write().await;
        let active = match jobs.get(id) {
            Some(job) => job.status.is_active(),
            None => return Err(not_found(id).into()),
        };
        if active {
            return Err(DeleteError::Active(id.to_string()));
        }
        jobs.remove(id).ok_or_else(|| not_found(id).into())
    }

    /// Remove a job regardless of status. Used to roll back a failed launch.
    pub async fn remove(&self, id: &str) -> Option<Job> {
        self.jobs.write().await.remove(id)
    }

    /// All jobs, oldest first.
    pub async fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        jobs
    }

    /// The active job, if any.
    pub async fn active(&self) -> Option<Job> {
        self.jobs
            .read()
            .await
            .values()
            .find(|j| j.status.is_active())
            .cloned()
    }

    /// Drop every record. Returns how many were removed.
    pub async fn clear(&self) -> usize {
        let mut jobs = self.jobs.write().await;
        let count = jobs.len();
        jobs.clear();
        count
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(id: &str) -> CoreError {
    CoreError::NotFound {
        entity: "Job",
        id: id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::{Duration, Utc};

    use adgen_core::job::JobStatus;

    use super::*;

    fn patch(status: JobStatus) -> JobPatch {
        JobPatch {
            status: Some(status),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn second_admission_is_refused_while_first_is_active() {
        let registry = JobRegistry::new();
        let t0 = Utc::now();
        registry
            .insert_if_idle("a".into(), PipelineRequest::default(), t0)
            .await
            .unwrap();

        let busy = registry
            .insert_if_idle("b".into(), PipelineRequest::default(), t0 + Duration::seconds(12))
            .await
            .unwrap_err();
        assert_eq!(busy.id, "a");
        assert!((busy.elapsed_secs - 12.0).abs() < 1e-9);
        assert_matches!(registry.get("b").await, Err(CoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn elapsed_is_measured_from_start_time_once_running() {
        let registry = JobRegistry::new();
        let t0 = Utc::now();
        registry
            .insert_if_idle("a".into(), PipelineRequest::default(), t0)
            .await
            .unwrap();
        registry
            .update(
                "a",
                JobPatch {
                    status: Some(JobStatus::Running),
                    start_time: Some(t0 + Duration::seconds(5)),
                    ..Default::default()
                },
            )
            .await;

        let busy = registry
            .insert_if_idle("b".into(), PipelineRequest::default(), t0 + Duration::seconds(15))
            .await
            .unwrap_err();
        assert!((busy.elapsed_secs - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn admission_reopens_after_terminal_status() {
        let registry = JobRegistry::new();
        registry
            .insert_if_idle("a".into(), PipelineRequest::default(), Utc::now())
            .await
            .unwrap();
        assert!(registry.update("a", patch(JobStatus::Failed)).await);
        assert!(registry.active().await.is_none());
        registry
            .insert_if_idle("b".into(), PipelineRequest::default(), Utc::now())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn terminal_jobs_ignore_updates() {
        let registry = JobRegistry::new();
        registry
            .insert_if_idle("a".into(), PipelineRequest::default(), Utc::now())
            .await
            .unwrap();
        assert!(registry.update("a", patch(JobStatus::Stopped)).await);
        assert!(!registry.update("a", patch(JobStatus::Completed)).await);
        assert_eq!(registry.get("a").await.unwrap().status, JobStatus::Stopped);
        assert!(!registry.update("missing", patch(JobStatus::Running)).await);
    }

    #[tokio::test]
    async fn delete_refuses_active_and_unknown_jobs() {
        let registry = JobRegistry::new();
        registry
            .insert_if_idle("a".into(), PipelineRequest::default(), Utc::now())
            .await
            .unwrap();

        assert_matches!(registry.delete("a").await, Err(DeleteError::Active(id)) if id == "a");
        assert_matches!(registry.delete("nope").await, Err(DeleteError::NotFound(_)));

        registry.update("a", patch(JobStatus::Completed)).await;
        assert_eq!(registry.delete("a").await.unwrap().id, "a");
        assert_matches!(registry.delete("a").await, Err(DeleteError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_is_ordered_by_creation() {
        let registry = JobRegistry::new();
        let t0 = Utc::now();
        for (i, id) in ["c", "a", "b"].iter().enumerate() {
            let mut job = Job::pending(
                id.to_string(),
                PipelineRequest::default(),
                t0 + Duration::seconds(i as i64),
            );
            job.status = JobStatus::Completed;
            registry.insert(job).await;
        }
        let ids: Vec<_> = registry.list().await.into_iter().map(|j| j.id).collect();
        assert_eq!(ids, ["c", "a", "b"]);
        assert_eq!(registry.clear().await, 3);
        assert!(registry.list().await.is_empty());
    }
}
