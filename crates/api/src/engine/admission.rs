use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use adgen_core::error::CoreError;
use adgen_core::protocol::WorkerInput;
use adgen_core::request::PipelineRequest;
use adgen_core::types::{new_job_id, JobId};

use crate::engine::launcher::{LaunchError, WorkerLauncher};
use crate::engine::registry::JobRegistry;
use crate::engine::supervisor::{spawn_supervisor, JobHandle, ProcessTable};

/// Why a submission was not admitted.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("Busy. Retry after {retry_after}s")]
    Busy { retry_after: u64 },

    #[error(transparent)]
    Invalid(#[from] CoreError),

    #[error(transparent)]
    Launch(#[from] LaunchError),
}

/// Gatekeeper for new jobs: at most one job is active at a time.
pub struct AdmissionController {
    registry: Arc<JobRegistry>,
    processes: Arc<ProcessTable>,
    launcher: Arc<dyn WorkerLauncher>,
    total_estimate_secs: u64,
    stop_grace: Duration,
}

impl AdmissionController {
    pub fn new(
        registry: Arc<JobRegistry>,
        processes: Arc<ProcessTable>,
        launcher: Arc<dyn WorkerLauncher>,
        total_estimate_secs: u64,
        stop_grace: Duration,
    ) -> Self {
        Self {
            registry,
            processes,
            launcher,
            total_estimate_secs,
            stop_grace,
        }
    }

    pub fn stop_grace(&self) -> Duration {
        self.stop_grace
    }

    /// Validate, reserve the accelerator, and launch a worker.
    ///
    /// Returns the new job id as soon as the worker is running. A rejected
    /// or failed submission leaves neither a registry entry nor a handle
    /// behind.
    pub async fn submit(&self, request: PipelineRequest) -> Result<JobId, AdmissionError> {
        let request = request.validated()?;
        let job_id = new_job_id();

        // The handle exists before the job is visible, so a stop for it
        // always finds one, even while the worker is still launching.
        let (handle, seed) = JobHandle::reserve();
        self.processes.insert(job_id.clone(), handle.clone()).await;

        if let Err(active) = self
            .registry
            .insert_if_idle(job_id.clone(), request.clone(), Utc::now())
            .await
        {
            let retry_after = retry_after(self.total_estimate_secs, active.elapsed_secs);
            tracing::info!(
                active_job_id = %active.id,
                elapsed_secs = active.elapsed_secs,
                retry_after,
                "Rejecting submission, accelerator busy",
            );
            self.processes.remove(&job_id).await;
            return Err(AdmissionError::Busy { retry_after });
        }

        let input = WorkerInput {
            job_id: job_id.clone(),
            request,
        };
        let worker = match self.launcher.launch(input).await {
            Ok(worker) => worker,
            Err(e) => {
                self.registry.remove(&job_id).await;
                self.processes.remove(&job_id).await;
                seed.abandon();
                tracing::error!(job_id = %job_id, error = %e, "Worker launch failed");
                return Err(e.into());
            }
        };

        spawn_supervisor(
            seed,
            job_id.clone(),
            worker,
            Arc::clone(&self.registry),
            self.stop_grace,
        );
        tracing::info!(
            job_id = %job_id,
            pid = ?handle.pid(),
            stop_pending = handle.stop_requested(),
            "Job admitted",
        );

        Ok(job_id)
    }
}

/// Seconds until the active job is expected to finish, floored at zero.
pub fn retry_after(total_estimate_secs: u64, elapsed_secs: f64) -> u64 {
    (total_estimate_secs as f64 - elapsed_secs).max(0.0) as u64
}
