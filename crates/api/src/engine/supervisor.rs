//! Per-job supervision.
//!
//! Every admitted job gets one supervisor task. It is the only writer of
//! that job's registry record after admission: it applies the worker's
//! patches in order, relays stop requests, escalates to a kill after the
//! grace period, and records a terminal status if the worker exits without
//! reporting one.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use adgen_core::job::{JobPatch, JobStatus};
use adgen_core::types::JobId;

use crate::engine::launcher::WorkerHandle;
use crate::engine::registry::JobRegistry;

pub const MSG_STOPPED: &str = "Job stopped by user.";

/// Server-side handle on a supervised job.
///
/// Created before the worker is launched, so a stop that arrives while the
/// launch is still in flight is held on the token and relayed once the
/// supervisor starts.
#[derive(Clone)]
pub struct JobHandle {
    stop: CancellationToken,
    finished: watch::Receiver<bool>,
    pid: Arc<OnceLock<u32>>,
}

/// The supervisor half of a [`JobHandle`], consumed when the worker is
/// launched (or abandoned when it could not be).
pub struct SupervisorSeed {
    stop: CancellationToken,
    done: watch::Sender<bool>,
    pid: Arc<OnceLock<u32>>,
}

impl JobHandle {
    /// Create the handle for a job whose worker has not been launched yet.
    pub fn reserve() -> (JobHandle, SupervisorSeed) {
        let stop = CancellationToken::new();
        let (done, finished) = watch::channel(false);
        let pid = Arc::new(OnceLock::new());
        let handle = JobHandle {
            stop: stop.clone(),
            finished,
            pid: Arc::clone(&pid),
        };
        (handle, SupervisorSeed { stop, done, pid })
    }

    /// Ask the job to stop. Idempotent.
    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// OS process id of the worker, once launched.
    pub fn pid(&self) -> Option<u32> {
        self.pid.get().copied()
    }

    /// Wait until the worker has exited and the job is terminal.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait_finished(&self, timeout: Duration) -> bool {
        let mut finished = self.finished.clone();
        let done = matches!(
            tokio::time::timeout(timeout, finished.wait_for(|done| *done)).await,
            Ok(Ok(_))
        );
        done
    }
}

impl SupervisorSeed {
    /// Release waiters on a job that never got a worker.
    pub fn abandon(self) {
        let _ = self.done.send(true);
    }
}

/// Start supervising `worker` for `job_id`.
///
/// A stop requested on the handle before this call is relayed to the worker
/// as soon as supervision starts.
pub fn spawn_supervisor(
    seed: SupervisorSeed,
    job_id: JobId,
    worker: WorkerHandle,
    registry: Arc<JobRegistry>,
    grace: Duration,
) {
    if let Some(pid) = worker.control.id() {
        let _ = seed.pid.set(pid);
    }

    tokio::spawn(supervise(job_id, worker, registry, seed.stop, grace, seed.done));
}

async fn supervise(
    job_id: JobId,
    mut worker: WorkerHandle,
    registry: Arc<JobRegistry>,
    stop: CancellationToken,
    grace: Duration,
    done: watch::Sender<bool>,
) {
    let mut stop_sent = false;
    let mut killed = false;
    let kill_timer = tokio::time::sleep(grace);
    tokio::pin!(kill_timer);

    loop {
        tokio::select! {
            patch = worker.patches.recv() => match patch {
                Some(patch) => {
                    let terminal = patch.is_terminal();
                    registry.update(&job_id, patch).await;
                    if terminal {
                        break;
                    }
                }
                None => break,
            },
            _ = stop.cancelled(), if !stop_sent => {
                tracing::info!(job_id = %job_id, "Relaying stop request to worker");
                worker.control.request_stop().await;
                stop_sent = true;
                kill_timer.as_mut().reset(Instant::now() + grace);
            }
            _ = &mut kill_timer, if stop_sent && !killed => {
                tracing::warn!(
                    job_id = %job_id,
                    grace_secs = grace.as_secs_f64(),
                    "Worker did not stop within grace period, killing",
                );
                worker.control.kill().await;
                killed = true;
            }
        }
    }

    let exit_code = match tokio::time::timeout(grace, worker.control.wait()).await {
        Ok(code) => code,
        Err(_) => {
            tracing::warn!(job_id = %job_id, "Worker lingering after final report, killing");
            worker.control.kill().await;
            worker.control.wait().await
        }
    };

    if let Some(patch) = exit_patch(&registry, &job_id, stop.is_cancelled(), exit_code).await {
        let status = patch.status;
        registry.update(&job_id, patch).await;
        tracing::warn!(job_id = %job_id, ?status, ?exit_code, "Worker exited without a final report");
    }

    tracing::info!(job_id = %job_id, ?exit_code, "Worker finished");
    let _ = done.send(true);
}

/// The terminal patch to record when the worker exited but the job is still
/// active, if any.
async fn exit_patch(
    registry: &JobRegistry,
    job_id: &str,
    stop_requested: bool,
    exit_code: Option<i32>,
) -> Option<JobPatch> {
    let job = registry.get(job_id).await.ok()?;
    if !job.status.is_active() {
        return None;
    }
    let now = Utc::now();
    Some(if stop_requested {
        JobPatch::terminal(JobStatus::Stopped, MSG_STOPPED, now)
    } else {
        let code = exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string());
        JobPatch::terminal(
            JobStatus::Failed,
            format!("Worker exited unexpectedly (exit code {code})"),
            now,
        )
    })
}

// ---------------------------------------------------------------------------
// Process table
// ---------------------------------------------------------------------------

/// Handles of every supervised job, keyed by job id.
pub struct ProcessTable {
    handles: RwLock<HashMap<JobId, JobHandle>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            handles: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, job_id: JobId, handle: JobHandle) {
        self.handles.write().await.insert(job_id, handle);
    }

    pub async fn get(&self, job_id: &str) -> Option<JobHandle> {
        self.handles.read().await.get(job_id).cloned()
    }

    pub async fn remove(&self, job_id: &str) -> Option<JobHandle> {
        self.handles.write().await.remove(job_id)
    }

    /// Drop every handle. Returns how many were removed.
    pub async fn clear(&self) -> usize {
        let mut handles = self.handles.write().await;
        let count = handles.len();
        handles.clear();
        count
    }

    /// Stop every job that is still running and wait for each to finish.
    ///
    /// Returns the number of workers that were still running.
    pub async fn stop_all(&self, timeout: Duration) -> usize {
        let running: Vec<(JobId, JobHandle)> = self
            .handles
            .read()
            .await
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .map(|(id, h)| (id.clone(), h.clone()))
            .collect();

        for (_, handle) in &running {
            handle.request_stop();
        }
        for (job_id, handle) in &running {
            if !handle.wait_finished(timeout).await {
                tracing::warn!(job_id = %job_id, "Worker still running after stop timeout");
            }
        }
        running.len()
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
