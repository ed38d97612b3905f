//! Starting worker processes and talking to them.
//!
//! A [`WorkerLauncher`] turns a [`WorkerInput`] into a running worker and
//! hands back a [`WorkerHandle`]: a stream of [`JobPatch`]es plus a
//! [`WorkerControl`] for stop/kill. Production uses [`ProcessLauncher`],
//! which spawns one `adgen-worker` OS process per job.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;

use adgen_core::job::JobPatch;
use adgen_core::protocol::{decode_line, encode_line, ControlMessage, WorkerInput};

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to spawn worker {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to hand job to worker: {0}")]
    Handshake(#[source] std::io::Error),

    #[error("failed to encode worker input: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Control half of a running worker.
#[async_trait]
pub trait WorkerControl: Send {
    /// Ask the worker to stop at its next step boundary. Best-effort.
    async fn request_stop(&mut self);

    /// Wait for the worker to exit. Returns the exit code when known.
    async fn wait(&mut self) -> Option<i32>;

    /// Terminate the worker immediately.
    async fn kill(&mut self);

    /// OS process id, if the worker is a process.
    fn id(&self) -> Option<u32>;
}

/// A launched worker.
pub struct WorkerHandle {
    /// Patches in the order the worker produced them. Closes when the worker
    /// stops writing.
    pub patches: mpsc::UnboundedReceiver<JobPatch>,
    pub control: Box<dyn WorkerControl>,
}

/// Strategy for starting a worker for one job.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, input: WorkerInput) -> Result<WorkerHandle, LaunchError>;
}

// ---------------------------------------------------------------------------
// Process launcher
// ---------------------------------------------------------------------------

/// Spawns a fresh worker process per job.
///
/// The child inherits this process's environment (so `ADGEN_*` worker
/// settings apply) and stderr (so worker logs land next to server logs).
pub struct ProcessLauncher {
    worker_bin: PathBuf,
}

impl ProcessLauncher {
    pub fn new(worker_bin: impl Into<PathBuf>) -> Self {
        Self {
            worker_bin: worker_bin.into(),
        }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, input: WorkerInput) -> Result<WorkerHandle, LaunchError> {
        let line = encode_line(&input)?;

        // `kill_on_drop(true)` ensures the child dies with its handle.
        let mut child = Command::new(&self.worker_bin)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                path: self.worker_bin.clone(),
                source,
            })?;

        // Stdin stays open for control messages; closing it means "stop".
        let mut stdin = child.stdin.take();
        if let Some(pipe) = stdin.as_mut() {
            if let Err(e) = write_line(pipe, &line).await {
                let _ = child.kill().await;
                return Err(LaunchError::Handshake(e));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_patches(input.job_id.clone(), stdout, tx));
        }

        tracing::info!(
            job_id = %input.job_id,
            pid = ?child.id(),
            worker = %self.worker_bin.display(),
            "Worker process spawned",
        );

        Ok(WorkerHandle {
            patches: rx,
            control: Box::new(ProcessControl { child, stdin }),
        })
    }
}

async fn write_line(pipe: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    pipe.write_all(line.as_bytes()).await?;
    pipe.flush().await
}

/// Decode patch lines from the worker's stdout until it closes.
async fn forward_patches(job_id: String, stdout: ChildStdout, tx: mpsc::UnboundedSender<JobPatch>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match decode_line::<JobPatch>(&line) {
                Ok(patch) => {
                    if tx.send(patch).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Discarding malformed worker output");
                }
            },
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Worker stdout read failed");
                break;
            }
        }
    }
}

struct ProcessControl {
    child: Child,
    stdin: Option<ChildStdin>,
}

#[async_trait]
impl WorkerControl for ProcessControl {
    async fn request_stop(&mut self) {
        let Some(pipe) = self.stdin.as_mut() else {
            return;
        };
        let sent = match encode_line(&ControlMessage::Stop) {
            Ok(line) => write_line(pipe, &line).await.is_ok(),
            Err(_) => false,
        };
        if !sent {
            // Dropping stdin delivers EOF, which the worker also treats as stop.
            self.stdin = None;
        }
    }

    async fn wait(&mut self) -> Option<i32> {
        match self.child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to wait for worker");
                None
            }
        }
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::warn!(error = %e, "Failed to kill worker");
        }
    }

    fn id(&self) -> Option<u32> {
        self.child.id()
    }
}
