#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tower::ServiceExt;

use adgen_api::config::ServerConfig;
use adgen_api::engine::launcher::{LaunchError, WorkerControl, WorkerHandle, WorkerLauncher};
use adgen_api::router::build_app_router;
use adgen_api::state::AppState;
use adgen_core::job::{JobPatch, JobStatus};
use adgen_core::protocol::WorkerInput;
use adgen_core::stats::StatsTracker;
use adgen_pipeline::{JobRunner, SyntheticBackend};

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 5,
        worker_bin: "adgen-worker".into(),
        total_estimate_secs: 590,
        stop_grace_secs: 1,
    }
}

// ---------------------------------------------------------------------------
// In-process workers
// ---------------------------------------------------------------------------

/// Runs jobs on a blocking thread with the synthetic backend instead of
/// spawning `adgen-worker` processes.
pub struct InProcessLauncher {
    tick: Duration,
    pub launches: AtomicUsize,
}

impl InProcessLauncher {
    pub fn new(tick: Duration) -> Self {
        Self {
            tick,
            launches: AtomicUsize::new(0),
        }
    }
}

struct InProcessControl {
    stop: Arc<AtomicBool>,
    task: Option<JoinHandle<JobStatus>>,
}

#[async_trait]
impl WorkerControl for InProcessControl {
    async fn request_stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    async fn wait(&mut self) -> Option<i32> {
        let task = self.task.take()?;
        task.await.ok().map(|_| 0)
    }

    async fn kill(&mut self) {
        // A thread cannot be killed; it winds down at the next step boundary.
        self.stop.store(true, Ordering::SeqCst);
    }

    fn id(&self) -> Option<u32> {
        None
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(&self, input: WorkerInput) -> Result<WorkerHandle, LaunchError> {
        self.launches.fetch_add(1, Ordering::SeqCst);

        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();
        let backend = Arc::new(SyntheticBackend::new(self.tick));
        let mut runner = JobRunner::new(
            input.job_id,
            input.request,
            backend,
            StatsTracker::in_memory(),
            Arc::clone(&stop),
        );

        let task = tokio::task::spawn_blocking(move || {
            let mut sink = move |patch: JobPatch| {
                let _ = tx.send(patch);
            };
            runner.run(&mut sink)
        });

        Ok(WorkerHandle {
            patches: rx,
            control: Box::new(InProcessControl {
                stop,
                task: Some(task),
            }),
        })
    }
}

/// In-process launcher that holds every launch until [`GatedLauncher::open`]
/// is called.
pub struct GatedLauncher {
    inner: InProcessLauncher,
    gate: Notify,
}

impl GatedLauncher {
    pub fn new(tick: Duration) -> Self {
        Self {
            inner: InProcessLauncher::new(tick),
            gate: Notify::new(),
        }
    }

    /// Let one pending (or the next) launch proceed.
    pub fn open(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl WorkerLauncher for GatedLauncher {
    async fn launch(&self, input: WorkerInput) -> Result<WorkerHandle, LaunchError> {
        self.gate.notified().await;
        self.inner.launch(input).await
    }
}

/// Launcher whose workers can never be started.
pub struct FailingLauncher;

#[async_trait]
impl WorkerLauncher for FailingLauncher {
    async fn launch(&self, _input: WorkerInput) -> Result<WorkerHandle, LaunchError> {
        Err(LaunchError::Spawn {
            path: "missing-worker".into(),
            source: std::io::ErrorKind::NotFound.into(),
        })
    }
}

// ---------------------------------------------------------------------------
// App construction
// ---------------------------------------------------------------------------

/// Fast synthetic ticks: a full pipeline finishes in well under a second.
pub const FAST_TICK: Duration = Duration::from_millis(2);

/// Slow synthetic ticks: Step 1 alone takes about half a second.
pub const SLOW_TICK: Duration = Duration::from_millis(50);

/// Build the full application router around `launcher`.
///
/// Uses the same [`build_app_router`] as `main.rs`, so tests exercise the
/// production middleware stack.
pub fn build_test_app_with(launcher: Arc<dyn WorkerLauncher>) -> (Router, AppState) {
    let config = test_config();
    let state = AppState::new(config.clone(), launcher);
    (build_app_router(state.clone(), &config), state)
}

pub fn build_test_app(tick: Duration) -> Router {
    build_test_app_with(Arc::new(InProcessLauncher::new(tick))).0
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

/// Collect a response body and parse it as JSON.
pub async fn body_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn get(app: &Router, uri: &str) -> Response {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    app.clone().oneshot(request).await.unwrap()
}

pub async fn post(app: &Router, uri: &str) -> Response {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.clone().oneshot(request).await.unwrap()
}

pub async fn post_json(app: &Router, uri: &str, json: Value) -> Response {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&json).unwrap()))
        .unwrap();
    app.clone().oneshot(request).await.unwrap()
}

pub async fn post_raw(app: &Router, uri: &str, body: &str) -> Response {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    app.clone().oneshot(request).await.unwrap()
}

pub async fn delete(app: &Router, uri: &str) -> Response {
    let request = Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.clone().oneshot(request).await.unwrap()
}

// ---------------------------------------------------------------------------
// Job helpers
// ---------------------------------------------------------------------------

/// Submit a job and return its id, asserting it was admitted.
pub async fn submit(app: &Router, json: Value) -> String {
    let response = post_json(app, "/generate", json).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "started");
    body["job_id"].as_str().unwrap().to_string()
}

/// Poll `/status/{job_id}` until the job is terminal, returning the last body.
pub async fn wait_terminal(app: &Router, job_id: &str) -> Value {
    for _ in 0..500 {
        let body = body_json(get(app, &format!("/status/{job_id}")).await).await;
        match body["status"].as_str() {
            Some("pending") | Some("running") => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            _ => return body,
        }
    }
    panic!("job {job_id} did not finish in time");
}
