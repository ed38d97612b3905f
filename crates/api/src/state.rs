use std::sync::Arc;

use crate::config::ServerConfig;
use crate::engine::{AdmissionController, JobRegistry, ProcessTable};
use crate::metrics::SystemMonitor;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc`).
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Every job admitted since startup (or the last server reset).
    pub registry: Arc<JobRegistry>,
    /// Supervisor handles for launched workers.
    pub processes: Arc<ProcessTable>,
    /// Single-active-job gate in front of the worker launcher.
    pub admission: Arc<AdmissionController>,
    /// Host CPU/RAM/GPU sampler reported with every status poll.
    pub monitor: Arc<SystemMonitor>,
}

impl AppState {
    /// Wire up the engine around `launcher`.
    pub fn new(config: ServerConfig, launcher: Arc<dyn crate::engine::WorkerLauncher>) -> Self {
        let registry = Arc::new(JobRegistry::new());
        let processes = Arc::new(ProcessTable::new());
        let admission = Arc::new(AdmissionController::new(
            Arc::clone(&registry),
            Arc::clone(&processes),
            launcher,
            config.total_estimate_secs,
            std::time::Duration::from_secs(config.stop_grace_secs),
        ));
        Self {
            config: Arc::new(config),
            registry,
            processes,
            admission,
            monitor: Arc::new(SystemMonitor::new()),
        }
    }
}
