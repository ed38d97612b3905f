//! Job execution engine.
//!
//! Admission control, the in-memory job registry, worker launching, and the
//! per-job supervisor that relays worker reports into the registry.

pub mod admission;
pub mod launcher;
pub mod registry;
pub mod supervisor;

pub use admission::{AdmissionController, AdmissionError};
pub use launcher::{ProcessLauncher, WorkerLauncher};
pub use registry::JobRegistry;
pub use supervisor::ProcessTable;
