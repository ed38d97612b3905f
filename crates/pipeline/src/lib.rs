//! Step execution for ad image generation jobs.
//!
//! [`runner::JobRunner`] drives one job through its step range and emits
//! [`JobPatch`](adgen_core::job::JobPatch)es; [`executor::StepExecutor`]
//! runs the backend operations for a single step. Both are synchronous and
//! intended to run inside a dedicated worker process.

pub mod error;
pub mod executor;
pub mod remote;
pub mod runner;
pub mod synthetic;

pub use error::StepError;
pub use executor::StepExecutor;
pub use remote::RemoteBackend;
pub use runner::{JobRunner, JobSink};
pub use synthetic::SyntheticBackend;
