//! Line-delimited JSON protocol between the API server and a worker process.
//!
//! - server → worker (stdin): one [`WorkerInput`] line, then zero or more
//!   [`ControlMessage`] lines. Closing stdin counts as a stop request.
//! - worker → server (stdout): one [`JobPatch`](crate::job::JobPatch) per
//!   line, ending with a terminal patch.
//!
//! Worker logs go to stderr so they never interleave with patches.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::request::PipelineRequest;
use crate::types::JobId;

/// The job a worker process is launched to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInput {
    pub job_id: JobId,
    pub request: PipelineRequest,
}

/// Control lines sent to a running worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Stop at the next step boundary.
    Stop,
}

/// Serialize `value` as a single newline-terminated line.
pub fn encode_line<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    Ok(line)
}

/// Parse one protocol line. Surrounding whitespace is ignored.
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(line.trim())
}
