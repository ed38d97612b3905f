use std::path::PathBuf;
use std::time::Duration;

use adgen_core::config::{env_opt, env_or, ConfigError};

/// Worker process configuration loaded from environment variables.
///
/// The API server passes its own environment through to workers, so both
/// read the same `ADGEN_STATS_PATH`.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Step statistics file.
    pub stats_path: PathBuf,
    /// Base URL of the inference service. Required unless `test_mode`.
    pub inference_url: Option<String>,
    /// Per-call timeout for the inference service.
    pub inference_timeout: Duration,
    /// Delay between synthetic progress ticks in test mode.
    pub synthetic_tick: Duration,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                        | Default           |
    /// |--------------------------------|-------------------|
    /// | `ADGEN_STATS_PATH`             | `step_stats.json` |
    /// | `ADGEN_INFERENCE_URL`          | unset             |
    /// | `ADGEN_INFERENCE_TIMEOUT_SECS` | `600`             |
    /// | `ADGEN_SYNTHETIC_TICK_MS`      | `500`             |
    pub fn from_env() -> Result<Self, ConfigError> {
        let stats_path: PathBuf = env_or("ADGEN_STATS_PATH", PathBuf::from("step_stats.json"))?;
        let inference_url = env_opt("ADGEN_INFERENCE_URL");
        let inference_timeout_secs: u64 = env_or("ADGEN_INFERENCE_TIMEOUT_SECS", 600)?;
        let synthetic_tick_ms: u64 = env_or("ADGEN_SYNTHETIC_TICK_MS", 500)?;

        Ok(Self {
            stats_path,
            inference_url,
            inference_timeout: Duration::from_secs(inference_timeout_secs),
            synthetic_tick: Duration::from_millis(synthetic_tick_ms),
        })
    }
}
