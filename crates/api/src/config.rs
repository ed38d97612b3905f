use std::path::PathBuf;

use adgen_core::config::{env_opt, env_or, ConfigError};

/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `8000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS` env var.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// How long shutdown waits for the active job to stop (default: `30`).
    pub shutdown_timeout_secs: u64,
    /// Worker executable launched once per job.
    pub worker_bin: PathBuf,
    /// Full-pipeline duration used for busy `retry_after` hints (default: `590`).
    pub total_estimate_secs: u64,
    /// Time a worker gets to exit after a stop request before it is killed
    /// (default: `3`).
    pub stop_grace_secs: u64,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                     | Default                            |
    /// |-----------------------------|------------------------------------|
    /// | `HOST`                      | `0.0.0.0`                          |
    /// | `PORT`                      | `8000`                             |
    /// | `CORS_ORIGINS`              | `http://localhost:5173`            |
    /// | `REQUEST_TIMEOUT_SECS`      | `30`                               |
    /// | `SHUTDOWN_TIMEOUT_SECS`     | `30`                               |
    /// | `ADGEN_WORKER_BIN`          | `adgen-worker` next to this binary |
    /// | `ADGEN_TOTAL_ESTIMATE_SECS` | `590`                              |
    /// | `ADGEN_STOP_GRACE_SECS`     | `3`                                |
    ///
    /// `ADGEN_STATS_PATH` and the other `ADGEN_*` worker settings are read
    /// by the worker itself, which inherits this process's environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env_opt("HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = env_or("PORT", 8000)?;

        let cors_origins: Vec<String> = env_opt("CORS_ORIGINS")
            .unwrap_or_else(|| "http://localhost:5173".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let request_timeout_secs: u64 = env_or("REQUEST_TIMEOUT_SECS", 30)?;
        let shutdown_timeout_secs: u64 = env_or("SHUTDOWN_TIMEOUT_SECS", 30)?;
        let worker_bin = env_opt("ADGEN_WORKER_BIN")
            .map(PathBuf::from)
            .unwrap_or_else(default_worker_bin);
        let total_estimate_secs: u64 = env_or("ADGEN_TOTAL_ESTIMATE_SECS", 590)?;
        let stop_grace_secs: u64 = env_or("ADGEN_STOP_GRACE_SECS", 3)?;

        Ok(Self {
            host,
            port,
            cors_origins,
            request_timeout_secs,
            shutdown_timeout_secs,
            worker_bin,
            total_estimate_secs,
            stop_grace_secs,
        })
    }
}

/// `adgen-worker` in the same directory as the running executable, falling
/// back to a `$PATH` lookup.
fn default_worker_bin() -> PathBuf {
    let name = format!("adgen-worker{}", std::env::consts::EXE_SUFFIX);
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(&name)))
        .filter(|path| path.exists())
        .unwrap_or_else(|| PathBuf::from(name))
}
