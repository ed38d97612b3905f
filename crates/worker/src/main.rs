use std::io::{self, BufReader};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use adgen_core::protocol::{decode_line, WorkerInput};
use adgen_worker::config::WorkerConfig;
use adgen_worker::{run_job, spawn_control_listener, PatchWriter};

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // stdout carries the patch stream, so logs go to stderr.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "adgen_worker=debug,adgen_pipeline=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let config = WorkerConfig::from_env().context("invalid worker configuration")?;

    let mut first = String::new();
    io::stdin()
        .read_line(&mut first)
        .context("failed to read job input from stdin")?;
    let input: WorkerInput = decode_line(&first).context("malformed job input")?;
    tracing::info!(job_id = %input.job_id, pid = std::process::id(), "Worker started");

    let stop = Arc::new(AtomicBool::new(false));
    // Detached: the thread may still be blocked on stdin when the job ends.
    let _listener = spawn_control_listener(BufReader::new(io::stdin()), Arc::clone(&stop));

    let mut sink = PatchWriter::new(io::stdout(), Arc::clone(&stop));
    let status = run_job(input, &config, stop, &mut sink);

    tracing::info!(status = %status, "Worker exiting");
    Ok(())
}
