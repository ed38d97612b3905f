//! The per-job worker process.
//!
//! A worker is launched for exactly one job. It reads a
//! [`WorkerInput`] line from stdin, runs the job with a [`JobRunner`], and
//! writes one [`JobPatch`] JSON line to stdout per state change. A `stop`
//! control line on stdin, or stdin closing, asks the job to stop at the
//! next step boundary.

pub mod config;

use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use chrono::Utc;

use adgen_core::backend::ModelBackend;
use adgen_core::job::{JobPatch, JobStatus};
use adgen_core::protocol::{decode_line, encode_line, ControlMessage, WorkerInput};
use adgen_core::stats::StatsTracker;
use adgen_pipeline::{JobRunner, JobSink, RemoteBackend, SyntheticBackend};

use crate::config::WorkerConfig;

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Writes patches as JSON lines, flushing after each one.
///
/// If the parent stops reading (broken pipe) there is no one left to report
/// to, so the stop flag is raised and the job winds down at the next step
/// boundary.
pub struct PatchWriter<W: Write> {
    out: W,
    stop: Arc<AtomicBool>,
    broken: bool,
}

impl<W: Write> PatchWriter<W> {
    pub fn new(out: W, stop: Arc<AtomicBool>) -> Self {
        Self {
            out,
            stop,
            broken: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write(&mut self, patch: &JobPatch) -> std::io::Result<()> {
        let line = encode_line(patch)?;
        self.out.write_all(line.as_bytes())?;
        self.out.flush()
    }
}

impl<W: Write> JobSink for PatchWriter<W> {
    fn publish(&mut self, patch: JobPatch) {
        if self.broken {
            return;
        }
        if let Err(e) = self.write(&patch) {
            tracing::warn!(error = %e, "Lost connection to server, stopping job");
            self.broken = true;
            self.stop.store(true, Ordering::SeqCst);
        }
    }
}

// ---------------------------------------------------------------------------
// Control
// ---------------------------------------------------------------------------

/// Watch `reader` for control lines on a background thread.
///
/// Sets `stop` on a `stop` message or when the reader reaches EOF or fails.
pub fn spawn_control_listener<R>(reader: R, stop: Arc<AtomicBool>) -> thread::JoinHandle<()>
where
    R: BufRead + Send + 'static,
{
    thread::spawn(move || {
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(error = %e, "Control channel read failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match decode_line::<ControlMessage>(&line) {
                Ok(ControlMessage::Stop) => {
                    tracing::info!("Stop requested by server");
                    stop.store(true, Ordering::SeqCst);
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, line = %line, "Ignoring malformed control line");
                }
            }
        }
        tracing::info!("Control channel closed, treating as stop");
        stop.store(true, Ordering::SeqCst);
    })
}

// ---------------------------------------------------------------------------
// Job execution
// ---------------------------------------------------------------------------

/// Pick the backend for a request: synthetic in test mode, remote otherwise.
pub fn select_backend(
    config: &WorkerConfig,
    test_mode: bool,
) -> Result<Arc<dyn ModelBackend>, adgen_core::backend::BackendError> {
    if test_mode {
        return Ok(Arc::new(SyntheticBackend::new(config.synthetic_tick)));
    }
    let remote = RemoteBackend::new(config.inference_url.clone(), config.inference_timeout)?;
    Ok(Arc::new(remote))
}

/// Run one job to its terminal state, publishing patches to `sink`.
pub fn run_job(
    input: WorkerInput,
    config: &WorkerConfig,
    stop: Arc<AtomicBool>,
    sink: &mut dyn JobSink,
) -> JobStatus {
    let WorkerInput { job_id, request } = input;

    let backend = match select_backend(config, request.test_mode) {
        Ok(backend) => backend,
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Failed to initialise backend");
            sink.publish(JobPatch::terminal(JobStatus::Failed, e.to_string(), Utc::now()));
            return JobStatus::Failed;
        }
    };

    let stats = StatsTracker::load(&config.stats_path);
    let mut runner = JobRunner::new(job_id, request, backend, stats, stop);
    runner.run(sink)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::time::Duration;

    use adgen_core::request::PipelineRequest;

    use super::*;

    fn test_config(dir: &std::path::Path) -> WorkerConfig {
        WorkerConfig {
            stats_path: dir.join("step_stats.json"),
            inference_url: None,
            inference_timeout: Duration::from_secs(1),
            synthetic_tick: Duration::ZERO,
        }
    }

    fn lines(buf: Vec<u8>) -> Vec<JobPatch> {
        String::from_utf8(buf)
            .unwrap()
            .lines()
            .map(|l| decode_line(l).unwrap())
            .collect()
    }

    #[test]
    fn writer_emits_one_line_per_patch() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut writer = PatchWriter::new(Vec::new(), stop);
        writer.publish(JobPatch {
            progress_percent: Some(10),
            ..Default::default()
        });
        writer.publish(JobPatch::terminal(JobStatus::Completed, "done", Utc::now()));
        let patches = lines(writer.into_inner());
        assert_eq!(patches.len(), 2);
        assert!(patches[1].is_terminal());
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn broken_output_raises_stop() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut writer = PatchWriter::new(BrokenPipe, stop.clone());
        writer.publish(JobPatch::default());
        assert!(stop.load(Ordering::SeqCst));
    }

    #[test]
    fn stop_line_sets_flag() {
        let stop = Arc::new(AtomicBool::new(false));
        let input = Cursor::new(b"{\"type\":\"stop\"}\n".to_vec());
        spawn_control_listener(input, stop.clone()).join().unwrap();
        assert!(stop.load(Ordering::SeqCst));
    }

    #[test]
    fn eof_counts_as_stop() {
        let stop = Arc::new(AtomicBool::new(false));
        spawn_control_listener(Cursor::new(Vec::new()), stop.clone())
            .join()
            .unwrap();
        assert!(stop.load(Ordering::SeqCst));
    }

    #[test]
    fn malformed_control_lines_are_skipped() {
        let stop = Arc::new(AtomicBool::new(false));
        let input = Cursor::new(b"hello\n\n{\"type\":\"stop\"}\n".to_vec());
        spawn_control_listener(input, stop.clone()).join().unwrap();
        assert!(stop.load(Ordering::SeqCst));
    }

    #[test]
    fn missing_inference_service_fails_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let stop = Arc::new(AtomicBool::new(false));
        let mut writer = PatchWriter::new(Vec::new(), stop.clone());

        let input = WorkerInput {
            job_id: "j1".into(),
            request: PipelineRequest {
                text_content: Some("hello".into()),
                ..Default::default()
            },
        };
        let status = run_job(input, &config, stop, &mut writer);

        assert_eq!(status, JobStatus::Failed);
        let last = lines(writer.into_inner()).pop().unwrap();
        assert!(last.message.unwrap().contains("ADGEN_INFERENCE_URL"));
    }

    #[test]
    fn test_mode_job_completes_without_touching_stats() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let stop = Arc::new(AtomicBool::new(false));
        let mut writer = PatchWriter::new(Vec::new(), stop.clone());

        let input = WorkerInput {
            job_id: "j2".into(),
            request: PipelineRequest {
                text_content: Some("hello".into()),
                test_mode: true,
                ..Default::default()
            },
        };
        let status = run_job(input, &config, stop, &mut writer);

        assert_eq!(status, JobStatus::Completed);
        assert!(!config.stats_path.exists());
        let patches = lines(writer.into_inner());
        assert!(patches.iter().any(|p| p.final_image.is_some()));
    }
}
