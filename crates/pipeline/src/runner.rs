//! The per-job state machine: `Pending → Running → {Completed | Failed | Stopped}`.
//!
//! [`JobRunner::run`] walks the request's step range, checks the stop flag
//! at every step boundary, and reports every state change as a
//! [`JobPatch`] through a [`JobSink`]. It always finishes with exactly one
//! terminal patch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;

use adgen_core::artifact::Artifact;
use adgen_core::backend::ModelBackend;
use adgen_core::device::Device;
use adgen_core::job::{JobPatch, JobStatus};
use adgen_core::progress::{ProgressEstimator, ProgressSnapshot, StepProgress};
use adgen_core::request::PipelineRequest;
use adgen_core::stats::StatsTracker;
use adgen_core::step::{PipelineStep, StepRange};
use adgen_core::types::JobId;

use crate::error::StepError;
use crate::executor::{validate_input, StepExecutor};

pub const MSG_STOPPED: &str = "Job stopped by user.";
pub const MSG_COMPLETED: &str = "All steps completed successfully.";
pub const MSG_BACKGROUND_ONLY: &str = "Background generation completed (no text content).";

/// Receives the patches a job produces, in order.
pub trait JobSink {
    fn publish(&mut self, patch: JobPatch);
}

impl<F: FnMut(JobPatch)> JobSink for F {
    fn publish(&mut self, patch: JobPatch) {
        self(patch)
    }
}

enum Outcome {
    Completed(String),
    Stopped,
}

/// Artifacts available to later steps, whether produced or supplied.
#[derive(Default)]
struct Artifacts {
    step1: Option<Artifact>,
    step2: Option<Artifact>,
}

fn snapshot_patch(snapshot: ProgressSnapshot) -> JobPatch {
    JobPatch {
        progress_percent: Some(snapshot.percent),
        eta_seconds: Some(snapshot.eta_seconds),
        step_eta_seconds: Some(snapshot.step_eta_seconds),
        eta_updated_at: Some(Utc::now()),
        ..Default::default()
    }
}

/// Executes one job to completion inside a worker.
pub struct JobRunner {
    job_id: JobId,
    request: PipelineRequest,
    device: Device,
    stats: StatsTracker,
    stop: Arc<AtomicBool>,
}

impl JobRunner {
    pub fn new(
        job_id: JobId,
        request: PipelineRequest,
        backend: Arc<dyn ModelBackend>,
        stats: StatsTracker,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            job_id,
            request,
            device: Device::new(backend),
            stats,
            stop,
        }
    }

    pub fn stats(&self) -> &StatsTracker {
        &self.stats
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Run the job and publish its patches. Returns the terminal status.
    pub fn run(&mut self, sink: &mut dyn JobSink) -> JobStatus {
        let started = Instant::now();
        let (status, message) = match self.execute(sink) {
            Ok(Outcome::Completed(message)) => (JobStatus::Completed, message),
            Ok(Outcome::Stopped) => (JobStatus::Stopped, MSG_STOPPED.to_string()),
            Err(e) => {
                tracing::error!(job_id = %self.job_id, error = %e, "Job failed");
                (JobStatus::Failed, e.to_string())
            }
        };

        let mut patch = JobPatch::terminal(status, message, Utc::now());
        if status == JobStatus::Completed {
            patch.progress_percent = Some(ProgressSnapshot::FINISHED.percent);
            patch.eta_seconds = Some(0);
            patch.step_eta_seconds = Some(0);
        }
        sink.publish(patch);

        tracing::info!(
            job_id = %self.job_id,
            status = %status,
            duration_secs = started.elapsed().as_secs_f64(),
            "Job finished",
        );
        status
    }

    fn execute(&mut self, sink: &mut dyn JobSink) -> Result<Outcome, StepError> {
        let range = self.request.step_range();
        let mut estimator = ProgressEstimator::new(range, &self.stats);

        tracing::info!(
            job_id = %self.job_id,
            start = %range.start,
            stop = %range.stop,
            test_mode = self.request.test_mode,
            "Job started",
        );
        sink.publish(JobPatch {
            status: Some(JobStatus::Running),
            start_time: Some(Utc::now()),
            current_step: Some(range.start),
            message: Some(range.start.running_message().to_string()),
            ..snapshot_patch(estimator.initial())
        });

        let mut artifacts = self.supplied_artifacts(range, sink)?;
        if range.start > PipelineStep::Step1 && !self.request.has_text() {
            return Ok(self.finish_background_only(&artifacts, sink));
        }

        for step in range.steps() {
            if self.stop_requested() {
                tracing::info!(job_id = %self.job_id, step = %step, "Stop requested, skipping remaining steps");
                return Ok(Outcome::Stopped);
            }

            let artifact = self.run_step(step, &artifacts, &mut estimator, sink)?;

            let mut patch = snapshot_patch(estimator.complete_step(step));
            patch.message = Some(format!("Step {} completed.", step.number()));
            match step {
                PipelineStep::Step1 => patch.step1_image = Some(artifact.clone()),
                PipelineStep::Step2 => patch.step2_image = Some(artifact.clone()),
                PipelineStep::Step3 => patch.final_image = Some(artifact.clone()),
            }
            sink.publish(patch);

            match step {
                PipelineStep::Step1 => artifacts.step1 = Some(artifact),
                PipelineStep::Step2 => artifacts.step2 = Some(artifact),
                PipelineStep::Step3 => {}
            }

            if step == range.stop {
                let message = if step == PipelineStep::Step3 {
                    MSG_COMPLETED.to_string()
                } else {
                    format!("Completed through step {} as requested.", step.number())
                };
                return Ok(Outcome::Completed(message));
            }
            if step == PipelineStep::Step1 && !self.request.has_text() {
                return Ok(self.finish_background_only(&artifacts, sink));
            }
        }

        Ok(Outcome::Completed(MSG_COMPLETED.to_string()))
    }

    /// Validate and publish the upstream artifacts a partial range starts from.
    fn supplied_artifacts(
        &self,
        range: StepRange,
        sink: &mut dyn JobSink,
    ) -> Result<Artifacts, StepError> {
        let mut artifacts = Artifacts::default();
        let start_step = range.start.number();

        if range.start > PipelineStep::Step1 {
            let image = self
                .request
                .step1_image
                .clone()
                .ok_or(StepError::MissingArtifact {
                    artifact: "step1_image",
                    start_step,
                })?;
            validate_input("step1_image", &image)?;
            sink.publish(JobPatch {
                step1_image: Some(image.clone()),
                ..Default::default()
            });
            artifacts.step1 = Some(image);
        }

        if range.start > PipelineStep::Step2 && self.request.has_text() {
            let image = self
                .request
                .step2_image
                .clone()
                .ok_or(StepError::MissingArtifact {
                    artifact: "step2_image",
                    start_step,
                })?;
            validate_input("step2_image", &image)?;
            sink.publish(JobPatch {
                step2_image: Some(image.clone()),
                ..Default::default()
            });
            artifacts.step2 = Some(image);
        }

        Ok(artifacts)
    }

    /// No ad copy: the Step 1 image is the final result.
    fn finish_background_only(&self, artifacts: &Artifacts, sink: &mut dyn JobSink) -> Outcome {
        tracing::info!(job_id = %self.job_id, "No text content, using background as final image");
        sink.publish(JobPatch {
            final_image: artifacts.step1.clone(),
            ..Default::default()
        });
        Outcome::Completed(MSG_BACKGROUND_ONLY.to_string())
    }

    fn run_step(
        &mut self,
        step: PipelineStep,
        artifacts: &Artifacts,
        estimator: &mut ProgressEstimator,
        sink: &mut dyn JobSink,
    ) -> Result<Artifact, StepError> {
        let range = self.request.step_range();
        let started = Instant::now();
        tracing::info!(job_id = %self.job_id, step = %step, "Step started");

        sink.publish(JobPatch {
            current_step: Some(step),
            message: Some(step.running_message().to_string()),
            ..snapshot_patch(estimator.begin_step(step))
        });

        let mut on_progress = |p: StepProgress| {
            let snapshot = estimator.observe(step, &p, started.elapsed().as_secs_f64());
            sink.publish(JobPatch {
                sub_step: Some(p.describe()),
                ..snapshot_patch(snapshot)
            });
        };

        let executor = StepExecutor::new(&self.device, &self.request);
        let artifact = match step {
            PipelineStep::Step1 => executor.background(range.stop, &mut on_progress)?,
            PipelineStep::Step2 => executor.text(&mut on_progress)?,
            PipelineStep::Step3 => {
                let background = artifacts.step1.clone().ok_or(StepError::MissingArtifact {
                    artifact: "step1_image",
                    start_step: range.start.number(),
                })?;
                let text = artifacts.step2.clone().ok_or(StepError::MissingArtifact {
                    artifact: "step2_image",
                    start_step: range.start.number(),
                })?;
                executor.composite(background, text, &mut on_progress)?
            }
        };

        let duration_secs = started.elapsed().as_secs_f64();
        tracing::info!(job_id = %self.job_id, step = %step, duration_secs, "Step completed");

        if !self.request.test_mode {
            if let Err(e) = self.stats.update(step.name(), duration_secs) {
                tracing::warn!(step = %step, error = %e, "Failed to persist step stats");
            }
        }

        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use assert_matches::assert_matches;

    use super::*;
    use adgen_core::backend::*;
    use adgen_core::job::Job;
    use adgen_core::progress::ProgressFn;

    /// Backend with per-op scripted behaviour. Counts calls and can raise
    /// the stop flag after a given number of operations.
    #[derive(Default)]
    struct Scripted {
        calls: Mutex<Vec<BackendOp>>,
        fail_on: Option<BackendOp>,
        stop_after: Option<(usize, Arc<AtomicBool>)>,
    }

    impl Scripted {
        fn op(&self, op: BackendOp, progress: &mut ProgressFn<'_>) -> Result<Artifact, BackendError> {
            let count = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(op);
                calls.len()
            };
            if self.fail_on == Some(op) {
                return Err(BackendError::Inference("GPU fell over".into()));
            }
            progress(StepProgress::new(1, 2, "half"));
            progress(StepProgress::new(2, 2, "done"));
            if let Some((after, flag)) = &self.stop_after {
                if count >= *after {
                    flag.store(true, Ordering::SeqCst);
                }
            }
            Artifact::solid_png(4, 4, [count as u8, 0, 0])
                .map_err(|e| BackendError::Inference(e.to_string()))
        }

        fn calls(&self) -> Vec<BackendOp> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ModelBackend for Scripted {
        fn segment(&self, _: &SegmentParams, p: &mut ProgressFn<'_>) -> Result<Artifact, BackendError> {
            self.op(BackendOp::Segmentation, p)
        }
        fn generate_background(
            &self,
            _: &BackgroundParams,
            p: &mut ProgressFn<'_>,
        ) -> Result<Artifact, BackendError> {
            self.op(BackendOp::BackgroundGeneration, p)
        }
        fn inject_product(
            &self,
            _: &InjectionParams,
            p: &mut ProgressFn<'_>,
        ) -> Result<Artifact, BackendError> {
            self.op(BackendOp::FeatureInjection, p)
        }
        fn generate_text(&self, _: &TextParams, p: &mut ProgressFn<'_>) -> Result<Artifact, BackendError> {
            self.op(BackendOp::TextGeneration, p)
        }
        fn composite(
            &self,
            _: &CompositeParams,
            p: &mut ProgressFn<'_>,
        ) -> Result<Artifact, BackendError> {
            self.op(BackendOp::Composition, p)
        }
    }

    struct Harness {
        backend: Arc<Scripted>,
        stop: Arc<AtomicBool>,
        patches: Vec<JobPatch>,
    }

    impl Harness {
        fn new(backend: Scripted) -> Self {
            Self {
                backend: Arc::new(backend),
                stop: Arc::new(AtomicBool::new(false)),
                patches: Vec::new(),
            }
        }

        fn run(&mut self, request: PipelineRequest) -> (JobStatus, Job, StatsTracker) {
            let mut runner = JobRunner::new(
                "job-1".into(),
                request.clone(),
                self.backend.clone(),
                StatsTracker::in_memory(),
                self.stop.clone(),
            );
            let mut patches = Vec::new();
            let status = runner.run(&mut |p: JobPatch| patches.push(p));

            let mut job = Job::pending("job-1".into(), request, Utc::now());
            for patch in &patches {
                job.apply(patch.clone());
            }
            self.patches = patches;
            (status, job, runner.stats().clone())
        }
    }

    fn png() -> Artifact {
        Artifact::solid_png(4, 4, [200, 200, 200]).unwrap()
    }

    fn with_text() -> PipelineRequest {
        PipelineRequest {
            text_content: Some("SALE 50%".into()),
            ..Default::default()
        }
    }

    #[test]
    fn progress_reports_are_timestamped() {
        let mut h = Harness::new(Scripted::default());
        let before = Utc::now();
        let (_, job, _) = h.run(with_text());

        let progress: Vec<_> = h
            .patches
            .iter()
            .filter(|p| p.eta_seconds.is_some() && !p.is_terminal())
            .collect();
        assert!(!progress.is_empty());
        for patch in progress {
            assert_matches!(patch.eta_updated_at, Some(at) if at >= before);
        }
        assert!(job.eta_updated_at.is_some());
    }

    #[test]
    fn stop_at_step_one_without_text_keeps_only_step1() {
        let mut h = Harness::new(Scripted::default());
        let (status, job, _) = h.run(PipelineRequest {
            stop_step: Some(1),
            text_content: Some(String::new()),
            ..Default::default()
        });

        assert_eq!(status, JobStatus::Completed);
        assert!(job.step1_image.is_some());
        assert!(job.step2_image.is_none());
        assert!(job.final_image.is_none());
        assert_eq!(job.eta_seconds, 0);
        assert_eq!(job.progress_percent, 100);
    }

    #[test]
    fn full_run_populates_artifacts_in_order() {
        let mut h = Harness::new(Scripted::default());
        let (status, job, _) = h.run(with_text());

        assert_eq!(status, JobStatus::Completed);
        assert_eq!(job.message, MSG_COMPLETED);
        assert!(job.step1_image.is_some() && job.step2_image.is_some() && job.final_image.is_some());

        let order: Vec<&str> = h
            .patches
            .iter()
            .filter_map(|p| {
                if p.step1_image.is_some() {
                    Some("step1")
                } else if p.step2_image.is_some() {
                    Some("step2")
                } else if p.final_image.is_some() {
                    Some("final")
                } else {
                    None
                }
            })
            .collect();
        assert_eq!(order, vec!["step1", "step2", "final"]);
    }

    #[test]
    fn progress_is_monotonic_and_ends_at_100() {
        let mut h = Harness::new(Scripted::default());
        h.run(with_text());
        let percents: Vec<u8> = h.patches.iter().filter_map(|p| p.progress_percent).collect();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{percents:?}");
        assert_eq!(percents.last(), Some(&100));
    }

    #[test]
    fn exactly_one_terminal_patch_is_last() {
        let mut h = Harness::new(Scripted::default());
        h.run(with_text());
        let terminal: Vec<_> = h.patches.iter().filter(|p| p.is_terminal()).collect();
        assert_eq!(terminal.len(), 1);
        assert!(h.patches.last().unwrap().is_terminal());
    }

    #[test]
    fn empty_text_promotes_background_to_final() {
        let mut h = Harness::new(Scripted::default());
        let (status, job, _) = h.run(PipelineRequest::default());

        assert_eq!(status, JobStatus::Completed);
        assert_eq!(job.message, MSG_BACKGROUND_ONLY);
        assert_eq!(job.final_image, job.step1_image);
        assert!(job.step2_image.is_none());
        assert_eq!(h.backend.calls(), vec![BackendOp::BackgroundGeneration]);
    }

    #[test]
    fn stop_before_first_step_runs_no_inference() {
        let mut h = Harness::new(Scripted::default());
        h.stop.store(true, Ordering::SeqCst);
        let (status, job, _) = h.run(with_text());

        assert_eq!(status, JobStatus::Stopped);
        assert_eq!(job.message, MSG_STOPPED);
        assert!(h.backend.calls().is_empty());
        assert!(job.step1_image.is_none());
    }

    #[test]
    fn stop_between_steps_keeps_finished_artifacts() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut h = Harness::new(Scripted {
            stop_after: Some((1, stop.clone())),
            ..Default::default()
        });
        h.stop = stop;
        let (status, job, _) = h.run(with_text());

        assert_eq!(status, JobStatus::Stopped);
        assert!(job.step1_image.is_some());
        assert!(job.step2_image.is_none());
        assert_eq!(h.backend.calls(), vec![BackendOp::BackgroundGeneration]);
    }

    #[test]
    fn backend_error_fails_job_with_verbatim_message() {
        let mut h = Harness::new(Scripted {
            fail_on: Some(BackendOp::TextGeneration),
            ..Default::default()
        });
        let (status, job, stats) = h.run(with_text());

        assert_eq!(status, JobStatus::Failed);
        assert_eq!(job.message, "GPU fell over");
        assert!(job.step1_image.is_some());
        assert!(job.final_image.is_none());
        // Only the successful step updates its average.
        assert_eq!(stats.get("step2_text"), 35.0);
        assert_ne!(stats.get("step1_background"), 80.0);
    }

    #[test]
    fn test_mode_leaves_stats_untouched() {
        let mut h = Harness::new(Scripted::default());
        let (_, _, stats) = h.run(PipelineRequest {
            test_mode: true,
            ..with_text()
        });
        assert_eq!(stats.get("step1_background"), 80.0);
        assert_eq!(stats.get("step3_composite"), 5.0);
    }

    #[test]
    fn missing_upstream_artifact_names_it() {
        let mut h = Harness::new(Scripted::default());
        let (status, job, _) = h.run(PipelineRequest {
            start_step: 2,
            ..with_text()
        });
        assert_eq!(status, JobStatus::Failed);
        assert!(job.message.contains("step1_image"), "{}", job.message);
        assert!(h.backend.calls().is_empty());
    }

    #[test]
    fn undecodable_upstream_artifact_fails() {
        let mut h = Harness::new(Scripted::default());
        let (status, job, _) = h.run(PipelineRequest {
            start_step: 3,
            step1_image: Some(png()),
            step2_image: Some(Artifact::from_encoded("%%%")),
            ..with_text()
        });
        assert_matches!(job.status, JobStatus::Failed);
        assert_eq!(status, JobStatus::Failed);
        assert!(job.message.starts_with("step2_image could not be decoded"));
    }

    #[test]
    fn resuming_at_step_three_uses_supplied_artifacts() {
        let mut h = Harness::new(Scripted::default());
        let supplied = png();
        let (status, job, _) = h.run(PipelineRequest {
            start_step: 3,
            step1_image: Some(supplied.clone()),
            step2_image: Some(supplied.clone()),
            ..with_text()
        });
        assert_eq!(status, JobStatus::Completed);
        assert_eq!(job.step1_image, Some(supplied));
        assert!(job.final_image.is_some());
        assert_eq!(h.backend.calls(), vec![BackendOp::Composition]);
    }

    #[test]
    fn resuming_without_text_returns_supplied_background() {
        let mut h = Harness::new(Scripted::default());
        let supplied = png();
        let (status, job, _) = h.run(PipelineRequest {
            start_step: 2,
            step1_image: Some(supplied.clone()),
            ..Default::default()
        });
        assert_eq!(status, JobStatus::Completed);
        assert_eq!(job.final_image, Some(supplied));
        assert!(h.backend.calls().is_empty());
    }

    #[test]
    fn sub_step_reports_operation_label() {
        let mut h = Harness::new(Scripted::default());
        h.run(with_text());
        assert!(h
            .patches
            .iter()
            .filter_map(|p| p.sub_step.as_deref())
            .any(|s| s == "text_generation (1/4)"));
    }
}
