//! Job-global progress and ETA estimation.
//!
//! Each step of the job's range gets a slice of 0-100% proportional to its
//! historical average duration, so a step that usually takes 80 s moves the
//! bar sixteen times further than one that takes 5 s. Within a step the
//! executor reports `(ordinal, total)` callbacks which are interpolated
//! across that slice.
//!
//! The ETA deliberately is not clamped at zero: a negative value means the
//! step is running over its historical average.

use serde::{Deserialize, Serialize};

use crate::stats::StatsTracker;
use crate::step::{PipelineStep, StepRange};

/// One progress callback from inside a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepProgress {
    /// 1-based ordinal of the unit just finished.
    pub ordinal: u32,
    /// Total units in the step (0 is treated as "done").
    pub total: u32,
    /// Free-form sub-step label, e.g. `background_generation`.
    pub label: String,
}

impl StepProgress {
    pub fn new(ordinal: u32, total: u32, label: impl Into<String>) -> Self {
        Self {
            ordinal,
            total,
            label: label.into(),
        }
    }

    /// Completed fraction of the step in `0.0..=1.0`.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        (self.ordinal as f64 / self.total as f64).clamp(0.0, 1.0)
    }

    /// Display form stored in the job's `sub_step` field.
    pub fn describe(&self) -> String {
        format!("{} ({}/{})", self.label, self.ordinal, self.total)
    }
}

/// Sink for progress callbacks passed into backend operations.
pub type ProgressFn<'a> = dyn FnMut(StepProgress) + 'a;

/// Progress values written into the job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub percent: u8,
    pub eta_seconds: i64,
    pub step_eta_seconds: i64,
}

impl ProgressSnapshot {
    /// Values reported once a job completes.
    pub const FINISHED: ProgressSnapshot = ProgressSnapshot {
        percent: 100,
        eta_seconds: 0,
        step_eta_seconds: 0,
    };
}

/// Duration-weighted progress estimator for one job.
///
/// Averages are snapshot when the estimator is built so step weights stay
/// fixed for the job's lifetime even though the stats table is updated
/// after each step.
#[derive(Debug, Clone)]
pub struct ProgressEstimator {
    plan: Vec<(PipelineStep, f64)>,
    total_secs: f64,
    current: usize,
    peak_fraction: f64,
    last_percent: u8,
}

impl ProgressEstimator {
    pub fn new(range: StepRange, stats: &StatsTracker) -> Self {
        let plan: Vec<_> = range
            .steps()
            .map(|step| (step, stats.weight(step)))
            .collect();
        let total_secs = plan.iter().map(|(_, secs)| secs).sum();
        Self {
            plan,
            total_secs,
            current: 0,
            peak_fraction: 0.0,
            last_percent: 0,
        }
    }

    /// Share of the progress bar assigned to `step` (0.0 if outside the range).
    pub fn weight(&self, step: PipelineStep) -> f64 {
        self.plan
            .iter()
            .find(|(s, _)| *s == step)
            .map(|(_, secs)| secs / self.total_secs)
            .unwrap_or(0.0)
    }

    /// Estimate before any step has started.
    pub fn initial(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            percent: 0,
            eta_seconds: self.total_secs.round() as i64,
            step_eta_seconds: self.plan.first().map_or(0, |(_, s)| s.round() as i64),
        }
    }

    /// Mark `step` as the one now running.
    pub fn begin_step(&mut self, step: PipelineStep) -> ProgressSnapshot {
        if let Some(idx) = self.index_of(step) {
            self.current = idx;
        }
        self.peak_fraction = 0.0;
        self.snapshot(0.0)
    }

    /// Fold in a callback received `step_elapsed_secs` after `step` began.
    pub fn observe(
        &mut self,
        step: PipelineStep,
        progress: &StepProgress,
        step_elapsed_secs: f64,
    ) -> ProgressSnapshot {
        if self.index_of(step) != Some(self.current) {
            self.begin_step(step);
        }
        self.peak_fraction = self.peak_fraction.max(progress.fraction());
        self.snapshot(step_elapsed_secs)
    }

    /// Estimate at the boundary right after `step` finished.
    pub fn complete_step(&mut self, step: PipelineStep) -> ProgressSnapshot {
        let Some(idx) = self.index_of(step) else {
            return self.snapshot(0.0);
        };
        self.current = idx;
        self.peak_fraction = 1.0;
        let done: f64 = self.plan[..=idx].iter().map(|(_, s)| s).sum();
        let remaining: f64 = self.plan[idx + 1..].iter().map(|(_, s)| s).sum();
        ProgressSnapshot {
            percent: self.bump_percent(done),
            eta_seconds: remaining.round() as i64,
            step_eta_seconds: 0,
        }
    }

    fn index_of(&self, step: PipelineStep) -> Option<usize> {
        self.plan.iter().position(|(s, _)| *s == step)
    }

    fn snapshot(&mut self, step_elapsed_secs: f64) -> ProgressSnapshot {
        let Some(&(_, avg)) = self.plan.get(self.current) else {
            return ProgressSnapshot::FINISHED;
        };
        let before: f64 = self.plan[..self.current].iter().map(|(_, s)| s).sum();
        let after: f64 = self.plan[self.current + 1..].iter().map(|(_, s)| s).sum();

        let percent = self.bump_percent(before + avg * self.peak_fraction);

        // Remaining fraction from whichever signal says more work is done;
        // once elapsed time exceeds the average this goes negative.
        let elapsed_fraction = step_elapsed_secs.max(0.0) / avg;
        let done_fraction = self.peak_fraction.max(elapsed_fraction);
        let step_eta = avg * (1.0 - done_fraction);

        ProgressSnapshot {
            percent,
            eta_seconds: (step_eta + after).round() as i64,
            step_eta_seconds: step_eta.round() as i64,
        }
    }

    fn bump_percent(&mut self, done_secs: f64) -> u8 {
        let raw = (100.0 * done_secs / self.total_secs).floor().clamp(0.0, 100.0) as u8;
        self.last_percent = self.last_percent.max(raw);
        self.last_percent
    }
}
