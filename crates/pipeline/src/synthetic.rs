//! Timed placeholder backend used when a request sets `test_mode`.
//!
//! No model is loaded. Each operation sleeps through a fixed number of
//! ticks, reporting progress after each one, and returns a solid-colour PNG
//! so downstream steps receive a real decodable image.

use std::thread;
use std::time::Duration;

use adgen_core::artifact::Artifact;
use adgen_core::backend::{
    BackendError, BackendOp, BackgroundParams, CompositeParams, InjectionParams, ModelBackend,
    SegmentParams, TextParams,
};
use adgen_core::progress::{ProgressFn, StepProgress};
use adgen_core::step::PipelineStep;

/// Default delay between synthetic progress ticks.
pub const DEFAULT_TICK: Duration = Duration::from_millis(500);

/// Side length of generated placeholder images.
const PLACEHOLDER_SIZE: u32 = 512;

fn ticks_for(op: BackendOp) -> u32 {
    match op {
        BackendOp::Segmentation => 1,
        BackendOp::BackgroundGeneration => 10,
        BackendOp::FeatureInjection => 10,
        BackendOp::TextGeneration => 8,
        BackendOp::Composition => 5,
    }
}

fn colour_for(op: BackendOp) -> [u8; 3] {
    match op {
        BackendOp::Segmentation => [255, 255, 255],
        BackendOp::BackgroundGeneration => [135, 206, 235],
        BackendOp::FeatureInjection => [222, 184, 135],
        BackendOp::TextGeneration => [255, 215, 0],
        BackendOp::Composition => [60, 179, 113],
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticBackend {
    tick: Duration,
}

impl SyntheticBackend {
    pub fn new(tick: Duration) -> Self {
        Self { tick }
    }

    fn simulate(&self, op: BackendOp, progress: &mut ProgressFn<'_>) -> Result<Artifact, BackendError> {
        let total = ticks_for(op);
        for ordinal in 1..=total {
            thread::sleep(self.tick);
            progress(StepProgress::new(ordinal, total, op.label()));
        }
        Artifact::solid_png(PLACEHOLDER_SIZE, PLACEHOLDER_SIZE, colour_for(op))
            .map_err(|e| BackendError::Inference(format!("failed to render placeholder: {e}")))
    }
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::new(DEFAULT_TICK)
    }
}

impl ModelBackend for SyntheticBackend {
    fn segment(
        &self,
        _params: &SegmentParams,
        progress: &mut ProgressFn<'_>,
    ) -> Result<Artifact, BackendError> {
        self.simulate(BackendOp::Segmentation, progress)
    }

    fn generate_background(
        &self,
        _params: &BackgroundParams,
        progress: &mut ProgressFn<'_>,
    ) -> Result<Artifact, BackendError> {
        self.simulate(BackendOp::BackgroundGeneration, progress)
    }

    fn inject_product(
        &self,
        _params: &InjectionParams,
        progress: &mut ProgressFn<'_>,
    ) -> Result<Artifact, BackendError> {
        self.simulate(BackendOp::FeatureInjection, progress)
    }

    fn generate_text(
        &self,
        _params: &TextParams,
        progress: &mut ProgressFn<'_>,
    ) -> Result<Artifact, BackendError> {
        self.simulate(BackendOp::TextGeneration, progress)
    }

    fn composite(
        &self,
        _params: &CompositeParams,
        progress: &mut ProgressFn<'_>,
    ) -> Result<Artifact, BackendError> {
        self.simulate(BackendOp::Composition, progress)
    }

    fn unload(&self, step: PipelineStep) {
        tracing::debug!(step = %step, "Synthetic backend: nothing to unload");
    }
}
