//! Runs the backend operations that make up one pipeline step.
//!
//! A step is a short, fixed sequence of [`BackendOp`]s. Each operation
//! reports progress on its own scale; [`OpSequence`] folds those into a
//! single step-level `(ordinal, total)` so the estimator sees one counter
//! per step regardless of how many model calls it takes.

use adgen_core::artifact::Artifact;
use adgen_core::backend::{
    BackendError, BackendOp, BackgroundParams, CompositeParams, InjectionParams, SegmentParams,
    TextParams,
};
use adgen_core::device::Device;
use adgen_core::progress::{ProgressFn, StepProgress};
use adgen_core::request::PipelineRequest;
use adgen_core::step::PipelineStep;

use crate::error::StepError;

/// Executes individual steps for one request.
pub struct StepExecutor<'a> {
    device: &'a Device,
    request: &'a PipelineRequest,
}

impl<'a> StepExecutor<'a> {
    pub fn new(device: &'a Device, request: &'a PipelineRequest) -> Self {
        Self { device, request }
    }

    /// Step 1: background generation, then product placement if a product
    /// image was supplied and the job continues past this step.
    pub fn background(
        &self,
        stop: PipelineStep,
        on_progress: &mut ProgressFn<'_>,
    ) -> Result<Artifact, StepError> {
        let product = match &self.request.input_image {
            Some(image) if stop != PipelineStep::Step1 => {
                validate_input("input_image", image)?;
                Some(image)
            }
            _ => None,
        };

        let lease = self.device.acquire(PipelineStep::Step1, self.request.auto_unload);
        let backend = lease.backend();
        let mut ops = OpSequence::new(if product.is_some() { 3 } else { 1 }, on_progress);

        let params = BackgroundParams::from_request(self.request);
        let background = ops.run(BackendOp::BackgroundGeneration, |p| {
            backend.generate_background(&params, p)
        })?;

        let Some(product) = product else {
            return Ok(background);
        };

        let segment = SegmentParams {
            image: product.clone(),
        };
        let cutout = ops.run(BackendOp::Segmentation, |p| backend.segment(&segment, p))?;

        let params = InjectionParams::from_request(self.request, background, cutout);
        ops.run(BackendOp::FeatureInjection, |p| backend.inject_product(&params, p))
    }

    /// Step 2: render the ad copy, then cut it out of its backdrop.
    pub fn text(&self, on_progress: &mut ProgressFn<'_>) -> Result<Artifact, StepError> {
        let lease = self.device.acquire(PipelineStep::Step2, self.request.auto_unload);
        let backend = lease.backend();
        let mut ops = OpSequence::new(2, on_progress);

        let params = TextParams::from_request(self.request);
        let rendered = ops.run(BackendOp::TextGeneration, |p| backend.generate_text(&params, p))?;

        let segment = SegmentParams { image: rendered };
        ops.run(BackendOp::Segmentation, |p| backend.segment(&segment, p))
    }

    /// Step 3: merge the text asset into the background.
    pub fn composite(
        &self,
        background: Artifact,
        text: Artifact,
        on_progress: &mut ProgressFn<'_>,
    ) -> Result<Artifact, StepError> {
        let lease = self.device.acquire(PipelineStep::Step3, self.request.auto_unload);
        let backend = lease.backend();
        let mut ops = OpSequence::new(1, on_progress);

        let params = CompositeParams::from_request(self.request, background, text);
        ops.run(BackendOp::Composition, |p| backend.composite(&params, p))
    }
}

/// Check that a caller-supplied artifact decodes to an image.
pub fn validate_input(field: &'static str, artifact: &Artifact) -> Result<(), StepError> {
    artifact
        .dimensions()
        .map(|_| ())
        .map_err(|source| StepError::InvalidArtifact {
            artifact: field,
            source,
        })
}

// ---------------------------------------------------------------------------
// Operation sequencing
// ---------------------------------------------------------------------------

/// Maps per-operation progress onto the enclosing step.
///
/// Operation `index` of `count` reporting `ordinal / total` becomes
/// `index * total + ordinal` out of `count * total`.
struct OpSequence<'p, 'f> {
    index: u32,
    count: u32,
    on_progress: &'p mut ProgressFn<'f>,
}

impl<'p, 'f> OpSequence<'p, 'f> {
    fn new(count: u32, on_progress: &'p mut ProgressFn<'f>) -> Self {
        Self {
            index: 0,
            count: count.max(1),
            on_progress,
        }
    }

    fn run<F>(&mut self, op: BackendOp, call: F) -> Result<Artifact, StepError>
    where
        F: FnOnce(&mut ProgressFn<'_>) -> Result<Artifact, BackendError>,
    {
        let (index, count) = (self.index, self.count);
        let outer = &mut *self.on_progress;
        let mut forward = |p: StepProgress| {
            let (ordinal, total) = if p.total == 0 {
                (index + 1, count)
            } else {
                (index * p.total + p.ordinal.min(p.total), count * p.total)
            };
            outer(StepProgress::new(ordinal, total, op.label()));
        };

        tracing::debug!(op = %op, index, count, "Running backend operation");
        let artifact = call(&mut forward).map_err(|source| StepError::Backend { op, source })?;
        artifact
            .dimensions()
            .map_err(|source| StepError::InvalidOutput { op, source })?;

        self.index += 1;
        (self.on_progress)(StepProgress::new(self.index, self.count, op.label()));
        Ok(artifact)
    }
}
