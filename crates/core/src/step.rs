//! Pipeline step identifiers and step ranges.
//!
//! The pipeline always runs in the fixed order background → text →
//! composite. A job may cover any contiguous span of it, described by a
//! [`StepRange`].

use serde::{Deserialize, Serialize};

/// One of the three ordered pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PipelineStep {
    /// Background synthesis and product placement.
    #[serde(rename = "step1_background")]
    Step1,
    /// Stylized text asset synthesis.
    #[serde(rename = "step2_text")]
    Step2,
    /// Final composition of background and text.
    #[serde(rename = "step3_composite")]
    Step3,
}

impl PipelineStep {
    pub const ALL: [PipelineStep; 3] = [Self::Step1, Self::Step2, Self::Step3];

    /// 1-based step number as used in requests.
    pub fn number(self) -> u8 {
        match self {
            Self::Step1 => 1,
            Self::Step2 => 2,
            Self::Step3 => 3,
        }
    }

    pub fn from_number(number: u8) -> Option<Self> {
        match number {
            1 => Some(Self::Step1),
            2 => Some(Self::Step2),
            3 => Some(Self::Step3),
            _ => None,
        }
    }

    /// Stable name used for statistics keys and the wire format.
    pub fn name(self) -> &'static str {
        match self {
            Self::Step1 => "step1_background",
            Self::Step2 => "step2_text",
            Self::Step3 => "step3_composite",
        }
    }

    /// Human-readable status message shown while the step runs.
    pub fn running_message(self) -> &'static str {
        match self {
            Self::Step1 => "Step 1: Generating background...",
            Self::Step2 => "Step 2: Generating text asset...",
            Self::Step3 => "Step 3: Compositing final image...",
        }
    }

    pub fn next(self) -> Option<Self> {
        Self::from_number(self.number() + 1)
    }
}

impl std::fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Inclusive range of steps a job executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepRange {
    pub start: PipelineStep,
    pub stop: PipelineStep,
}

impl StepRange {
    /// The full pipeline, Step 1 through Step 3.
    pub const FULL: StepRange = StepRange {
        start: PipelineStep::Step1,
        stop: PipelineStep::Step3,
    };

    /// Build a range, returning `None` if `stop` precedes `start`.
    pub fn new(start: PipelineStep, stop: PipelineStep) -> Option<Self> {
        (start <= stop).then_some(Self { start, stop })
    }

    pub fn contains(&self, step: PipelineStep) -> bool {
        self.start <= step && step <= self.stop
    }

    /// Steps of the range in execution order.
    pub fn steps(&self) -> impl Iterator<Item = PipelineStep> + '_ {
        PipelineStep::ALL
            .into_iter()
            .filter(move |step| self.contains(*step))
    }
}
