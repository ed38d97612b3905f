//! The generation request accepted by `POST /generate`.
//!
//! A request is validated once at admission and is immutable afterwards;
//! the job record keeps a copy so that a failed run can be resubmitted
//! (optionally from a later step) with the same parameters.

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::artifact::Artifact;
use crate::error::CoreError;
use crate::step::{PipelineStep, StepRange};

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_BG_PROMPT: &str = "A close-up view of a rustic wooden table surface. \
Soft morning sunlight coming from a window, creating gentle shadows. Blurred cozy kitchen \
background, bokeh, photorealistic, 8k, cinematic lighting.";
pub const DEFAULT_BG_NEGATIVE_PROMPT: &str =
    "blurry, low quality, distorted, ugly, bad lighting, overexposed, underexposed";
pub const DEFAULT_TEXT_PROMPT: &str = "3D render of Gold foil balloon text, inflated, shiny \
metallic texture, floating in air, cinematic lighting, sharp details, isolated on black background";
pub const DEFAULT_TEXT_NEGATIVE_PROMPT: &str =
    "floor, ground, dirt, debris, random shapes, multiple objects, clutter, ugly, low quality";

pub const DEFAULT_COMPOSITION_STRENGTH: f64 = 0.4;
pub const DEFAULT_COMPOSITION_STEPS: u32 = 28;
pub const DEFAULT_COMPOSITION_GUIDANCE: f64 = 3.5;
pub const DEFAULT_STRENGTH: f64 = 0.6;
pub const DEFAULT_GUIDANCE_SCALE: f64 = 3.5;

fn default_start_step() -> u8 {
    1
}
fn default_bg_prompt() -> String {
    DEFAULT_BG_PROMPT.to_string()
}
fn default_bg_negative_prompt() -> String {
    DEFAULT_BG_NEGATIVE_PROMPT.to_string()
}
fn default_text_prompt() -> String {
    DEFAULT_TEXT_PROMPT.to_string()
}
fn default_text_negative_prompt() -> String {
    DEFAULT_TEXT_NEGATIVE_PROMPT.to_string()
}
fn default_composition_strength() -> f64 {
    DEFAULT_COMPOSITION_STRENGTH
}
fn default_composition_steps() -> u32 {
    DEFAULT_COMPOSITION_STEPS
}
fn default_composition_guidance() -> f64 {
    DEFAULT_COMPOSITION_GUIDANCE
}
fn default_strength() -> f64 {
    DEFAULT_STRENGTH
}
fn default_guidance_scale() -> f64 {
    DEFAULT_GUIDANCE_SCALE
}
fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Composition options
// ---------------------------------------------------------------------------

/// How the text asset is merged into the background in Step 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositionMode {
    #[default]
    Overlay,
    Blend,
    Behind,
}

/// Where the text asset is placed on the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextPosition {
    #[default]
    Top,
    Center,
    Bottom,
    Auto,
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Input describing which steps to run and with which parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_step_order"))]
pub struct PipelineRequest {
    /// First step to execute (1-3).
    #[serde(default = "default_start_step")]
    #[validate(range(min = 1, max = 3))]
    pub start_step: u8,
    /// Last step to execute (1-3, at least `start_step`). Defaults to 3.
    #[serde(default)]
    #[validate(range(min = 1, max = 3))]
    pub stop_step: Option<u8>,
    /// Ad copy rendered in Step 2. Empty means background only.
    #[serde(default)]
    pub text_content: Option<String>,

    // -- Step 1 --
    /// Product photo placed onto the generated background.
    #[serde(default)]
    pub input_image: Option<Artifact>,
    #[serde(default = "default_bg_prompt")]
    pub bg_prompt: String,
    #[serde(default = "default_bg_negative_prompt")]
    pub bg_negative_prompt: String,
    #[serde(default)]
    pub bg_composition_prompt: Option<String>,
    #[serde(default)]
    pub bg_composition_negative_prompt: Option<String>,

    // -- Step 2 --
    /// Step 1 output, required when starting at Step 2 or later.
    #[serde(default)]
    pub step1_image: Option<Artifact>,
    #[serde(default = "default_text_prompt", alias = "text_model_prompt")]
    pub text_prompt: String,
    #[serde(default = "default_text_negative_prompt", alias = "negative_prompt")]
    pub text_negative_prompt: String,
    #[serde(default)]
    pub font_name: Option<String>,

    // -- Step 3 --
    /// Step 2 output, required when starting at Step 3.
    #[serde(default)]
    pub step2_image: Option<Artifact>,
    #[serde(default)]
    pub composition_mode: CompositionMode,
    #[serde(default)]
    pub text_position: TextPosition,
    #[serde(default)]
    pub composition_prompt: Option<String>,
    #[serde(default)]
    pub composition_negative_prompt: Option<String>,
    #[serde(default = "default_composition_strength")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub composition_strength: f64,
    #[serde(default = "default_composition_steps")]
    #[validate(range(min = 10, max = 50))]
    pub composition_steps: u32,
    #[serde(default = "default_composition_guidance")]
    #[validate(range(min = 1.0, max = 7.0))]
    pub composition_guidance_scale: f64,

    // -- Shared --
    #[serde(default = "default_strength")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub strength: f64,
    #[serde(default = "default_guidance_scale")]
    #[validate(range(min = 1.0, max = 20.0))]
    pub guidance_scale: f64,
    #[serde(default)]
    pub seed: Option<u64>,
    /// Run with synthetic timed placeholders instead of real inference.
    #[serde(default)]
    pub test_mode: bool,
    /// Release a step's model weights as soon as the step finishes.
    #[serde(default = "default_true")]
    pub auto_unload: bool,
}

fn validate_step_order(req: &PipelineRequest) -> Result<(), ValidationError> {
    match req.stop_step {
        Some(stop) if stop < req.start_step => {
            let mut err = ValidationError::new("stop_before_start");
            err.message = Some(
                format!(
                    "stop_step ({stop}) must be >= start_step ({})",
                    req.start_step
                )
                .into(),
            );
            Err(err)
        }
        _ => Ok(()),
    }
}

impl Default for PipelineRequest {
    fn default() -> Self {
        Self {
            start_step: default_start_step(),
            stop_step: None,
            text_content: None,
            input_image: None,
            bg_prompt: default_bg_prompt(),
            bg_negative_prompt: default_bg_negative_prompt(),
            bg_composition_prompt: None,
            bg_composition_negative_prompt: None,
            step1_image: None,
            text_prompt: default_text_prompt(),
            text_negative_prompt: default_text_negative_prompt(),
            font_name: None,
            step2_image: None,
            composition_mode: CompositionMode::default(),
            text_position: TextPosition::default(),
            composition_prompt: None,
            composition_negative_prompt: None,
            composition_strength: default_composition_strength(),
            composition_steps: default_composition_steps(),
            composition_guidance_scale: default_composition_guidance(),
            strength: default_strength(),
            guidance_scale: default_guidance_scale(),
            seed: None,
            test_mode: false,
            auto_unload: true,
        }
    }
}

impl PipelineRequest {
    /// Run field validation, mapping failures to [`CoreError::Validation`].
    pub fn validated(self) -> Result<Self, CoreError> {
        self.validate()
            .map_err(|e| CoreError::Validation(e.to_string()))?;
        Ok(self)
    }

    /// The inclusive span of steps this request covers.
    ///
    /// Out-of-range numbers (only possible on unvalidated input) are clamped
    /// into the pipeline.
    pub fn step_range(&self) -> StepRange {
        let start = PipelineStep::from_number(self.start_step.clamp(1, 3))
            .unwrap_or(PipelineStep::Step1);
        let stop = self
            .stop_step
            .and_then(|n| PipelineStep::from_number(n.clamp(1, 3)))
            .unwrap_or(PipelineStep::Step3);
        StepRange::new(start, stop).unwrap_or(StepRange {
            start,
            stop: start,
        })
    }

    /// Whether the request carries ad copy for Step 2.
    pub fn has_text(&self) -> bool {
        self.text_content
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty())
    }
}
