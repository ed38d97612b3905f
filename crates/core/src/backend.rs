//! The inference boundary.
//!
//! Every model call the pipeline makes goes through [`ModelBackend`]. The
//! operations are synchronous and may block for minutes; they report
//! intermediate progress through a callback and return exactly one
//! [`Artifact`] or a [`BackendError`].

use serde::{Deserialize, Serialize};

use crate::artifact::Artifact;
use crate::progress::ProgressFn;
use crate::request::{CompositionMode, PipelineRequest, TextPosition};
use crate::step::PipelineStep;

/// Failure reported by a backend operation.
///
/// The `Display` output is stored verbatim as the failed job's message.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{0}")]
    Inference(String),

    #[error("inference service unreachable: {0}")]
    Transport(String),

    #[error("inference service returned an invalid image: {0}")]
    InvalidOutput(String),

    #[error("{0}")]
    Unavailable(String),
}

/// Individual inference operations, in the order the pipeline may call them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendOp {
    Segmentation,
    BackgroundGeneration,
    FeatureInjection,
    TextGeneration,
    Composition,
}

impl BackendOp {
    /// Label used in `sub_step` and as the remote endpoint path.
    pub fn label(self) -> &'static str {
        match self {
            Self::Segmentation => "segmentation",
            Self::BackgroundGeneration => "background_generation",
            Self::FeatureInjection => "feature_injection",
            Self::TextGeneration => "text_generation",
            Self::Composition => "composition",
        }
    }
}

impl std::fmt::Display for BackendOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// Operation inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SegmentParams {
    pub image: Artifact,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackgroundParams {
    pub prompt: String,
    pub negative_prompt: String,
    pub guidance_scale: f64,
    pub seed: Option<u64>,
}

/// Blend a segmented product into a generated background.
#[derive(Debug, Clone, Serialize)]
pub struct InjectionParams {
    pub background: Artifact,
    pub product: Artifact,
    pub prompt: String,
    pub negative_prompt: String,
    pub strength: f64,
    pub guidance_scale: f64,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextParams {
    pub text: String,
    pub prompt: String,
    pub negative_prompt: String,
    pub font_name: Option<String>,
    pub guidance_scale: f64,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompositeParams {
    pub background: Artifact,
    pub text: Artifact,
    pub mode: CompositionMode,
    pub position: TextPosition,
    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,
    pub strength: f64,
    pub steps: u32,
    pub guidance_scale: f64,
    pub seed: Option<u64>,
}

impl BackgroundParams {
    pub fn from_request(req: &PipelineRequest) -> Self {
        Self {
            prompt: req.bg_prompt.clone(),
            negative_prompt: req.bg_negative_prompt.clone(),
            guidance_scale: req.guidance_scale,
            seed: req.seed,
        }
    }
}

pub const DEFAULT_INJECTION_PROMPT: &str = "A photorealistic object integration. Heavy contact \
shadows, ambient occlusion, realistic texture and lighting, 8k, extremely detailed, cinematic.";
pub const DEFAULT_INJECTION_NEGATIVE_PROMPT: &str =
    "floating, disconnected, unrealistic shadows, artificial lighting, cut out, sticker effect";

impl InjectionParams {
    pub fn from_request(req: &PipelineRequest, background: Artifact, product: Artifact) -> Self {
        Self {
            background,
            product,
            prompt: req
                .bg_composition_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_INJECTION_PROMPT.to_string()),
            negative_prompt: req
                .bg_composition_negative_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_INJECTION_NEGATIVE_PROMPT.to_string()),
            strength: req.strength,
            guidance_scale: req.guidance_scale,
            seed: req.seed,
        }
    }
}

impl TextParams {
    pub fn from_request(req: &PipelineRequest) -> Self {
        Self {
            text: req.text_content.clone().unwrap_or_default(),
            prompt: req.text_prompt.clone(),
            negative_prompt: req.text_negative_prompt.clone(),
            font_name: req.font_name.clone(),
            guidance_scale: req.guidance_scale,
            seed: req.seed,
        }
    }
}

impl CompositeParams {
    pub fn from_request(req: &PipelineRequest, background: Artifact, text: Artifact) -> Self {
        Self {
            background,
            text,
            mode: req.composition_mode,
            position: req.text_position,
            prompt: req.composition_prompt.clone(),
            negative_prompt: req.composition_negative_prompt.clone(),
            strength: req.composition_strength,
            steps: req.composition_steps,
            guidance_scale: req.composition_guidance_scale,
            seed: req.seed,
        }
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Synchronous inference operations used by the step executor.
///
/// Implementations must invoke `progress` with monotonically sensible
/// `(ordinal, total)` pairs local to the operation; the executor maps them
/// onto the enclosing step.
pub trait ModelBackend: Send + Sync {
    fn segment(
        &self,
        params: &SegmentParams,
        progress: &mut ProgressFn<'_>,
    ) -> Result<Artifact, BackendError>;

    fn generate_background(
        &self,
        params: &BackgroundParams,
        progress: &mut ProgressFn<'_>,
    ) -> Result<Artifact, BackendError>;

    fn inject_product(
        &self,
        params: &InjectionParams,
        progress: &mut ProgressFn<'_>,
    ) -> Result<Artifact, BackendError>;

    fn generate_text(
        &self,
        params: &TextParams,
        progress: &mut ProgressFn<'_>,
    ) -> Result<Artifact, BackendError>;

    fn composite(
        &self,
        params: &CompositeParams,
        progress: &mut ProgressFn<'_>,
    ) -> Result<Artifact, BackendError>;

    /// Release any weights held for `step`. Backends without local state
    /// can ignore this.
    fn unload(&self, _step: PipelineStep) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injection_prompts_fall_back_to_integration_defaults() {
        let req = PipelineRequest {
            bg_prompt: "marble counter".into(),
            ..Default::default()
        };
        let bg = Artifact::from_encoded("YmFja2dyb3VuZA==");
        let product = Artifact::from_encoded("cHJvZHVjdA==");
        let params = InjectionParams::from_request(&req, bg, product);
        assert_eq!(params.prompt, DEFAULT_INJECTION_PROMPT);
        assert_eq!(params.negative_prompt, DEFAULT_INJECTION_NEGATIVE_PROMPT);
    }

    #[test]
    fn injection_prompts_prefer_dedicated_values() {
        let req = PipelineRequest {
            bg_composition_prompt: Some("place the bottle".into()),
            ..Default::default()
        };
        let art = Artifact::from_encoded("eA==");
        let params = InjectionParams::from_request(&req, art.clone(), art);
        assert_eq!(params.prompt, "place the bottle");
    }

    #[test]
    fn composite_params_carry_composition_knobs() {
        let req = PipelineRequest {
            composition_mode: CompositionMode::Behind,
            composition_steps: 40,
            seed: Some(7),
            ..Default::default()
        };
        let art = Artifact::from_encoded("eA==");
        let params = CompositeParams::from_request(&req, art.clone(), art);
        assert_eq!(params.mode, CompositionMode::Behind);
        assert_eq!(params.steps, 40);
        assert_eq!(params.seed, Some(7));
    }

    #[test]
    fn inference_errors_display_verbatim() {
        let err = BackendError::Inference("CUDA out of memory".into());
        assert_eq!(err.to_string(), "CUDA out of memory");
    }

    #[test]
    fn op_labels_are_snake_case() {
        assert_eq!(BackendOp::BackgroundGeneration.label(), "background_generation");
        assert_eq!(
            serde_json::to_string(&BackendOp::FeatureInjection).unwrap(),
            "\"feature_injection\""
        );
    }
}
