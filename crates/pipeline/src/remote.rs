//! HTTP adapter for an external inference service.
//!
//! Every operation is a `POST {base_url}/{op}` with the operation's params
//! as JSON, answered by `{"image": "<base64>"}`. The service does not
//! stream progress, so each operation reports a single `(1, 1)` callback
//! when it returns.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use adgen_core::artifact::Artifact;
use adgen_core::backend::{
    BackendError, BackendOp, BackgroundParams, CompositeParams, InjectionParams, ModelBackend,
    SegmentParams, TextParams,
};
use adgen_core::progress::{ProgressFn, StepProgress};
use adgen_core::step::PipelineStep;

/// Default per-request timeout; diffusion calls can take minutes.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Deserialize)]
struct ImageResponse {
    image: String,
}

#[derive(Debug, Serialize)]
struct UnloadRequest {
    step: PipelineStep,
}

pub struct RemoteBackend {
    client: reqwest::blocking::Client,
    base_url: Option<String>,
}

impl RemoteBackend {
    /// Create a client for the service at `base_url`.
    ///
    /// With `None`, every operation fails with [`BackendError::Unavailable`].
    pub fn new(base_url: Option<String>, timeout: Duration) -> Result<Self, BackendError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.map(|url| url.trim_end_matches('/').to_string()),
        })
    }

    fn base_url(&self) -> Result<&str, BackendError> {
        self.base_url.as_deref().ok_or_else(|| {
            BackendError::Unavailable(
                "No inference service configured (set ADGEN_INFERENCE_URL or submit with test_mode)"
                    .into(),
            )
        })
    }

    fn call<P: Serialize>(
        &self,
        op: BackendOp,
        params: &P,
        progress: &mut ProgressFn<'_>,
    ) -> Result<Artifact, BackendError> {
        let url = format!("{}/{}", self.base_url()?, op.label());
        tracing::debug!(url = %url, "Calling inference service");

        let response = self
            .client
            .post(&url)
            .json(params)
            .send()
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .unwrap_or_else(|e| format!("<failed to read body: {e}>"));
            return Err(BackendError::Inference(format!(
                "{op} failed ({}): {body}",
                status.as_u16()
            )));
        }

        let body: ImageResponse = response
            .json()
            .map_err(|e| BackendError::InvalidOutput(e.to_string()))?;
        progress(StepProgress::new(1, 1, op.label()));
        Ok(Artifact::from_encoded(body.image))
    }
}

impl ModelBackend for RemoteBackend {
    fn segment(
        &self,
        params: &SegmentParams,
        progress: &mut ProgressFn<'_>,
    ) -> Result<Artifact, BackendError> {
        self.call(BackendOp::Segmentation, params, progress)
    }

    fn generate_background(
        &self,
        params: &BackgroundParams,
        progress: &mut ProgressFn<'_>,
    ) -> Result<Artifact, BackendError> {
        self.call(BackendOp::BackgroundGeneration, params, progress)
    }

    fn inject_product(
        &self,
        params: &InjectionParams,
        progress: &mut ProgressFn<'_>,
    ) -> Result<Artifact, BackendError> {
        self.call(BackendOp::FeatureInjection, params, progress)
    }

    fn generate_text(
        &self,
        params: &TextParams,
        progress: &mut ProgressFn<'_>,
    ) -> Result<Artifact, BackendError> {
        self.call(BackendOp::TextGeneration, params, progress)
    }

    fn composite(
        &self,
        params: &CompositeParams,
        progress: &mut ProgressFn<'_>,
    ) -> Result<Artifact, BackendError> {
        self.call(BackendOp::Composition, params, progress)
    }

    /// Best effort: a failed unload only costs memory on the service.
    fn unload(&self, step: PipelineStep) {
        let Ok(base) = self.base_url() else {
            return;
        };
        let result = self
            .client
            .post(format!("{base}/unload"))
            .json(&UnloadRequest { step })
            .send();
        if let Err(e) = result {
            tracing::warn!(step = %step, error = %e, "Failed to unload remote weights");
        }
    }
}
