use adgen_core::artifact::ArtifactError;
use adgen_core::backend::{BackendError, BackendOp};

/// Reasons a step can fail. The `Display` output becomes the job message.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// The backend rejected or failed the operation. Shown verbatim.
    #[error("{source}")]
    Backend {
        op: BackendOp,
        #[source]
        source: BackendError,
    },

    /// The backend returned something that is not a readable image.
    #[error("{op} returned an unreadable image: {source}")]
    InvalidOutput {
        op: BackendOp,
        #[source]
        source: ArtifactError,
    },

    /// An upstream artifact needed to enter the range was not supplied.
    #[error("{artifact} is required when starting at step {start_step} but was not provided")]
    MissingArtifact {
        artifact: &'static str,
        start_step: u8,
    },

    /// A caller-supplied artifact could not be decoded.
    #[error("{artifact} could not be decoded: {source}")]
    InvalidArtifact {
        artifact: &'static str,
        #[source]
        source: ArtifactError,
    },
}
