//! Encoded raster images exchanged between steps.
//!
//! Artifacts travel as base64 strings (optionally wrapped in a `data:` URL)
//! in requests, job records and the worker protocol. They are only decoded
//! to check that the payload really is an image.

use std::io::Cursor;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::{DynamicImage, ImageFormat, ImageReader, Rgb, RgbImage};
use serde::{Deserialize, Serialize};

/// Errors raised when an artifact cannot be decoded.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("payload is not a supported image: {0}")]
    Image(#[from] image::ImageError),

    #[error("failed to read image header: {0}")]
    Io(#[from] std::io::Error),

    #[error("artifact is empty")]
    Empty,
}

/// A base64-encoded image produced by a step or supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Artifact(String);

impl Artifact {
    /// Wrap an already-encoded payload without inspecting it.
    pub fn from_encoded(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    /// Encode raw image bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(STANDARD.encode(bytes))
    }

    /// Render a solid-colour PNG. Used for synthetic placeholders.
    pub fn solid_png(width: u32, height: u32, rgb: [u8; 3]) -> Result<Self, ArtifactError> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(rgb)));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
        Ok(Self::from_bytes(&buf))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }

    /// Decode to raw bytes, accepting an optional `data:*;base64,` prefix.
    pub fn decode(&self) -> Result<Vec<u8>, ArtifactError> {
        let payload = match self.0.split_once(";base64,") {
            Some((prefix, rest)) if prefix.starts_with("data:") => rest,
            _ => self.0.as_str(),
        };
        let payload = payload.trim();
        if payload.is_empty() {
            return Err(ArtifactError::Empty);
        }
        Ok(STANDARD.decode(payload)?)
    }

    /// Decode and read the image header, returning `(width, height)`.
    pub fn dimensions(&self) -> Result<(u32, u32), ArtifactError> {
        let bytes = self.decode()?;
        // An unrecognised header leaves the format unset and makes
        // `into_dimensions` fail with `Unsupported`.
        let reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
        Ok(reader.into_dimensions()?)
    }
}
