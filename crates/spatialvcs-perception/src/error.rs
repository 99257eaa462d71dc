//! Error type for the perception layer.

use spatialvcs_types::SpatialError;
use thiserror::Error;

/// Hard failures raised by detection or frame persistence.
///
/// Degraded paths (undecodable frame, missing model, tracker fallback) are
/// reported through outcome enums instead; this type is for conditions the
/// caller must see.
#[derive(Error, Debug)]
pub enum PerceptionError {
    #[error("detection model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<PerceptionError> for SpatialError {
    fn from(e: PerceptionError) -> Self {
        SpatialError::Perception(e.to_string())
    }
}
