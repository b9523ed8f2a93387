use crate::models::ModelError;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CloakError {
    #[error("Not an image: {path}: {reason}")]
    InvalidImage { path: PathBuf, reason: String },
    #[error("No faces detected in any photo of the batch")]
    FaceNotFound,
    #[error("No readable images in batch")]
    NoImages,
    #[error("Target gallery unavailable: {0}")]
    GalleryUnavailable(String),
    #[error("Optimizer failure: {0}")]
    OptimizerFailure(String),
    #[error("Mode 'ultra' requires a GPU and none is available")]
    GpuRequired,
    #[error("Unknown quality mode: {0}")]
    UnknownMode(String),
    #[error("Unknown output format: {0}")]
    UnknownFormat(String),
    #[error("Model error: {0}")]
    Model(#[from] ModelError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image encoding error: {0}")]
    Encode(#[from] image::ImageError),
}

impl CloakError {
    /// Batch-level outcomes the worker treats as expected rather than faults.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::FaceNotFound | Self::NoImages)
    }
}
