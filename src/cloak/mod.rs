pub mod error;
pub mod geometry;
pub mod image_io;
pub mod pipeline;
pub mod target;

pub use error::CloakError;
pub use geometry::{DetectedFace, FaceScan, PixelBox};
pub use image_io::{OutputFormat, Photo};
pub use pipeline::{
    output_path, CloakOutput, CloakPipeline, CloakReport, CloakService, CloakSettings, QualityMode,
    TargetMode,
};
pub use target::{Gallery, GalleryEntry, TargetBatch, TargetSelector};
