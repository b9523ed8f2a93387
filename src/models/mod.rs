use async_trait::async_trait;
use ndarray::Array3;
use serde::{Deserialize, Serialize};

pub mod python_bridge;

pub use python_bridge::{BridgeExtractor, ModelBridge, ModelBridgeConfig};

/// Height x width x channel pixel tensor. Channels are RGB unless a
/// function says it works in preprocessed (BGR, mean-centred) space.
pub type ImageTensor = Array3<f32>;

/// Side length of the canonical face crop fed to extractors and the optimizer.
pub const CANONICAL_SIDE: usize = 224;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }

        let intersection = (x2 - x1) * (y2 - y1);
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Point2D {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FaceLandmarks {
    pub points: Vec<Point2D>,
}

/// Raw detector output for one face, in source photo coordinates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FaceDetection {
    pub bbox: BoundingBox,
    pub landmarks: Option<FaceLandmarks>,
}

/// Parameters handed to the perturbation optimizer for one call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct OptimizerParams {
    /// Perceptual distortion budget.
    pub threshold: f32,
    pub learning_rate: f32,
    pub max_iterations: u32,
    pub initial_const: f64,
}

#[async_trait]
pub trait FaceAligner: Send + Sync {
    async fn detect(&self, image: &ImageTensor) -> Result<Vec<FaceDetection>, ModelError>;
}

#[async_trait]
pub trait FeatureExtractor: Send + Sync {
    fn name(&self) -> &str;

    /// One embedding row per crop, crops in preprocessed space.
    async fn embed(&self, crops: &[ImageTensor]) -> Result<Vec<Vec<f32>>, ModelError>;
}

#[async_trait]
pub trait CloakOptimizer: Send + Sync {
    async fn gpu_available(&self) -> Result<bool, ModelError>;

    /// Returns one protected crop per input crop, same order and shape.
    async fn optimize(
        &self,
        crops: &[ImageTensor],
        targets: &[ImageTensor],
        params: &OptimizerParams,
    ) -> Result<Vec<ImageTensor>, ModelError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Failed to spawn model process: {0}")]
    ProcessSpawnFailed(String),
    #[error("Model process is not running")]
    ProcessNotRunning,
    #[error("Communication error: {0}")]
    CommunicationError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Model bridge health check failed")]
    HealthCheckFailed,
    #[error("Face detection failed: {0}")]
    DetectionFailed(String),
    #[error("Embedding extraction failed: {0}")]
    EmbeddingFailed(String),
    #[error("Optimization failed: {0}")]
    OptimizationFailed(String),
    #[error("Invalid tensor: {0}")]
    InvalidTensor(String),
}

/// L2-normalizes every row in place. Zero rows are left untouched.
pub fn normalize_rows(rows: &mut [Vec<f32>]) {
    for row in rows.iter_mut() {
        let norm: f32 = row.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for val in row.iter_mut() {
                *val /= norm;
            }
        }
    }
}

/// Runs every extractor over `crops` and concatenates their outputs per crop,
/// then L2-normalizes the concatenation.
pub async fn extract_embeddings(
    extractors: &[std::sync::Arc<dyn FeatureExtractor>],
    crops: &[ImageTensor],
) -> Result<Vec<Vec<f32>>, ModelError> {
    let mut merged: Vec<Vec<f32>> = vec![Vec::new(); crops.len()];

    for extractor in extractors {
        let rows = extractor.embed(crops).await?;
        if rows.len() != crops.len() {
            return Err(ModelError::EmbeddingFailed(format!(
                "extractor {} returned {} rows for {} crops",
                extractor.name(),
                rows.len(),
                crops.len()
            )));
        }
        for (dst, row) in merged.iter_mut().zip(rows) {
            dst.extend(row);
        }
    }

    normalize_rows(&mut merged);
    Ok(merged)
}
