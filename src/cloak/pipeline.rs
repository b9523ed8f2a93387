//! Batch orchestration: detection, target selection, optimization and
//! compositing for a set of photos.

use super::error::CloakError;
use super::geometry::{merge_back, scan, DetectedFace, FaceScan};
use super::image_io::{dump_image, filter_image_paths, imagenet_preprocess, imagenet_reverse, OutputFormat, Photo};
use super::target::{Gallery, TargetSelector};
use crate::models::{
    extract_embeddings, CloakOptimizer, FaceAligner, FeatureExtractor, ImageTensor, OptimizerParams,
};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Constant handed to the optimizer as the initial penalty weight.
const INITIAL_CONST: f64 = 1e9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityMode {
    Low,
    Mid,
    High,
    Ultra,
}

impl QualityMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Mid => "mid",
            Self::High => "high",
            Self::Ultra => "ultra",
        }
    }

    pub fn params(&self) -> OptimizerParams {
        let (threshold, max_iterations, learning_rate) = match self {
            Self::Low => (0.003, 45, 20.0),
            Self::Mid => (0.005, 120, 15.0),
            Self::High => (0.008, 600, 10.0),
            Self::Ultra => (0.01, 1000, 10.0),
        };
        OptimizerParams {
            threshold,
            learning_rate,
            max_iterations,
            initial_const: INITIAL_CONST,
        }
    }

    pub fn requires_gpu(&self) -> bool {
        matches!(self, Self::Ultra)
    }
}

impl std::str::FromStr for QualityMode {
    type Err = CloakError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "mid" => Ok(Self::Mid),
            "high" => Ok(Self::High),
            "ultra" => Ok(Self::Ultra),
            other => Err(CloakError::UnknownMode(other.to_string())),
        }
    }
}

impl std::fmt::Display for QualityMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How faces are grouped for target identity selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetMode {
    /// Independent identity per face.
    #[default]
    PerFace,
    /// One identity shared by all faces of a photo.
    PerPhoto,
    /// One identity for the whole batch.
    Joint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloakSettings {
    pub mode: QualityMode,
    pub format: OutputFormat,
    pub target_mode: TargetMode,
    pub max_batch_faces: usize,
    pub margin: f32,
}

impl Default for CloakSettings {
    fn default() -> Self {
        Self {
            mode: QualityMode::Low,
            format: OutputFormat::Jpeg,
            target_mode: TargetMode::PerFace,
            max_batch_faces: 8,
            margin: 0.7,
        }
    }
}

/// Process-wide model handles and gallery. Built once, shared by reference.
pub struct CloakService {
    aligner: Arc<dyn FaceAligner>,
    extractors: Vec<Arc<dyn FeatureExtractor>>,
    optimizer: Arc<dyn CloakOptimizer>,
    gallery: Gallery,
    rng: Mutex<StdRng>,
}

impl CloakService {
    pub fn new(
        aligner: Arc<dyn FaceAligner>,
        extractors: Vec<Arc<dyn FeatureExtractor>>,
        optimizer: Arc<dyn CloakOptimizer>,
        gallery: Gallery,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            aligner,
            extractors,
            optimizer,
            gallery,
            rng: Mutex::new(rng),
        }
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloakOutput {
    pub source: PathBuf,
    pub output: PathBuf,
}

/// Outcome of one pipeline pass.
#[derive(Debug, Default)]
pub struct CloakReport {
    pub outputs: Vec<CloakOutput>,
    pub no_face: Vec<PathBuf>,
    pub skipped: usize,
}

/// `<input-without-extension>_<mode>_cloaked.<format>`
pub fn output_path(input: &Path, mode: QualityMode, format: OutputFormat) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = format!("{stem}_{}_cloaked.{}", mode.as_str(), format.extension());
    input.with_file_name(name)
}

/// Splits face indices into target-selection groups.
fn target_groups(faces: &[DetectedFace], mode: TargetMode) -> Vec<Vec<usize>> {
    match mode {
        TargetMode::PerFace => (0..faces.len()).map(|i| vec![i]).collect(),
        TargetMode::Joint => vec![(0..faces.len()).collect()],
        TargetMode::PerPhoto => {
            let mut groups: Vec<(usize, Vec<usize>)> = Vec::new();
            for (i, face) in faces.iter().enumerate() {
                match groups.iter_mut().find(|(photo, _)| *photo == face.photo_index) {
                    Some((_, members)) => members.push(i),
                    None => groups.push((face.photo_index, vec![i])),
                }
            }
            groups.into_iter().map(|(_, members)| members).collect()
        }
    }
}

pub struct CloakPipeline {
    settings: CloakSettings,
}

impl CloakPipeline {
    pub fn new(settings: CloakSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &CloakSettings {
        &self.settings
    }

    /// Cloaks every readable image in `paths` and writes one output per
    /// photo with at least one face.
    pub async fn run(&self, service: &CloakService, paths: &[PathBuf]) -> Result<CloakReport, CloakError> {
        let mode = self.settings.mode;
        if mode.requires_gpu() && !service.optimizer.gpu_available().await? {
            return Err(CloakError::GpuRequired);
        }

        let photos = filter_image_paths(paths);
        if photos.is_empty() {
            return Err(CloakError::NoImages);
        }

        let mut report = CloakReport {
            skipped: paths.len() - photos.len(),
            ..Default::default()
        };

        let mut faces: Vec<DetectedFace> = Vec::new();
        for (photo_index, photo) in photos.iter().enumerate() {
            match self.detect(service, photo, photo_index).await {
                FaceScan::Faces(found) => {
                    info!("Found {} face(s) in {}", found.len(), photo.id);
                    faces.extend(found);
                }
                FaceScan::NoFace => {
                    info!("Found 0 face(s) in {}", photo.id);
                    report.no_face.push(photo.path.clone());
                }
            }
        }

        if faces.is_empty() {
            return Err(CloakError::FaceNotFound);
        }

        let crops: Vec<ImageTensor> = faces.iter().map(|f| imagenet_preprocess(&f.canonical)).collect();
        let embeddings = extract_embeddings(&service.extractors, &crops).await?;
        let targets = self.select_targets(service, &faces, &embeddings)?;
        let protected = self.optimize(service, &crops, &targets).await?;

        let perturbations: Vec<ImageTensor> = protected
            .iter()
            .zip(crops.iter())
            .map(|(p, o)| imagenet_reverse(p) - imagenet_reverse(o))
            .collect();

        for (photo_index, photo) in photos.iter().enumerate() {
            let owned: Vec<(&DetectedFace, &ImageTensor)> = faces
                .iter()
                .zip(perturbations.iter())
                .filter(|(face, _)| face.photo_index == photo_index)
                .collect();
            if owned.is_empty() {
                continue;
            }

            let cloaked = merge_back(photo, owned);
            let output = output_path(&photo.path, mode, self.settings.format);
            dump_image(&cloaked, &output, self.settings.format)?;
            debug!("Wrote {}", output.display());
            report.outputs.push(CloakOutput {
                source: photo.path.clone(),
                output,
            });
        }

        info!(
            "Cloaked {} photo(s), {} without faces, {} skipped",
            report.outputs.len(),
            report.no_face.len(),
            report.skipped
        );
        Ok(report)
    }

    async fn detect(&self, service: &CloakService, photo: &Photo, photo_index: usize) -> FaceScan {
        match service.aligner.detect(&photo.pixels).await {
            Ok(detections) => scan(photo, photo_index, &detections, self.settings.margin),
            Err(e) => {
                warn!("Face detection failed for {}: {e}", photo.id);
                FaceScan::NoFace
            }
        }
    }

    /// One target image per face, indexed like `faces`.
    fn select_targets(
        &self,
        service: &CloakService,
        faces: &[DetectedFace],
        embeddings: &[Vec<f32>],
    ) -> Result<Vec<ImageTensor>, CloakError> {
        let selector = TargetSelector::new(&service.gallery);
        let mut rng = service
            .rng
            .lock()
            .map_err(|_| CloakError::GalleryUnavailable("selection rng poisoned".to_string()))?;

        let mut targets: Vec<Option<ImageTensor>> = vec![None; faces.len()];
        for group in target_groups(faces, self.settings.target_mode) {
            let group_embeddings: Vec<Vec<f32>> = group.iter().map(|&i| embeddings[i].clone()).collect();
            let batch = selector.select_target(&group_embeddings, &mut *rng)?;
            debug!(
                "Target identity {} for {} face(s)",
                batch.identity,
                group.len()
            );
            for (&i, image) in group.iter().zip(batch.images) {
                targets[i] = Some(image);
            }
        }

        targets
            .into_iter()
            .map(|t| t.ok_or_else(|| CloakError::GalleryUnavailable("target batch too short".to_string())))
            .collect()
    }

    /// Calls the optimizer in chunks of at most `max_batch_faces` and writes
    /// results back by face index.
    async fn optimize(
        &self,
        service: &CloakService,
        crops: &[ImageTensor],
        targets: &[ImageTensor],
    ) -> Result<Vec<ImageTensor>, CloakError> {
        let params = self.settings.mode.params();
        let chunk = self.settings.max_batch_faces.max(1);
        let indices: Vec<usize> = (0..crops.len()).collect();
        let mut protected: Vec<Option<ImageTensor>> = vec![None; crops.len()];

        for (n, batch) in indices.chunks(chunk).enumerate() {
            let batch_crops: Vec<ImageTensor> = batch.iter().map(|&i| crops[i].clone()).collect();
            let batch_targets: Vec<ImageTensor> = batch.iter().map(|&i| targets[i].clone()).collect();

            let started = Instant::now();
            let results = service
                .optimizer
                .optimize(&batch_crops, &batch_targets, &params)
                .await
                .map_err(|e| CloakError::OptimizerFailure(e.to_string()))?;
            info!(
                "Optimizer sub-batch {n} ({} faces) took {:.1}s",
                batch.len(),
                started.elapsed().as_secs_f32()
            );

            if results.len() != batch.len() {
                return Err(CloakError::OptimizerFailure(format!(
                    "expected {} crops, got {}",
                    batch.len(),
                    results.len()
                )));
            }
            for (&i, result) in batch.iter().zip(results) {
                if result.dim() != crops[i].dim() {
                    return Err(CloakError::OptimizerFailure(format!(
                        "crop {i} came back with shape {:?}",
                        result.dim()
                    )));
                }
                protected[i] = Some(result);
            }
        }

        protected
            .into_iter()
            .map(|p| p.ok_or_else(|| CloakError::OptimizerFailure("missing optimizer output".to_string())))
            .collect()
    }
}
