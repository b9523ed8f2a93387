//! In-memory stand-ins for the queue, blob store, datastore and model
//! process, shared by unit and integration tests.

use crate::cloak::target::Gallery;
use crate::cloak::CloakError;
use crate::models::{
    BoundingBox, CloakOptimizer, FaceAligner, FaceDetection, FeatureExtractor, ImageTensor, ModelError,
    OptimizerParams,
};
use crate::worker::{
    BlobStore, DatastoreError, DocumentStore, DriveError, Job, MessageQueue, QueueError, QueueMessage,
    StagedDocument, WriteBatch,
};
use async_trait::async_trait;
use flate2::write::GzEncoder;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, Once};
use std::time::Duration;

static INIT: Once = Once::new();

pub fn setup() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

#[macro_export]
macro_rules! assert_ok {
    ($expr:expr) => {
        match $expr {
            Ok(val) => val,
            Err(err) => panic!("Expected Ok, got Err: {:?}", err),
        }
    };
}

#[macro_export]
macro_rules! assert_err {
    ($expr:expr) => {
        match $expr {
            Ok(val) => panic!("Expected Err, got Ok: {:?}", val),
            Err(err) => err,
        }
    };
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn job(uid: &str, image_url: &str) -> Job {
    let mut body = Map::new();
    body.insert("uid".to_string(), Value::String(uid.to_string()));
    body.insert("imageUrl".to_string(), Value::String(image_url.to_string()));
    Job {
        uid: uid.to_string(),
        image_url: image_url.to_string(),
        body,
    }
}

/// Writes a `width x height` gradient PNG.
pub fn write_photo(dir: &Path, name: &str, width: u32, height: u32) -> Result<PathBuf, CloakError> {
    let path = dir.join(name);
    image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x * 7 % 256) as u8, (y * 5 % 256) as u8, ((x + y) % 256) as u8])
    })
    .save_with_format(&path, image::ImageFormat::Png)?;
    Ok(path)
}

/// Encoded PNG of a gradient, for objects served by [`FakeDrive`].
pub fn png_bytes(width: u32, height: u32, shade: u8) -> Result<Vec<u8>, CloakError> {
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x * 7 % 256) as u8, (y * 5 % 256) as u8, shade])
    });
    let mut bytes = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(bytes)
}

/// Writes a gallery of `identities` entries for the `fake` extractor, each
/// with two small exemplars, and loads it.
pub fn write_gallery(model_dir: &Path, identities: u32) -> Result<Gallery, CloakError> {
    let mut table: BTreeMap<String, Vec<f32>> = BTreeMap::new();
    for id in 0..identities {
        let angle = id as f32 * 0.05;
        table.insert(id.to_string(), vec![angle.cos(), angle.sin(), 0.0]);

        let dir = model_dir.join("target_data").join(id.to_string());
        std::fs::create_dir_all(&dir)?;
        for n in 0..2u8 {
            image::RgbImage::from_pixel(8, 8, image::Rgb([id as u8, n * 100, 50]))
                .save_with_format(dir.join(format!("{n}.jpg")), image::ImageFormat::Jpeg)?;
        }
    }

    let json = serde_json::to_vec(&table).map_err(std::io::Error::other)?;
    let file = std::fs::File::create(model_dir.join("fake_emb.json.gz"))?;
    let mut encoder = GzEncoder::new(file, flate2::Compression::default());
    encoder.write_all(&json)?;
    encoder.finish()?;

    Gallery::load(model_dir, &["fake".to_string()])
}

/// Reports one face covering the middle of every image, or none at all.
pub struct FakeAligner {
    finds_faces: bool,
}

impl FakeAligner {
    pub fn centered() -> Self {
        Self { finds_faces: true }
    }

    pub fn blind() -> Self {
        Self { finds_faces: false }
    }
}

#[async_trait]
impl FaceAligner for FakeAligner {
    async fn detect(&self, image: &ImageTensor) -> Result<Vec<FaceDetection>, ModelError> {
        if !self.finds_faces {
            return Ok(Vec::new());
        }
        let (h, w, _) = image.dim();
        Ok(vec![FaceDetection {
            bbox: BoundingBox {
                x: w as f32 / 4.0,
                y: h as f32 / 4.0,
                width: w as f32 / 2.0,
                height: h as f32 / 2.0,
                confidence: 0.99,
            },
            landmarks: None,
        }])
    }
}

/// Per-channel mean of each crop.
pub struct FakeExtractor {
    name: String,
}

impl FakeExtractor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl FeatureExtractor for FakeExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn embed(&self, crops: &[ImageTensor]) -> Result<Vec<Vec<f32>>, ModelError> {
        Ok(crops
            .iter()
            .map(|crop| {
                (0..3)
                    .map(|c| crop.index_axis(ndarray::Axis(2), c).mean().unwrap_or(0.0))
                    .collect()
            })
            .collect())
    }
}

/// Adds a constant to every crop and counts calls.
pub struct FakeOptimizer {
    gpu: bool,
    calls: AtomicUsize,
    delay: Duration,
}

impl FakeOptimizer {
    pub fn with_gpu(gpu: bool) -> Self {
        Self {
            gpu,
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    /// Sleeps for `delay` inside every optimize call.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CloakOptimizer for FakeOptimizer {
    async fn gpu_available(&self) -> Result<bool, ModelError> {
        Ok(self.gpu)
    }

    async fn optimize(
        &self,
        crops: &[ImageTensor],
        targets: &[ImageTensor],
        _params: &OptimizerParams,
    ) -> Result<Vec<ImageTensor>, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if crops.len() != targets.len() {
            return Err(ModelError::OptimizationFailed(format!(
                "{} crops but {} targets",
                crops.len(),
                targets.len()
            )));
        }
        Ok(crops.iter().map(|c| c + 1.0).collect())
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueueMessage>,
    deleted: Vec<String>,
    visibility: Vec<(usize, i32)>,
    receive_calls: usize,
    max_per_call: Option<usize>,
    next_receipt: usize,
}

#[derive(Default)]
pub struct FakeQueue {
    state: Mutex<QueueState>,
}

impl FakeQueue {
    pub fn with_bodies(bodies: &[&str]) -> Self {
        let queue = Self::default();
        for body in bodies {
            queue.push(body);
        }
        queue
    }

    pub fn push(&self, body: &str) {
        let mut state = lock(&self.state);
        let receipt_handle = format!("r{}", state.next_receipt);
        state.next_receipt += 1;
        state.pending.push_back(QueueMessage {
            receipt_handle,
            body: body.to_string(),
        });
    }

    pub fn set_max_per_call(&self, max: usize) {
        lock(&self.state).max_per_call = Some(max);
    }

    pub fn pending(&self) -> usize {
        lock(&self.state).pending.len()
    }

    pub fn deleted(&self) -> Vec<String> {
        lock(&self.state).deleted.clone()
    }

    /// `(message count, seconds)` for every visibility change.
    pub fn visibility_changes(&self) -> Vec<(usize, i32)> {
        lock(&self.state).visibility.clone()
    }

    pub fn receive_calls(&self) -> usize {
        lock(&self.state).receive_calls
    }
}

#[async_trait]
impl MessageQueue for FakeQueue {
    async fn receive(
        &self,
        max: usize,
        _wait_seconds: i32,
        _visibility_seconds: i32,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let mut state = lock(&self.state);
        state.receive_calls += 1;
        let take = state.max_per_call.map_or(max, |m| m.min(max)).min(state.pending.len());
        Ok(state.pending.drain(..take).collect())
    }

    async fn delete_batch(&self, receipt_handles: &[String]) -> Result<(), QueueError> {
        lock(&self.state).deleted.extend(receipt_handles.iter().cloned());
        Ok(())
    }

    async fn change_visibility(&self, receipt_handles: &[String], seconds: i32) -> Result<(), QueueError> {
        lock(&self.state).visibility.push((receipt_handles.len(), seconds));
        Ok(())
    }
}

#[derive(Default)]
struct DriveState {
    objects: HashMap<String, Vec<u8>>,
    uploaded: Vec<String>,
    attempts: HashMap<String, u32>,
}

#[derive(Default)]
pub struct FakeDrive {
    state: Mutex<DriveState>,
}

impl FakeDrive {
    pub fn insert(&self, key: &str, bytes: Vec<u8>) {
        lock(&self.state).objects.insert(key.to_string(), bytes);
    }

    pub fn uploaded(&self) -> Vec<String> {
        lock(&self.state).uploaded.clone()
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        lock(&self.state).objects.get(key).cloned()
    }

    pub fn download_attempts(&self, key: &str) -> u32 {
        lock(&self.state).attempts.get(key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl BlobStore for FakeDrive {
    async fn get_to_file(&self, key: &str, dest: &Path) -> Result<(), DriveError> {
        let bytes = {
            let mut state = lock(&self.state);
            *state.attempts.entry(key.to_string()).or_default() += 1;
            state.objects.get(key).cloned()
        };
        match bytes {
            Some(bytes) => Ok(tokio::fs::write(dest, bytes).await?),
            None => Err(DriveError::Download {
                key: key.to_string(),
                reason: "NoSuchKey".to_string(),
            }),
        }
    }

    async fn put_from_file(&self, key: &str, src: &Path) -> Result<(), DriveError> {
        let bytes = tokio::fs::read(src).await?;
        let mut state = lock(&self.state);
        state.objects.insert(key.to_string(), bytes);
        state.uploaded.push(key.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct StoreState {
    counters: HashMap<(String, String), i64>,
    committed: Vec<StagedDocument>,
    commits: usize,
}

#[derive(Default)]
pub struct FakeStore {
    state: Mutex<StoreState>,
}

impl FakeStore {
    pub fn counter(&self, collection: &str, document_id: &str) -> i64 {
        lock(&self.state)
            .counters
            .get(&(collection.to_string(), document_id.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn committed(&self) -> Vec<StagedDocument> {
        lock(&self.state).committed.clone()
    }

    pub fn commits(&self) -> usize {
        lock(&self.state).commits
    }
}

#[async_trait]
impl DocumentStore for FakeStore {
    async fn increment(
        &self,
        collection: &str,
        document_id: &str,
        field: &str,
        delta: i64,
    ) -> Result<(), DatastoreError> {
        log::debug!("increment {collection}/{document_id}.{field} by {delta}");
        *lock(&self.state)
            .counters
            .entry((collection.to_string(), document_id.to_string()))
            .or_default() += delta;
        Ok(())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), DatastoreError> {
        let mut state = lock(&self.state);
        state.commits += 1;
        state.committed.extend(batch.documents().iter().cloned());
        Ok(())
    }
}
