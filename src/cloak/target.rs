//! Pseudo-identity target selection over the embedding gallery.

use super::error::CloakError;
use super::geometry::resize_bilinear;
use super::image_io::{imagenet_preprocess, load_plain};
use crate::models::{ImageTensor, CANONICAL_SIDE};
use flate2::read::GzDecoder;
use log::{debug, info, warn};
use rand::seq::{IndexedRandom, SliceRandom};
use rand::Rng;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// Identities that are never selectable as a target.
pub const EXCLUDED_IDENTITIES: [u32; 200] = [
    1691, 19236, 20552, 9231, 18221, 8250, 18785, 6989, 17170, 1704,
    19394, 6058, 3327, 11885, 20375, 19150, 676, 11663, 17261, 3527,
    3956, 1973, 1197, 4859, 590, 13873, 928, 14397, 4288, 3393,
    6975, 16988, 1269, 323, 6409, 588, 19738, 1845, 12123, 2714,
    5318, 15325, 19268, 4650, 4714, 3953, 6715, 6015, 12668, 13933,
    14306, 2768, 20597, 4578, 1278, 17549, 19355, 8882, 3276, 9148,
    14517, 14915, 18209, 3162, 8615, 18647, 749, 19259, 11490, 16046,
    13259, 4429, 10705, 12258, 13699, 4323, 15112, 14170, 3520, 17180,
    5195, 728, 2680, 13117, 20241, 15320, 8079, 2894, 11533, 10083,
    9628, 14944, 13124, 13316, 8006, 15353, 15261, 8865, 1213, 1469,
    20777, 9868, 10972, 9058, 18890, 13178, 13772, 15675, 10572, 8771,
    14211, 18781, 16347, 17985, 11456, 5849, 15709, 20856, 2590, 15964,
    8377, 5465, 16928, 13063, 19766, 19643, 8651, 8517, 5985, 14817,
    18926, 3791, 1864, 20061, 7697, 13449, 19525, 13131, 421, 7629,
    14689, 17521, 4509, 19374, 17584, 11055, 11929, 17117, 7492, 14182,
    409, 14294, 15033, 10074, 9081, 7682, 19306, 3674, 945, 13211,
    10933, 17953, 12729, 8087, 20723, 5396, 14015, 20110, 15186, 6939,
    239, 2393, 17326, 13712, 9921, 7997, 6215, 14582, 864, 18906,
    9351, 9178, 3600, 18567, 8614, 19429, 286, 10042, 13030, 7076,
    3370, 15285, 7925, 10851, 5155, 14732, 12051, 11334, 17035, 15476,
];

/// Leading ranks of the farthest-first list that are never chosen.
pub const RESERVED_RANKS: usize = 10;
/// Width of the rank window the target is sampled from.
pub const CANDIDATE_RANKS: usize = 20;

#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub id: u32,
    pub embedding: Vec<f32>,
    pub exemplar_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
    excluded: HashSet<u32>,
}

impl Gallery {
    pub fn from_entries(entries: Vec<GalleryEntry>, excluded: impl IntoIterator<Item = u32>) -> Self {
        Self {
            entries,
            excluded: excluded.into_iter().collect(),
        }
    }

    /// Reads `<model_dir>/<name>_emb.json.gz` for every extractor and
    /// concatenates the per-extractor vectors of each identity.
    pub fn load(model_dir: &Path, extractor_names: &[String]) -> Result<Self, CloakError> {
        let mut tables = Vec::with_capacity(extractor_names.len());
        for name in extractor_names {
            let path = model_dir.join(format!("{name}_emb.json.gz"));
            let file = std::fs::File::open(&path).map_err(|e| {
                CloakError::GalleryUnavailable(format!("{}: {e}", path.display()))
            })?;
            let table: BTreeMap<String, Vec<f32>> = serde_json::from_reader(GzDecoder::new(file))
                .map_err(|e| CloakError::GalleryUnavailable(format!("{}: {e}", path.display())))?;
            tables.push(table);
        }

        let Some((first, rest)) = tables.split_first() else {
            return Err(CloakError::GalleryUnavailable(
                "no feature extractors configured".to_string(),
            ));
        };

        let target_root = model_dir.join("target_data");
        let mut entries = Vec::with_capacity(first.len());
        for (key, head) in first {
            let Ok(id) = key.parse::<u32>() else {
                warn!("Skipping gallery key {key:?}: not an identity id");
                continue;
            };
            let mut embedding = head.clone();
            let mut complete = true;
            for table in rest {
                match table.get(key) {
                    Some(part) => embedding.extend_from_slice(part),
                    None => complete = false,
                }
            }
            if !complete {
                warn!("Skipping identity {id}: missing from some extractor tables");
                continue;
            }
            entries.push(GalleryEntry {
                id,
                embedding,
                exemplar_dir: target_root.join(id.to_string()),
            });
        }
        entries.sort_by_key(|e| e.id);

        info!("Loaded gallery with {} identities", entries.len());
        Ok(Self::from_entries(entries, EXCLUDED_IDENTITIES))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_excluded(&self, id: u32) -> bool {
        self.excluded.contains(&id)
    }

    /// Entries that may be chosen as a target.
    pub fn selectable(&self) -> impl Iterator<Item = &GalleryEntry> {
        self.entries.iter().filter(|e| !self.excluded.contains(&e.id))
    }
}

pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Full `inputs x gallery` distance matrix.
pub fn pairwise_l2(inputs: &[Vec<f32>], gallery: &[&GalleryEntry]) -> Vec<Vec<f32>> {
    inputs
        .iter()
        .map(|a| gallery.iter().map(|g| l2_distance(a, &g.embedding)).collect())
        .collect()
}

/// Selectable identities ordered farthest first by their closest-approach
/// distance to any of `embeddings`. Ties keep ascending id order.
pub fn rank_farthest_first(embeddings: &[Vec<f32>], gallery: &Gallery) -> Vec<(u32, f32)> {
    let candidates: Vec<&GalleryEntry> = gallery.selectable().collect();
    let distances = pairwise_l2(embeddings, &candidates);

    let mut ranked: Vec<(u32, f32)> = candidates
        .iter()
        .enumerate()
        .map(|(j, entry)| {
            let closest = distances
                .iter()
                .map(|row| row[j])
                .fold(f32::INFINITY, f32::min);
            (entry.id, closest)
        })
        .collect();

    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    ranked
}

/// Target images for one selection: one preprocessed exemplar per slot.
#[derive(Debug, Clone)]
pub struct TargetBatch {
    pub identity: u32,
    pub images: Vec<ImageTensor>,
}

impl TargetBatch {
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

pub struct TargetSelector<'g> {
    gallery: &'g Gallery,
}

impl<'g> TargetSelector<'g> {
    pub fn new(gallery: &'g Gallery) -> Self {
        Self { gallery }
    }

    /// Picks one identity uniformly from ranks `10..30` of the farthest-first
    /// ordering.
    pub fn choose_identity<R: Rng + ?Sized>(
        &self,
        embeddings: &[Vec<f32>],
        rng: &mut R,
    ) -> Result<&'g GalleryEntry, CloakError> {
        let ranked = rank_farthest_first(embeddings, self.gallery);
        let start = RESERVED_RANKS.min(ranked.len());
        let end = (RESERVED_RANKS + CANDIDATE_RANKS).min(ranked.len());

        let (id, score) = ranked[start..end].choose(rng).copied().ok_or_else(|| {
            CloakError::GalleryUnavailable(format!(
                "only {} selectable identities, need more than {RESERVED_RANKS}",
                ranked.len()
            ))
        })?;
        debug!("Selected target identity {id} (closest approach {score:.4})");

        self.gallery
            .selectable()
            .find(|e| e.id == id)
            .ok_or_else(|| CloakError::GalleryUnavailable(format!("identity {id} vanished")))
    }

    /// Chooses an identity for `embeddings` and returns exactly
    /// `embeddings.len()` of its exemplars.
    pub fn select_target<R: Rng + ?Sized>(
        &self,
        embeddings: &[Vec<f32>],
        rng: &mut R,
    ) -> Result<TargetBatch, CloakError> {
        let entry = self.choose_identity(embeddings, rng)?;
        let exemplars = load_exemplars(&entry.exemplar_dir)?;
        Ok(TargetBatch {
            identity: entry.id,
            images: sample_cyclic(&exemplars, embeddings.len(), rng),
        })
    }
}

/// Repeats `items` until at least `n` are available, then draws `n`
/// without replacement.
pub fn sample_cyclic<T: Clone, R: Rng + ?Sized>(items: &[T], n: usize, rng: &mut R) -> Vec<T> {
    if items.is_empty() {
        return Vec::new();
    }
    let copies = n.div_ceil(items.len()).max(1);
    let mut pool: Vec<usize> = (0..items.len()).cycle().take(items.len() * copies).collect();
    pool.shuffle(rng);
    pool.truncate(n);
    pool.into_iter().map(|i| items[i].clone()).collect()
}

/// Loads every exemplar image of an identity, resized and preprocessed.
pub fn load_exemplars(dir: &Path) -> Result<Vec<ImageTensor>, CloakError> {
    let listing = std::fs::read_dir(dir)
        .map_err(|e| CloakError::GalleryUnavailable(format!("{}: {e}", dir.display())))?;

    let mut paths: Vec<PathBuf> = listing
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| matches!(ext.to_lowercase().as_str(), "jpg" | "jpeg" | "png"))
        })
        .collect();
    paths.sort();

    let exemplars: Vec<ImageTensor> = paths
        .iter()
        .filter_map(|p| match load_plain(p) {
            Ok(img) => Some(imagenet_preprocess(&resize_bilinear(
                &img,
                CANONICAL_SIDE,
                CANONICAL_SIDE,
            ))),
            Err(e) => {
                warn!("Unreadable exemplar: {e}");
                None
            }
        })
        .collect();

    if exemplars.is_empty() {
        return Err(CloakError::GalleryUnavailable(format!(
            "no readable exemplars in {}",
            dir.display()
        )));
    }
    Ok(exemplars)
}
