//! Face geometry: margin-expanded crops, canonical square crops and the
//! inverse mapping of perturbations back into source photos.
//!
//! Canonicalization pads a crop into a square anchored at the top-left
//! corner before resizing. [`merge_back`] relies on the same anchor: it
//! resizes a perturbation to the square side and keeps only the top-left
//! `height x width` region. Both directions live here so they cannot drift
//! apart.

use super::image_io::Photo;
use crate::models::{BoundingBox, FaceDetection, FaceLandmarks, ImageTensor, CANONICAL_SIDE};
use log::{debug, warn};
use ndarray::s;

/// Margin-expanded face box in integer pixel coordinates. `right` and
/// `bottom` are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelBox {
    pub left: usize,
    pub top: usize,
    pub right: usize,
    pub bottom: usize,
}

impl PixelBox {
    /// Expands `bbox` by `margin * width / 2` on each horizontal side and
    /// `margin * height / 2` on each vertical side, clamped to the photo.
    pub fn expanded(bbox: &BoundingBox, margin: f32, photo_width: usize, photo_height: usize) -> Self {
        let pad_x = bbox.width * margin / 2.0;
        let pad_y = bbox.height * margin / 2.0;

        let left = (bbox.x - pad_x).max(0.0) as usize;
        let top = (bbox.y - pad_y).max(0.0) as usize;
        let right = ((bbox.x + bbox.width + pad_x).max(0.0) as usize).min(photo_width);
        let bottom = ((bbox.y + bbox.height + pad_y).max(0.0) as usize).min(photo_height);

        Self {
            left: left.min(right),
            top: top.min(bottom),
            right,
            bottom,
        }
    }

    pub fn width(&self) -> usize {
        self.right - self.left
    }

    pub fn height(&self) -> usize {
        self.bottom - self.top
    }

    /// Side of the square the crop is padded into.
    pub fn side(&self) -> usize {
        self.width().max(self.height())
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    pub fn intersects(&self, other: &PixelBox) -> bool {
        self.left < other.right
            && other.left < self.right
            && self.top < other.bottom
            && other.top < self.bottom
    }
}

/// One face of one photo, ready for the optimizer.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    /// Index of the owning photo within the batch.
    pub photo_index: usize,
    /// Position in detector output order within that photo.
    pub face_index: usize,
    pub bbox: PixelBox,
    pub landmarks: Option<FaceLandmarks>,
    /// Canonical `224 x 224 x 3` RGB crop.
    pub canonical: ImageTensor,
}

/// Per-photo outcome of face detection.
#[derive(Debug, Clone)]
pub enum FaceScan {
    Faces(Vec<DetectedFace>),
    NoFace,
}

impl FaceScan {
    pub fn faces(&self) -> &[DetectedFace] {
        match self {
            Self::Faces(faces) => faces,
            Self::NoFace => &[],
        }
    }
}

/// Bilinear resize with half-pixel centres and edge clamping.
pub fn resize_bilinear(src: &ImageTensor, out_h: usize, out_w: usize) -> ImageTensor {
    let (in_h, in_w, channels) = src.dim();
    let mut out = ImageTensor::zeros((out_h, out_w, channels));
    if in_h == 0 || in_w == 0 || out_h == 0 || out_w == 0 {
        return out;
    }

    let scale_y = in_h as f32 / out_h as f32;
    let scale_x = in_w as f32 / out_w as f32;

    let sample = |pos: usize, scale: f32, len: usize| -> (usize, usize, f32) {
        let f = ((pos as f32 + 0.5) * scale - 0.5).clamp(0.0, (len - 1) as f32);
        let i0 = f.floor() as usize;
        let i1 = (i0 + 1).min(len - 1);
        (i0, i1, f - i0 as f32)
    };

    for y in 0..out_h {
        let (y0, y1, wy) = sample(y, scale_y, in_h);
        for x in 0..out_w {
            let (x0, x1, wx) = sample(x, scale_x, in_w);
            for c in 0..channels {
                let top = src[[y0, x0, c]] * (1.0 - wx) + src[[y0, x1, c]] * wx;
                let bottom = src[[y1, x0, c]] * (1.0 - wx) + src[[y1, x1, c]] * wx;
                out[[y, x, c]] = top * (1.0 - wy) + bottom * wy;
            }
        }
    }

    out
}

/// Pads `crop` into a square of side `max(h, w)` anchored at the top-left
/// origin, then resizes to the canonical side.
pub fn canonicalize(crop: &ImageTensor) -> ImageTensor {
    let (h, w, channels) = crop.dim();
    let side = h.max(w);
    let mut square = ImageTensor::zeros((side, side, channels));
    square.slice_mut(s![0..h, 0..w, ..]).assign(crop);
    resize_bilinear(&square, CANONICAL_SIDE, CANONICAL_SIDE)
}

/// Inverse of [`canonicalize`] for a perturbation: back to the square side,
/// then the top-left `bbox.height() x bbox.width()` region.
pub fn uncanonicalize(perturbation: &ImageTensor, bbox: &PixelBox) -> ImageTensor {
    let side = bbox.side();
    let square = resize_bilinear(perturbation, side, side);
    square
        .slice(s![0..bbox.height(), 0..bbox.width(), ..])
        .to_owned()
}

/// Crops every detection out of `photo` with the margin-expanded box and
/// canonicalizes it. Detections that clamp to an empty box are dropped.
pub fn crop(
    photo: &Photo,
    photo_index: usize,
    detections: &[FaceDetection],
    margin: f32,
) -> Vec<DetectedFace> {
    let (height, width) = (photo.height(), photo.width());

    let faces: Vec<DetectedFace> = detections
        .iter()
        .map(|d| (d, PixelBox::expanded(&d.bbox, margin, width, height)))
        .filter(|(_, bbox)| {
            if bbox.is_empty() {
                debug!("Dropping empty face box in {}", photo.id);
            }
            !bbox.is_empty()
        })
        .enumerate()
        .map(|(face_index, (detection, bbox))| {
            let region = photo
                .pixels
                .slice(s![bbox.top..bbox.bottom, bbox.left..bbox.right, ..])
                .to_owned();
            DetectedFace {
                photo_index,
                face_index,
                bbox,
                landmarks: detection.landmarks.clone(),
                canonical: canonicalize(&region),
            }
        })
        .collect();

    for (i, a) in faces.iter().enumerate() {
        if faces[i + 1..].iter().any(|b| a.bbox.intersects(&b.bbox)) {
            warn!(
                "Overlapping face boxes in {}; merged result is unspecified",
                photo.id
            );
            break;
        }
    }

    faces
}

/// Tags a photo's crops as found or not found.
pub fn scan(photo: &Photo, photo_index: usize, detections: &[FaceDetection], margin: f32) -> FaceScan {
    let faces = crop(photo, photo_index, detections, margin);
    if faces.is_empty() {
        FaceScan::NoFace
    } else {
        FaceScan::Faces(faces)
    }
}

/// Adds each perturbation into the photo at its face box. Pixels outside
/// every box are copied unchanged.
pub fn merge_back<'a>(
    photo: &Photo,
    faces: impl IntoIterator<Item = (&'a DetectedFace, &'a ImageTensor)>,
) -> ImageTensor {
    let mut cloaked = photo.pixels.clone();

    for (face, perturbation) in faces {
        let bbox = &face.bbox;
        let delta = uncanonicalize(perturbation, bbox);
        let mut region = cloaked.slice_mut(s![bbox.top..bbox.bottom, bbox.left..bbox.right, ..]);
        region += &delta;
    }

    cloaked
}
