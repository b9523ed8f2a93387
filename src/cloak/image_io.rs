//! Photo decoding, orientation normalization, ImageNet preprocessing and
//! output encoding.

use super::error::CloakError;
use crate::models::ImageTensor;
use image::{DynamicImage, ImageFormat, RgbImage};
use log::{info, warn};
use std::path::{Path, PathBuf};

/// Per-channel means subtracted in BGR order.
pub const IMAGENET_MEAN_BGR: [f32; 3] = [103.939, 116.779, 123.68];

/// A decoded input photo. Pixels are RGB in `0.0..=255.0`, already rotated
/// upright, and never mutated after load.
#[derive(Debug, Clone)]
pub struct Photo {
    pub id: String,
    pub path: PathBuf,
    pub pixels: ImageTensor,
}

impl Photo {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>, pixels: ImageTensor) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            pixels,
        }
    }

    pub fn height(&self) -> usize {
        self.pixels.dim().0
    }

    pub fn width(&self) -> usize {
        self.pixels.dim().1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Orientation {
    Normal,
    CW90,
    CW180,
    CW270,
}

impl From<u32> for Orientation {
    fn from(value: u32) -> Self {
        match value {
            3 => Self::CW180,
            6 => Self::CW90,
            8 => Self::CW270,
            _ => Self::Normal,
        }
    }
}

impl Orientation {
    fn from_bytes(bytes: &[u8]) -> Self {
        let mut cursor = std::io::Cursor::new(bytes);
        let Ok(reader) = exif::Reader::new().read_from_container(&mut cursor) else {
            return Self::Normal;
        };
        reader
            .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
            .and_then(|field| field.value.get_uint(0))
            .map(Into::into)
            .unwrap_or(Self::Normal)
    }

    fn correct(self, img: DynamicImage) -> DynamicImage {
        match self {
            Self::Normal => img,
            Self::CW90 => img.rotate90(),
            Self::CW180 => img.rotate180(),
            Self::CW270 => img.rotate270(),
        }
    }
}

pub fn tensor_from_rgb(img: &RgbImage) -> ImageTensor {
    let (w, h) = img.dimensions();
    ImageTensor::from_shape_fn((h as usize, w as usize, 3), |(y, x, c)| {
        img.get_pixel(x as u32, y as u32)[c] as f32
    })
}

/// Rounds and clamps to `0..=255`.
pub fn rgb_from_tensor(tensor: &ImageTensor) -> RgbImage {
    let (h, w, _) = tensor.dim();
    RgbImage::from_fn(w as u32, h as u32, |x, y| {
        let px = |c: usize| tensor[[y as usize, x as usize, c]].round().clamp(0.0, 255.0) as u8;
        image::Rgb([px(0), px(1), px(2)])
    })
}

fn invalid(path: &Path, reason: impl ToString) -> CloakError {
    CloakError::InvalidImage {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Loads a photo, rotating it upright according to its EXIF orientation.
pub fn load_photo(path: &Path) -> Result<Photo, CloakError> {
    if path.is_dir() {
        return Err(invalid(path, "is a directory"));
    }
    let bytes = std::fs::read(path).map_err(|e| invalid(path, e))?;
    let img = image::load_from_memory(&bytes).map_err(|e| invalid(path, e))?;
    let img = Orientation::from_bytes(&bytes).correct(img);

    let id = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(Photo::new(id, path, tensor_from_rgb(&img.to_rgb8())))
}

/// Loads an image without orientation handling, as used for gallery exemplars.
pub fn load_plain(path: &Path) -> Result<ImageTensor, CloakError> {
    let img = image::open(path).map_err(|e| invalid(path, e))?;
    Ok(tensor_from_rgb(&img.to_rgb8()))
}

/// Decodes every path, dropping the ones that are not images.
pub fn filter_image_paths(paths: &[PathBuf]) -> Vec<Photo> {
    info!("Identifying images among {} file(s)", paths.len());
    let photos: Vec<Photo> = paths
        .iter()
        .filter_map(|p| match load_photo(p) {
            Ok(photo) => Some(photo),
            Err(e) => {
                warn!("{e}, skipped");
                None
            }
        })
        .collect();
    info!("Identified {} image(s) in the batch", photos.len());
    photos
}

/// RGB pixels to BGR mean-centred model input.
pub fn imagenet_preprocess(x: &ImageTensor) -> ImageTensor {
    let (h, w, _) = x.dim();
    ImageTensor::from_shape_fn((h, w, 3), |(y, col, c)| {
        x[[y, col, 2 - c]] - IMAGENET_MEAN_BGR[c]
    })
}

/// Inverse of [`imagenet_preprocess`].
pub fn imagenet_reverse(x: &ImageTensor) -> ImageTensor {
    let (h, w, _) = x.dim();
    ImageTensor::from_shape_fn((h, w, 3), |(y, col, c)| {
        x[[y, col, 2 - c]] + IMAGENET_MEAN_BGR[2 - c]
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Png,
    #[serde(alias = "jpg")]
    Jpeg,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpeg",
        }
    }

    fn image_format(&self) -> ImageFormat {
        match self {
            Self::Png => ImageFormat::Png,
            Self::Jpeg => ImageFormat::Jpeg,
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = CloakError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "png" => Ok(Self::Png),
            "jpg" | "jpeg" => Ok(Self::Jpeg),
            other => Err(CloakError::UnknownFormat(other.to_string())),
        }
    }
}

pub fn dump_image(tensor: &ImageTensor, path: &Path, format: OutputFormat) -> Result<(), CloakError> {
    rgb_from_tensor(tensor).save_with_format(path, format.image_format())?;
    Ok(())
}
