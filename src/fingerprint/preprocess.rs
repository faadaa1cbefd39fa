//! Image preprocessing ahead of fingerprinting.
//!
//! Query photos and catalog covers go through the same steps:
//! 1. Sniff the format and reject anything outside the allow-list
//! 2. Decode and convert to RGB
//! 3. Center-crop to a square on the shorter side
//!
//! Also derives the content digests used as cache keys and change markers.

use image::{DynamicImage, GenericImageView, ImageFormat};
use sha2::{Digest, Sha256};

/// Formats accepted for both uploads and catalog images
const SUPPORTED_FORMATS: [ImageFormat; 4] = [
    ImageFormat::Jpeg,
    ImageFormat::Png,
    ImageFormat::WebP,
    ImageFormat::Gif,
];

#[derive(Debug, thiserror::Error)]
pub enum PreprocessError {
    #[error("image is empty")]
    Empty,

    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("failed to decode image: {0}")]
    Decode(String),
}

/// Detect image format from bytes
pub fn detect_format(data: &[u8]) -> Option<ImageFormat> {
    image::guess_format(data).ok()
}

/// Decode raw bytes into an RGB image cropped to a centered square.
pub fn load_square(data: &[u8]) -> Result<DynamicImage, PreprocessError> {
    if data.is_empty() {
        return Err(PreprocessError::Empty);
    }

    let format = detect_format(data)
        .ok_or_else(|| PreprocessError::UnsupportedFormat("unknown".to_string()))?;

    if !SUPPORTED_FORMATS.contains(&format) {
        return Err(PreprocessError::UnsupportedFormat(format!("{format:?}")));
    }

    let img = image::load_from_memory_with_format(data, format)
        .map_err(|e| PreprocessError::Decode(e.to_string()))?;

    Ok(crop_to_square(DynamicImage::ImageRgb8(img.to_rgb8())))
}

/// Crop an image to a square on its shorter side, keeping the center.
pub fn crop_to_square(img: DynamicImage) -> DynamicImage {
    let (w, h) = img.dimensions();
    if w == h {
        return img;
    }

    let side = w.min(h);
    let x = (w - side) / 2;
    let y = (h - side) / 2;
    img.crop_imm(x, y, side, side)
}

/// Hex SHA-256 over the model id and the raw image bytes.
///
/// Byte-identical uploads map to the same digest; a different model never
/// shares a digest with the previous one.
pub fn query_digest(model_id: &str, data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(data);

    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Compute a hash of the image content for change detection.
/// Used to determine if a catalog item needs re-fingerprinting.
pub fn image_hash(data: &[u8]) -> u64 {
    let digest = Sha256::digest(data);
    let mut first = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(first)
}
