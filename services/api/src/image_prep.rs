//! Image preparation for the vision model.
//!
//! Uploads are decoded, flattened to RGB, bounded to a maximum side and
//! re-encoded as JPEG before being base64-encoded into the request payload.

use base64::{engine::general_purpose::STANDARD, Engine};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, GenericImageView, ImageReader};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur while preparing an image.
#[derive(Debug, Error)]
pub enum PrepError {
    #[error("Failed to decode image: {0}")]
    Decode(#[source] image::ImageError),

    #[error("Failed to encode image: {0}")]
    Encode(#[source] image::ImageError),
}

/// An image ready to embed in a vision request.
#[derive(Debug, Clone)]
pub struct PreparedImage {
    /// JPEG bytes after conversion and resizing
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl PreparedImage {
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.jpeg)
    }

    pub fn data_url(&self) -> String {
        format!("data:image/jpeg;base64,{}", self.to_base64())
    }
}

/// Decode, convert to RGB, bound the longer side to `max_side` and re-encode as JPEG.
pub fn prepare_for_vision(
    bytes: &[u8],
    max_side: u32,
    quality: u8,
) -> Result<PreparedImage, PrepError> {
    let mut image = image::load_from_memory(bytes).map_err(PrepError::Decode)?;

    if image.color() != ColorType::Rgb8 {
        image = DynamicImage::ImageRgb8(image.to_rgb8());
    }

    let (width, height) = image.dimensions();
    if width > max_side || height > max_side {
        // resize keeps the aspect ratio and fits inside the box
        image = image.resize(max_side, max_side, FilterType::Lanczos3);
    }

    let mut jpeg = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut jpeg, quality);
    image.write_with_encoder(encoder).map_err(PrepError::Encode)?;

    let (width, height) = image.dimensions();
    Ok(PreparedImage {
        jpeg,
        width,
        height,
    })
}

/// Dimensions from a file header, guessing the format from content.
pub fn dimensions_of_file(path: &Path) -> Option<(u32, u32)> {
    ImageReader::open(path)
        .ok()?
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}
