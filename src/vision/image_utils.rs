// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Image decoding and normalization for vision inference

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, RgbImage};

use crate::api::errors::VisionError;

/// Pixel layout handed to the model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMode {
    Rgb8,
}

/// A decoded, normalized image owned by one pipeline invocation
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub color_mode: ColorMode,
    /// Row-major RGB8 pixels, `width * height * 3` bytes
    pub pixels: Vec<u8>,
    /// Format detected from the source bytes
    pub source_format: ImageFormat,
    /// Dimensions before normalization
    pub original_width: u32,
    pub original_height: u32,
}

impl DecodedImage {
    /// Longer of the two sides
    pub fn longest_side(&self) -> u32 {
        self.width.max(self.height)
    }

    pub fn was_resized(&self) -> bool {
        self.width != self.original_width || self.height != self.original_height
    }

    /// View the payload as an `RgbImage`
    pub fn to_rgb_image(&self) -> Option<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.pixels.clone())
    }
}

/// Detect image format from magic bytes
///
/// Only JPEG, PNG, GIF, BMP, WebP and TIFF are accepted.
pub fn detect_format(bytes: &[u8]) -> Result<ImageFormat, VisionError> {
    if bytes.len() < 4 {
        return Err(VisionError::UnsupportedFormat);
    }

    match bytes {
        // PNG: 89 50 4E 47 (0x89 P N G)
        [0x89, 0x50, 0x4E, 0x47, ..] => Ok(ImageFormat::Png),

        // JPEG: FF D8 FF
        [0xFF, 0xD8, 0xFF, ..] => Ok(ImageFormat::Jpeg),

        // WebP: RIFF .... WEBP
        [0x52, 0x49, 0x46, 0x46, _, _, _, _, 0x57, 0x45, 0x42, 0x50, ..] => Ok(ImageFormat::WebP),

        // GIF: GIF87a or GIF89a
        [0x47, 0x49, 0x46, 0x38, x, ..] if *x == 0x37 || *x == 0x39 => Ok(ImageFormat::Gif),

        // BMP: BM
        [0x42, 0x4D, ..] => Ok(ImageFormat::Bmp),

        // TIFF: II (little-endian) or MM (big-endian)
        [0x49, 0x49, 0x2A, 0x00, ..] | [0x4D, 0x4D, 0x00, 0x2A, ..] => Ok(ImageFormat::Tiff),

        _ => Err(VisionError::UnsupportedFormat),
    }
}

/// Target dimensions so the longer side is at most `max_dimension`
///
/// Aspect ratio is preserved and images are never upscaled.
pub fn fit_within(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max_dimension || longest == 0 {
        return (width, height);
    }

    let scale = max_dimension as f64 / longest as f64;
    let scaled = |side: u32| -> u32 {
        if side == longest {
            max_dimension
        } else {
            ((side as f64 * scale).round() as u32).clamp(1, max_dimension)
        }
    };
    (scaled(width), scaled(height))
}

/// Decode raw image bytes after checking the format whitelist
pub fn decode_image_bytes(bytes: &[u8]) -> Result<(DynamicImage, ImageFormat), VisionError> {
    if bytes.is_empty() {
        return Err(VisionError::UnsupportedFormat);
    }

    let format = detect_format(bytes)?;
    let img = image::load_from_memory_with_format(bytes, format).map_err(|e| {
        tracing::debug!("Image decode failed ({:?}): {}", format, e);
        VisionError::UnsupportedFormat
    })?;

    Ok((img, format))
}

/// Convert to RGB8 and shrink so the longer side fits `max_dimension`
pub fn normalize(img: DynamicImage, format: ImageFormat, max_dimension: u32) -> DecodedImage {
    let (original_width, original_height) = (img.width(), img.height());
    let (width, height) = fit_within(original_width, original_height, max_dimension);

    let img = if (width, height) != (original_width, original_height) {
        tracing::debug!(
            "Resizing image {}x{} -> {}x{}",
            original_width,
            original_height,
            width,
            height
        );
        img.resize_exact(width, height, FilterType::Triangle)
    } else {
        img
    };

    let rgb = img.to_rgb8();
    DecodedImage {
        width: rgb.width(),
        height: rgb.height(),
        color_mode: ColorMode::Rgb8,
        pixels: rgb.into_raw(),
        source_format: format,
        original_width,
        original_height,
    }
}

/// Decode and normalize in one step
pub fn decode_and_normalize(bytes: &[u8], max_dimension: u32) -> Result<DecodedImage, VisionError> {
    let (img, format) = decode_image_bytes(bytes)?;
    Ok(normalize(img, format, max_dimension))
}

/// Get the format extension as a string
pub fn format_to_extension(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Png => "png",
        ImageFormat::Jpeg => "jpg",
        ImageFormat::WebP => "webp",
        ImageFormat::Gif => "gif",
        ImageFormat::Bmp => "bmp",
        ImageFormat::Tiff => "tiff",
        _ => "unknown",
    }
}
