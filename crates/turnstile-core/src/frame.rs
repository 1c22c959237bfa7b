//! Frame decoding and the 3:4 portrait policy.

use image::imageops::{self, FilterType};
use image::{ImageFormat, RgbImage};
use std::io::Cursor;
use thiserror::Error;

const REFERENCE_JPEG_QUALITY: u8 = 90;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("image dimensions are zero")]
    ZeroDimensions,
    #[error("failed to encode image: {0}")]
    Encode(String),
}

/// Decode encoded image bytes (JPEG, PNG, ...) into an RGB frame.
pub fn decode_frame(bytes: &[u8]) -> Result<RgbImage, FrameError> {
    let img = image::load_from_memory(bytes)?.to_rgb8();
    if img.width() == 0 || img.height() == 0 {
        return Err(FrameError::ZeroDimensions);
    }
    Ok(img)
}

/// Exact width:height == 3:4 test.
pub fn is_portrait_3_4(width: u32, height: u32) -> bool {
    height > 0 && u64::from(width) * 4 == u64::from(height) * 3
}

/// Resize the width to `height * 3 / 4` (rounded down) when the frame is not 3:4.
///
/// Heights not divisible by 4 cannot reach an exact 3:4 ratio; such frames
/// still fail the liveness gate afterwards.
pub fn conform_aspect(image: RgbImage) -> RgbImage {
    if is_portrait_3_4(image.width(), image.height()) {
        return image;
    }
    let new_width = (u64::from(image.height()) * 3 / 4) as u32;
    if new_width == 0 {
        return image;
    }
    tracing::debug!(
        from = image.width(),
        to = new_width,
        height = image.height(),
        "resizing frame width to 3:4"
    );
    imageops::resize(&image, new_width, image.height(), FilterType::Triangle)
}

/// Encode a frame as JPEG for storage alongside an enrollment.
pub fn encode_reference_jpeg(image: &RgbImage) -> Result<Vec<u8>, FrameError> {
    let mut buf = Cursor::new(Vec::new());
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, REFERENCE_JPEG_QUALITY);
    image
        .write_with_encoder(encoder)
        .map_err(|e| FrameError::Encode(e.to_string()))?;
    Ok(buf.into_inner())
}

/// Encode as PNG. Used where byte-exact round trips matter.
pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>, FrameError> {
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, ImageFormat::Png)
        .map_err(|e| FrameError::Encode(e.to_string()))?;
    Ok(buf.into_inner())
}
