//! Fixed-size face patches for the anti-spoof models.
//!
//! Each model sees the face at its own context scale: the detected box is
//! expanded around its center, pushed back inside the frame, and the region is
//! resized to the model input with bilinear interpolation.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use thiserror::Error;

/// Resampling filter for every patch. Bilinear keeps model inputs reproducible.
const PATCH_FILTER: FilterType = FilterType::Triangle;

/// A model-sized patch, produced per classification call.
pub type Crop = RgbImage;

#[derive(Error, Debug, PartialEq)]
pub enum CropError {
    #[error("crop region degenerates to zero area for box {bbox:?} in {image_width}x{image_height} frame")]
    Degenerate {
        bbox: BoundingBox,
        image_width: u32,
        image_height: u32,
    },
    #[error("output size must be non-zero, got {0}x{1}")]
    InvalidOutputSize(u32, u32),
}

/// Inclusive pixel rectangle inside the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Region {
    left: u32,
    top: u32,
    right: u32,
    bottom: u32,
}

impl Region {
    fn width(&self) -> u32 {
        self.right - self.left + 1
    }

    fn height(&self) -> u32 {
        self.bottom - self.top + 1
    }
}

/// Stateless patch producer.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatchCropper;

impl PatchCropper {
    /// Produce an `out_w × out_h` patch of `image` around `bbox`.
    ///
    /// With `do_crop` and a scale, the box is expanded by `scale` around its
    /// center before cropping; otherwise the raw box region is resized.
    pub fn crop(
        &self,
        image: &RgbImage,
        bbox: &BoundingBox,
        scale: Option<f32>,
        out_w: u32,
        out_h: u32,
        do_crop: bool,
    ) -> Result<Crop, CropError> {
        if out_w == 0 || out_h == 0 {
            return Err(CropError::InvalidOutputSize(out_w, out_h));
        }

        let degenerate = || CropError::Degenerate {
            bbox: *bbox,
            image_width: image.width(),
            image_height: image.height(),
        };

        // A box that misses the frame entirely has nothing to expand from.
        let raw = clamp_to_frame(
            bbox.x as f32,
            bbox.y as f32,
            (bbox.x + bbox.width - 1) as f32,
            (bbox.y + bbox.height - 1) as f32,
            image.width(),
            image.height(),
        )
        .ok_or_else(degenerate)?;

        let region = match scale {
            Some(s) if do_crop => {
                expanded_region(bbox, s, image.width(), image.height()).ok_or_else(degenerate)?
            }
            _ => raw,
        };

        let patch = imageops::crop_imm(image, region.left, region.top, region.width(), region.height())
            .to_image();
        Ok(imageops::resize(&patch, out_w, out_h, PATCH_FILTER))
    }
}

/// Expand `bbox` by `scale` around its center and shift it back inside the frame.
///
/// The scale is capped so the expanded box never exceeds the frame. A box
/// that overhangs an edge is translated, not shrunk.
fn expanded_region(bbox: &BoundingBox, scale: f32, src_w: u32, src_h: u32) -> Option<Region> {
    if !bbox.is_valid() || src_w == 0 || src_h == 0 {
        return None;
    }
    let box_w = bbox.width as f32;
    let box_h = bbox.height as f32;
    let max_x = (src_w - 1) as f32;
    let max_y = (src_h - 1) as f32;

    let scale = scale.min(max_y / box_h).min(max_x / box_w);
    let new_w = box_w * scale;
    let new_h = box_h * scale;
    let center_x = bbox.x as f32 + box_w / 2.0;
    let center_y = bbox.y as f32 + box_h / 2.0;

    let mut left = center_x - new_w / 2.0;
    let mut top = center_y - new_h / 2.0;
    let mut right = center_x + new_w / 2.0;
    let mut bottom = center_y + new_h / 2.0;

    if left < 0.0 {
        right -= left;
        left = 0.0;
    }
    if top < 0.0 {
        bottom -= top;
        top = 0.0;
    }
    if right > max_x {
        left -= right - max_x;
        right = max_x;
    }
    if bottom > max_y {
        top -= bottom - max_y;
        bottom = max_y;
    }

    clamp_to_frame(
        left.trunc(),
        top.trunc(),
        right.trunc(),
        bottom.trunc(),
        src_w,
        src_h,
    )
}

/// Intersect an inclusive rectangle with the frame. `None` when empty.
fn clamp_to_frame(
    left: f32,
    top: f32,
    right: f32,
    bottom: f32,
    src_w: u32,
    src_h: u32,
) -> Option<Region> {
    if src_w == 0 || src_h == 0 {
        return None;
    }
    let max_x = (src_w - 1) as f32;
    let max_y = (src_h - 1) as f32;
    let l = left.max(0.0);
    let t = top.max(0.0);
    let r = right.min(max_x);
    let b = bottom.min(max_y);
    if r < l || b < t {
        return None;
    }
    Some(Region {
        left: l as u32,
        top: t as u32,
        right: r as u32,
        bottom: b as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn gradient(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8]))
    }

    #[test]
    fn test_output_dimensions() {
        let img = gradient(300, 400);
        let bbox = BoundingBox::new(100, 120, 80, 100);
        let crop = PatchCropper.crop(&img, &bbox, Some(2.7), 80, 60, true).unwrap();
        assert_eq!(crop.dimensions(), (80, 60));
    }

    #[test]
    fn test_crop_is_deterministic() {
        let img = gradient(300, 400);
        let bbox = BoundingBox::new(90, 110, 70, 90);
        let a = PatchCropper.crop(&img, &bbox, Some(4.0), 80, 80, true).unwrap();
        let b = PatchCropper.crop(&img, &bbox, Some(4.0), 80, 80, true).unwrap();
        assert_eq!(a.dimensions(), b.dimensions());
        assert_eq!(a.as_raw(), b.as_raw());
    }

    #[test]
    fn test_unscaled_uses_raw_box() {
        // Box region exactly the output size: resize is an identity copy.
        let img = gradient(300, 400);
        let bbox = BoundingBox::new(10, 20, 40, 30);
        let crop = PatchCropper.crop(&img, &bbox, None, 40, 30, false).unwrap();
        assert_eq!(crop.get_pixel(0, 0), img.get_pixel(10, 20));
        assert_eq!(crop.get_pixel(39, 29), img.get_pixel(49, 49));
    }

    #[test]
    fn test_do_crop_false_ignores_scale() {
        let img = gradient(300, 400);
        let bbox = BoundingBox::new(10, 20, 40, 30);
        let with_scale = PatchCropper.crop(&img, &bbox, Some(2.0), 40, 30, false).unwrap();
        let without = PatchCropper.crop(&img, &bbox, None, 40, 30, false).unwrap();
        assert_eq!(with_scale.as_raw(), without.as_raw());
    }

    #[test]
    fn test_expanded_region_centered() {
        let bbox = BoundingBox::new(100, 100, 50, 50);
        let r = expanded_region(&bbox, 2.0, 400, 400).unwrap();
        // center (125, 125), 100x100 → [75, 175]
        assert_eq!((r.left, r.top, r.right, r.bottom), (75, 75, 175, 175));
    }

    #[test]
    fn test_expanded_region_shifted_inside_frame() {
        let bbox = BoundingBox::new(0, 0, 40, 40);
        let r = expanded_region(&bbox, 2.0, 300, 300).unwrap();
        // [-20, 60] shifted right by 20 → [0, 80]
        assert_eq!((r.left, r.top, r.right, r.bottom), (0, 0, 80, 80));
    }

    #[test]
    fn test_expanded_region_scale_capped_by_frame() {
        let bbox = BoundingBox::new(40, 40, 50, 50);
        let r = expanded_region(&bbox, 10.0, 120, 160).unwrap();
        assert_eq!(r.left, 0);
        assert_eq!(r.right, 119);
        assert!(r.bottom <= 159);
    }

    #[test]
    fn test_box_outside_frame_is_degenerate() {
        let img = gradient(100, 100);
        let bbox = BoundingBox::new(500, 500, 40, 40);
        for (scale, do_crop) in [(Some(2.7), true), (None, false)] {
            let err = PatchCropper.crop(&img, &bbox, scale, 80, 80, do_crop).unwrap_err();
            assert!(matches!(err, CropError::Degenerate { .. }));
        }
    }

    #[test]
    fn test_partially_outside_box_is_clamped() {
        let img = gradient(100, 100);
        let bbox = BoundingBox::new(80, 80, 40, 40);
        let crop = PatchCropper.crop(&img, &bbox, None, 20, 20, false).unwrap();
        assert_eq!(crop.dimensions(), (20, 20));
        assert_eq!(crop.get_pixel(0, 0), img.get_pixel(80, 80));
    }

    #[test]
    fn test_zero_output_size_rejected() {
        let img = gradient(100, 100);
        let bbox = BoundingBox::new(10, 10, 40, 40);
        assert_eq!(
            PatchCropper.crop(&img, &bbox, None, 0, 80, false).unwrap_err(),
            CropError::InvalidOutputSize(0, 80)
        );
    }
}
