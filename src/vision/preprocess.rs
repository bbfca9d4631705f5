//! Image preprocessing for the OCR models
//!
//! Handles cropping, resizing, normalization and tensor conversion for the
//! detector and recognizer networks.

use image::{imageops, imageops::FilterType, RgbImage};
use ndarray::{Array3, Array4, Axis};
use serde::{Deserialize, Serialize};

use super::Detection;
use crate::config::RecognitionSettings;

/// Per-channel normalization applied to 0-1 pixel values
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    /// Mean values [R, G, B]
    pub mean: [f32; 3],
    /// Std values [R, G, B]
    pub std: [f32; 3],
}

impl Default for Normalization {
    fn default() -> Self {
        // Plain 0-1 scaling
        Self {
            mean: [0.0, 0.0, 0.0],
            std: [1.0, 1.0, 1.0],
        }
    }
}

/// Convert an RGB image to an HWC f32 array scaled to 0-1
pub fn rgb_to_f32(image: &RgbImage) -> Array3<f32> {
    let (width, height) = image.dimensions();
    Array3::from_shape_fn((height as usize, width as usize, 3), |(y, x, c)| {
        image.get_pixel(x as u32, y as u32).0[c] as f32 / 255.0
    })
}

/// Normalize an HWC array in place with per-channel mean and std
pub fn normalize(image: &mut Array3<f32>, norm: &Normalization) {
    for (c, mut channel) in image.axis_iter_mut(Axis(2)).enumerate() {
        let std = if norm.std[c].abs() < f32::EPSILON { 1.0 } else { norm.std[c] };
        channel.mapv_inplace(|v| (v - norm.mean[c]) / std);
    }
}

/// Convert HWC image to NCHW tensor (batch size 1)
pub fn hwc_to_nchw(image: Array3<f32>) -> Array4<f32> {
    image
        .permuted_axes([2, 0, 1])
        .insert_axis(Axis(0))
        .as_standard_layout()
        .into_owned()
}

/// Full conversion: RGB image to a normalized NCHW tensor
pub fn image_to_tensor(image: &RgbImage, norm: &Normalization) -> Array4<f32> {
    let mut hwc = rgb_to_f32(image);
    normalize(&mut hwc, norm);
    hwc_to_nchw(hwc)
}

/// Crop a detection's box from the image, rounded outward to whole pixels
///
/// Returns `None` when the box does not cover at least one pixel.
pub fn crop_detection(image: &RgbImage, detection: &Detection) -> Option<RgbImage> {
    let (img_w, img_h) = image.dimensions();

    let x1 = (detection.x.floor().max(0.0) as u32).min(img_w);
    let y1 = (detection.y.floor().max(0.0) as u32).min(img_h);
    let x2 = (detection.right().ceil().max(0.0) as u32).min(img_w);
    let y2 = (detection.bottom().ceil().max(0.0) as u32).min(img_h);

    if x2 <= x1 || y2 <= y1 {
        return None;
    }

    Some(imageops::crop_imm(image, x1, y1, x2 - x1, y2 - y1).to_image())
}

/// Rotate tall crops a quarter turn counter-clockwise and resize to the
/// recognizer's fixed input size
pub fn prepare_line_image(crop: &RgbImage, settings: &RecognitionSettings) -> RgbImage {
    let (w, h) = crop.dimensions();
    let line = if settings.rotate_vertical && h > w {
        imageops::rotate270(crop)
    } else {
        crop.clone()
    };

    imageops::resize(
        &line,
        settings.input_width.max(1),
        settings.input_height.max(1),
        FilterType::Triangle,
    )
}

/// Full preprocessing pipeline for recognition of one region
pub fn preprocess_for_recognition(
    image: &RgbImage,
    detection: &Detection,
    settings: &RecognitionSettings,
) -> Option<Array4<f32>> {
    let crop = crop_detection(image, detection)?;
    let line = prepare_line_image(&crop, settings);
    Some(image_to_tensor(&line, &settings.normalization))
}
