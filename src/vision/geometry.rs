//! Square-padding transform between image space and model-input space
//!
//! The detector takes a fixed-size square input. A page is first padded to a
//! square of side `max(width, height)` anchored at the origin, then uniformly
//! resized to the network side. Detector coordinates come back in that
//! resized-square space and are inverted through both steps.

use image::{imageops, imageops::FilterType, Rgb, RgbImage};
use ndarray::Array4;

use super::preprocess::{image_to_tensor, Normalization};

/// Parameters needed to invert the pad-then-resize mapping
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SquareTransform {
    /// Side of the padded square, in original pixels
    pub square_side: u32,
    /// Side of the network input
    pub input_side: u32,
}

impl SquareTransform {
    /// Transform for an image of the given size
    pub fn for_image(width: u32, height: u32, input_side: u32) -> Self {
        Self {
            square_side: width.max(height).max(1),
            input_side: input_side.max(1),
        }
    }

    /// Original pixels per model-input pixel
    pub fn scale(&self) -> f32 {
        self.square_side as f32 / self.input_side as f32
    }

    /// Map an image-space point into model-input space
    pub fn forward(&self, point: (f32, f32)) -> (f32, f32) {
        let s = self.input_side as f32 / self.square_side as f32;
        (point.0 * s, point.1 * s)
    }
}

/// Map a model-space point back to original-image pixels, clipped to
/// `[0, width] x [0, height]`
pub fn to_image_space(
    point: (f32, f32),
    transform: &SquareTransform,
    original_size: (u32, u32),
) -> (f32, f32) {
    let input = transform.input_side as f32;
    let square = transform.square_side as f32;

    let x = point.0 / input * square;
    let y = point.1 / input * square;

    (
        x.clamp(0.0, original_size.0 as f32),
        y.clamp(0.0, original_size.1 as f32),
    )
}

/// Pad to a square canvas (content anchored top-left) filled with `fill`
pub fn pad_to_square(image: &RgbImage, fill: u8) -> RgbImage {
    let (w, h) = image.dimensions();
    let side = w.max(h).max(1);
    if w == side && h == side {
        return image.clone();
    }

    let mut canvas = RgbImage::from_pixel(side, side, Rgb([fill, fill, fill]));
    imageops::replace(&mut canvas, image, 0, 0);
    canvas
}

/// Produce the detector input tensor and the transform that inverts it
pub fn to_model_space(
    image: &RgbImage,
    input_side: u32,
    fill: u8,
    norm: &Normalization,
) -> (Array4<f32>, SquareTransform) {
    let (w, h) = image.dimensions();
    let transform = SquareTransform::for_image(w, h, input_side);

    let square = pad_to_square(image, fill);
    let resized = if transform.square_side == transform.input_side {
        square
    } else {
        imageops::resize(&square, transform.input_side, transform.input_side, FilterType::Triangle)
    };

    (image_to_tensor(&resized, norm), transform)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transform_uses_longest_side() {
        let t = SquareTransform::for_image(2000, 1000, 1024);
        assert_eq!(t.square_side, 2000);
        assert_eq!(t.input_side, 1024);
        assert!((t.scale() - 2000.0 / 1024.0).abs() < 1e-6);
    }

    #[test]
    fn test_round_trip_inside_bounds() {
        let sizes = [(2000u32, 1000u32), (640, 1280), (1024, 1024), (333, 777)];
        for &(w, h) in &sizes {
            let t = SquareTransform::for_image(w, h, 1024);
            for &(px, py) in &[(0.0, 0.0), (w as f32 / 3.0, h as f32 / 2.0), (w as f32, h as f32)] {
                let model = t.forward((px, py));
                let back = to_image_space(model, &t, (w, h));
                assert!((back.0 - px).abs() < 0.01, "x round trip for {}x{}", w, h);
                assert!((back.1 - py).abs() < 0.01, "y round trip for {}x{}", w, h);
            }
        }
    }

    #[test]
    fn test_to_image_space_clips_padding() {
        // Wide image: the bottom part of the square is padding
        let t = SquareTransform::for_image(2000, 1000, 1024);
        let p = to_image_space((1024.0, 1024.0), &t, (2000, 1000));
        assert_eq!(p, (2000.0, 1000.0));

        let p = to_image_space((-5.0, -5.0), &t, (2000, 1000));
        assert_eq!(p, (0.0, 0.0));
    }

    #[test]
    fn test_pad_to_square_anchors_origin() {
        let img = RgbImage::from_pixel(4, 2, Rgb([200, 200, 200]));
        let square = pad_to_square(&img, 7);

        assert_eq!(square.dimensions(), (4, 4));
        assert_eq!(square.get_pixel(3, 1).0, [200, 200, 200]);
        assert_eq!(square.get_pixel(0, 3).0, [7, 7, 7]);
    }

    #[test]
    fn test_to_model_space_tensor_shape() {
        let img = RgbImage::from_pixel(300, 100, Rgb([255, 255, 255]));
        let (tensor, t) = to_model_space(&img, 64, 0, &Normalization::default());

        assert_eq!(tensor.dim(), (1, 3, 64, 64));
        assert_eq!(t.square_side, 300);
        // Top rows carry page content, bottom rows are padding
        assert!(tensor[[0, 0, 2, 10]] > 0.9);
        assert!(tensor[[0, 0, 60, 10]] < 0.1);
    }
}
