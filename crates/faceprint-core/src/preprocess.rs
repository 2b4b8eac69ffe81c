//! Image-to-tensor preprocessing shared by the networks.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use ndarray::Array4;

/// Per-channel `(pixel - mean) * scale` normalization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    pub mean: [f32; 3],
    pub scale: f32,
}

impl Normalization {
    pub const fn new(mean: [f32; 3], scale: f32) -> Self {
        Self { mean, scale }
    }

    pub const fn uniform(mean: f32, scale: f32) -> Self {
        Self { mean: [mean; 3], scale }
    }

    #[inline]
    pub fn apply(&self, channel: usize, value: u8) -> f32 {
        (value as f32 - self.mean[channel]) * self.scale
    }
}

/// Metadata for coordinate de-mapping after letterbox resize.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LetterboxInfo {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    /// Side of the square network input.
    pub size: u32,
}

impl LetterboxInfo {
    /// Map a point from letterboxed input pixels back to source pixels.
    pub fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }

    /// Map a point given relative to the input side (0..1) back to source pixels.
    pub fn relative_to_source(&self, rx: f32, ry: f32) -> (f32, f32) {
        let side = self.size as f32;
        self.to_source(rx * side, ry * side)
    }
}

/// Resize `image` to fit a `size`x`size` square, preserving aspect ratio and
/// centring it on a black canvas.
pub fn letterbox(image: &RgbImage, size: u32) -> (RgbImage, LetterboxInfo) {
    let (width, height) = image.dimensions();
    let scale_w = size as f32 / width.max(1) as f32;
    let scale_h = size as f32 / height.max(1) as f32;
    let scale = scale_w.min(scale_h);

    let new_w = ((width as f32 * scale).round() as u32).clamp(1, size);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, size);
    let pad_x = (size - new_w) as f32 / 2.0;
    let pad_y = (size - new_h) as f32 / 2.0;

    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);
    let mut canvas = RgbImage::from_pixel(size, size, Rgb([0, 0, 0]));
    imageops::replace(&mut canvas, &resized, pad_x.floor() as i64, pad_y.floor() as i64);

    (
        canvas,
        LetterboxInfo {
            scale,
            pad_x: pad_x.floor(),
            pad_y: pad_y.floor(),
            size,
        },
    )
}

/// Stack same-sized RGB images into a `[N, 3, H, W]` tensor.
pub fn to_nchw(images: &[RgbImage], norm: Normalization) -> Array4<f32> {
    let (width, height) = images.first().map(|i| i.dimensions()).unwrap_or((0, 0));
    let mut tensor = Array4::<f32>::zeros((images.len(), 3, height as usize, width as usize));

    for (n, image) in images.iter().enumerate() {
        for (x, y, pixel) in image.enumerate_pixels() {
            if x >= width || y >= height {
                continue;
            }
            for c in 0..3 {
                tensor[[n, c, y as usize, x as usize]] = norm.apply(c, pixel[c]);
            }
        }
    }

    tensor
}

/// Crop `region` (clipped to the image) as a new image. Returns `None` when
/// the clipped region is empty.
pub fn crop(image: &RgbImage, region: &BoundingBox) -> Option<RgbImage> {
    let clipped = region.clamp_to(image.width(), image.height());
    let x = clipped.x.floor() as u32;
    let y = clipped.y.floor() as u32;
    let w = (clipped.right().ceil() as u32).saturating_sub(x);
    let h = (clipped.bottom().ceil() as u32).saturating_sub(y);
    if w == 0 || h == 0 {
        return None;
    }
    Some(imageops::crop_imm(image, x, y, w, h).to_image())
}

/// Crop `region`, filling any part outside the image with black, and resize
/// the result to `size`x`size`.
pub fn crop_padded(image: &RgbImage, region: &BoundingBox, size: u32) -> RgbImage {
    let w = region.width.round().max(1.0) as u32;
    let h = region.height.round().max(1.0) as u32;
    let mut patch = RgbImage::from_pixel(w, h, Rgb([0, 0, 0]));
    imageops::replace(
        &mut patch,
        image,
        -(region.x.round() as i64),
        -(region.y.round() as i64),
    );
    imageops::resize(&patch, size, size, FilterType::Triangle)
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Numerically stable softmax.
pub fn softmax(x: &[f32]) -> Vec<f32> {
    let max_val = x.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exp_vals: Vec<f32> = x.iter().map(|v| (v - max_val).exp()).collect();
    let sum: f32 = exp_vals.iter().sum();
    if sum > 0.0 {
        exp_vals.iter().map(|v| v / sum).collect()
    } else {
        exp_vals
    }
}
