//! Image preprocessing for the CLIP visual encoder.

use anyhow::{anyhow, Result};
use image::imageops::FilterType;
use image::DynamicImage;
use std::path::Path;

/// CLIP normalization constants
const MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
const STD: [f32; 3] = [0.26862954, 0.26130258, 0.27577711];

/// A normalized CHW image, `3 * size * size` values.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    pub size: u32,
    pub data: Vec<f32>,
}

/// Resize-then-center-crop pipeline.
#[derive(Debug, Clone, Copy)]
pub struct Preprocess {
    /// Target length of the shorter side before cropping.
    pub resize_to: u32,
    /// Side of the square crop fed to the encoder.
    pub crop: u32,
}

impl Preprocess {
    /// The encoder's own preprocessing: shorter side to 224, center crop 224.
    pub fn inference() -> Self {
        Self {
            resize_to: 224,
            crop: 224,
        }
    }

    /// Training preprocessing: shorter side to `size / 0.875`, center crop `size`.
    pub fn training(size: u32) -> Self {
        Self {
            resize_to: (size as f32 / 0.875).round() as u32,
            crop: size,
        }
    }

    pub fn load(&self, path: &Path, flip: bool) -> Result<ImageTensor> {
        let img = image::open(path)
            .map_err(|e| anyhow!("Failed to load image {}: {}", path.display(), e))?;
        Ok(self.apply(&img, flip))
    }

    pub fn apply(&self, img: &DynamicImage, flip: bool) -> ImageTensor {
        let (w, h) = (img.width().max(1), img.height().max(1));
        let scale = self.resize_to as f32 / w.min(h) as f32;
        let new_w = ((w as f32 * scale).round() as u32).max(self.crop);
        let new_h = ((h as f32 * scale).round() as u32).max(self.crop);

        let resized = img.resize_exact(new_w, new_h, FilterType::CatmullRom);
        let left = (new_w - self.crop) / 2;
        let top = (new_h - self.crop) / 2;
        let mut cropped = resized.crop_imm(left, top, self.crop, self.crop);
        if flip {
            cropped = cropped.fliph();
        }
        let rgb = cropped.to_rgb8();

        let size = self.crop as usize;
        let plane = size * size;
        let mut data = vec![0.0f32; 3 * plane];

        for (x, y, pixel) in rgb.enumerate_pixels() {
            let idx = y as usize * size + x as usize;
            for c in 0..3 {
                data[c * plane + idx] = (pixel[c] as f32 / 255.0 - MEAN[c]) / STD[c];
            }
        }

        ImageTensor {
            size: self.crop,
            data,
        }
    }
}
