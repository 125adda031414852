//! Deterministic stand-ins for the ONNX encoders.

use anyhow::Result;
use image::{Rgb, RgbImage};
use std::cell::Cell;
use std::path::Path;

use crate::clip::{normalize, Embedding, ImageEncoder, ImageTensor, TextEncoder};

/// Maps red/green/blue pixels and the words "red"/"green"/"blue" onto the
/// first three axes; other words are hashed onto the remaining axes.
pub struct HashEncoder {
    dim: usize,
    pub image_calls: Cell<usize>,
}

impl HashEncoder {
    pub fn new(dim: usize) -> Self {
        assert!(dim >= 4);
        Self {
            dim,
            image_calls: Cell::new(0),
        }
    }
}

impl ImageEncoder for HashEncoder {
    fn model_name(&self) -> &str {
        "hash-test"
    }

    fn embed_images(&self, images: &[ImageTensor]) -> Result<Vec<Embedding>> {
        self.image_calls.set(self.image_calls.get() + images.len());
        Ok(images
            .iter()
            .map(|image| {
                let plane = (image.size * image.size) as usize;
                let mut embedding = vec![0.05; self.dim];
                for c in 0..3 {
                    let mean = image.data[c * plane..(c + 1) * plane].iter().sum::<f32>() / plane as f32;
                    embedding[c] = mean.max(0.0);
                }
                normalize(&mut embedding);
                embedding
            })
            .collect())
    }
}

impl TextEncoder for HashEncoder {
    fn embed_texts(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut embedding = vec![0.0; self.dim];
                for word in text.to_lowercase().split_whitespace() {
                    match word {
                        "red" => embedding[0] += 1.0,
                        "green" => embedding[1] += 1.0,
                        "blue" => embedding[2] += 1.0,
                        other => {
                            let bucket = other.bytes().map(|b| b as usize).sum::<usize>() % (self.dim - 3);
                            embedding[3 + bucket] += 0.1;
                        }
                    }
                }
                normalize(&mut embedding);
                embedding
            })
            .collect())
    }
}

/// Write a small solid-color PNG.
pub fn write_png(path: &Path, rgb: [u8; 3]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    RgbImage::from_pixel(16, 12, Rgb(rgb)).save(path).unwrap();
}
