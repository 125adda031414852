//! CLIP (Contrastive Language-Image Pre-training) encoders
//!
//! Both towers map into the same embedding space, so a text query can be
//! ranked against image embeddings with a plain dot product.

mod model;
pub mod preprocess;

use anyhow::Result;

pub use model::ClipModel;
pub use preprocess::{ImageTensor, Preprocess};

/// CLIP embedding (512-dimensional for ViT-B/32), unit length once normalized
pub type Embedding = Vec<f32>;

/// Visual tower.
pub trait ImageEncoder {
    /// Identifies the weights that produced an embedding, used as the cache key.
    fn model_name(&self) -> &str;

    /// Embed a batch of preprocessed images. Outputs are L2-normalized.
    fn embed_images(&self, images: &[ImageTensor]) -> Result<Vec<Embedding>>;
}

/// Text tower.
pub trait TextEncoder {
    /// Embed a batch of strings. Outputs are L2-normalized.
    fn embed_texts(&self, texts: &[String]) -> Result<Vec<Embedding>>;

    fn embed_text(&self, text: &str) -> Result<Embedding> {
        let mut embeddings = self.embed_texts(&[text.to_string()])?;
        embeddings
            .pop()
            .ok_or_else(|| anyhow::anyhow!("Text encoder returned no embedding"))
    }
}

/// Scale a vector to unit length in place. Zero vectors are left untouched.
pub fn normalize(embedding: &mut [f32]) {
    let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm > 0.0 {
        embedding.iter_mut().for_each(|x| *x /= norm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }
}
