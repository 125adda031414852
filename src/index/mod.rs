//! In-memory embedding index and brute-force similarity search.

pub mod cache;

use anyhow::Result;
use ndarray::{Array1, Array2, ArrayView1};
use rayon::prelude::*;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::clip::{Embedding, ImageEncoder, Preprocess, TextEncoder};
use crate::error::ClipseekError;
use crate::scanner::discover_images;
use crate::train::ClipHead;

pub use cache::{EmbeddingCache, FileFingerprint};

/// One ranked image.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub path: PathBuf,
    /// Cosine similarity between query and image.
    pub similarity: f32,
    /// Softmax of the scaled similarities over the whole corpus.
    pub probability: f32,
}

/// Row-aligned image paths and unit-length embeddings.
#[derive(Debug, Clone)]
pub struct ImageIndex {
    paths: Vec<PathBuf>,
    embeddings: Array2<f32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub discovered: usize,
    pub cached: usize,
    pub encoded: usize,
    pub skipped: usize,
}

impl ImageIndex {
    /// Discover and embed every image under `dir`.
    pub fn from_directory<E>(
        dir: &Path,
        extensions: &[String],
        encoder: &E,
        cache: Option<&EmbeddingCache>,
        batch_size: usize,
    ) -> Result<(Self, IndexStats)>
    where
        E: ImageEncoder + ?Sized,
    {
        let paths = discover_images(dir, extensions)?;
        if paths.is_empty() {
            return Err(ClipseekError::NoImagesFound { dir: dir.to_path_buf() }.into());
        }
        info!(count = paths.len(), dir = %dir.display(), "Discovered images");

        let (index, stats) = Self::from_paths(&paths, encoder, cache, batch_size)?;
        if index.is_empty() {
            return Err(ClipseekError::NoValidImages { dir: dir.to_path_buf() }.into());
        }

        if let Some(cache) = cache {
            let keep: HashSet<String> = paths.iter().map(|p| p.to_string_lossy().to_string()).collect();
            let pruned = cache.prune(encoder.model_name(), dir, &keep)?;
            if pruned > 0 {
                debug!(pruned, "Removed cache rows for missing images");
            }
        }

        info!(
            indexed = index.len(),
            cached = stats.cached,
            encoded = stats.encoded,
            skipped = stats.skipped,
            "Image index ready"
        );
        Ok((index, stats))
    }

    /// Embed the given images, skipping any that cannot be decoded.
    pub fn from_paths<E>(
        paths: &[PathBuf],
        encoder: &E,
        cache: Option<&EmbeddingCache>,
        batch_size: usize,
    ) -> Result<(Self, IndexStats)>
    where
        E: ImageEncoder + ?Sized,
    {
        let preprocess = Preprocess::inference();
        let batch_size = batch_size.max(1);
        let model_name = encoder.model_name().to_string();

        let mut stats = IndexStats {
            discovered: paths.len(),
            ..Default::default()
        };
        let mut kept_paths = Vec::with_capacity(paths.len());
        let mut kept_embeddings: Vec<Embedding> = Vec::with_capacity(paths.len());

        for (chunk_idx, chunk) in paths.chunks(batch_size).enumerate() {
            // Cache lookups first; only misses go through the encoder
            let mut slots: Vec<Option<Embedding>> = Vec::with_capacity(chunk.len());
            let mut fingerprints = Vec::with_capacity(chunk.len());
            for path in chunk {
                let fingerprint = FileFingerprint::of(path).ok();
                let cached = match (cache, fingerprint) {
                    (Some(cache), Some(fp)) => cache.get(path, &model_name, fp)?,
                    _ => None,
                };
                if cached.is_some() {
                    stats.cached += 1;
                }
                slots.push(cached);
                fingerprints.push(fingerprint);
            }

            let misses: Vec<usize> = (0..chunk.len()).filter(|&i| slots[i].is_none()).collect();
            let loaded: Vec<(usize, Result<_>)> = misses
                .par_iter()
                .map(|&i| (i, preprocess.load(&chunk[i], false)))
                .collect();

            let mut tensors = Vec::with_capacity(loaded.len());
            let mut tensor_slots = Vec::with_capacity(loaded.len());
            for (i, result) in loaded {
                match result {
                    Ok(tensor) => {
                        tensors.push(tensor);
                        tensor_slots.push(i);
                    }
                    Err(e) => {
                        warn!(path = %chunk[i].display(), error = %e, "Skipping unreadable image");
                        stats.skipped += 1;
                    }
                }
            }

            let embedded = encoder.embed_images(&tensors)?;
            for (i, embedding) in tensor_slots.into_iter().zip(embedded) {
                if let (Some(cache), Some(fp)) = (cache, fingerprints[i]) {
                    cache.store(&chunk[i], &model_name, fp, &embedding)?;
                }
                stats.encoded += 1;
                slots[i] = Some(embedding);
            }

            for (path, slot) in chunk.iter().zip(slots) {
                if let Some(embedding) = slot {
                    kept_paths.push(path.clone());
                    kept_embeddings.push(embedding);
                }
            }

            info!(
                processed = (chunk_idx * batch_size + chunk.len()).min(paths.len()),
                total = paths.len(),
                "Indexing images"
            );
        }

        Ok((Self::new(kept_paths, kept_embeddings)?, stats))
    }

    /// Build from already computed embeddings.
    pub fn new(paths: Vec<PathBuf>, embeddings: Vec<Embedding>) -> Result<Self> {
        let dim = embeddings.first().map(|e| e.len()).unwrap_or(0);
        let mut flat = Vec::with_capacity(embeddings.len() * dim);
        for embedding in &embeddings {
            if embedding.len() != dim {
                return Err(ClipseekError::DimensionMismatch {
                    expected: dim,
                    actual: embedding.len(),
                }
                .into());
            }
            flat.extend_from_slice(embedding);
        }

        Ok(Self {
            embeddings: Array2::from_shape_vec((paths.len(), dim), flat)?,
            paths,
        })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.embeddings.ncols()
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Pass every image embedding through a trained image adapter.
    pub fn project(&mut self, head: &ClipHead) -> Result<()> {
        if head.dim() != self.dim() {
            return Err(ClipseekError::DimensionMismatch {
                expected: self.dim(),
                actual: head.dim(),
            }
            .into());
        }

        self.embeddings = head.project_images(&self.embeddings)?;
        Ok(())
    }

    /// Rank the whole corpus against a unit-length query.
    ///
    /// Returns at most `top_k` hits, best first. Equal scores keep corpus order.
    pub fn search(&self, query: &[f32], top_k: usize, logit_scale: f32) -> Result<Vec<SearchHit>> {
        if self.is_empty() {
            return Err(ClipseekError::EmptyIndex.into());
        }
        if query.len() != self.dim() {
            return Err(ClipseekError::DimensionMismatch {
                expected: self.dim(),
                actual: query.len(),
            }
            .into());
        }

        let similarities = self.embeddings.dot(&ArrayView1::from(query));
        let probabilities = softmax(&(&similarities * logit_scale));

        let mut order: Vec<usize> = (0..self.len()).collect();
        order.sort_by(|&a, &b| similarities[b].total_cmp(&similarities[a]));

        Ok(order
            .into_iter()
            .take(top_k)
            .map(|i| SearchHit {
                path: self.paths[i].clone(),
                similarity: similarities[i],
                probability: probabilities[i],
            })
            .collect())
    }
}

fn softmax(logits: &Array1<f32>) -> Array1<f32> {
    let max = logits.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
    let exp = logits.mapv(|x| (x - max).exp());
    let sum = exp.sum();
    exp / sum
}

/// Text-to-image search over an index, optionally through a trained head.
pub struct Retriever<'a, T: TextEncoder + ?Sized> {
    encoder: &'a T,
    index: ImageIndex,
    head: Option<ClipHead>,
    logit_scale: f32,
}

impl<'a, T: TextEncoder + ?Sized> Retriever<'a, T> {
    /// `logit_scale` is used unless the head carries its own.
    pub fn new(encoder: &'a T, mut index: ImageIndex, head: Option<ClipHead>, logit_scale: f32) -> Result<Self> {
        let logit_scale = match &head {
            Some(head) => {
                index.project(head)?;
                head.logit_scale()?
            }
            None => logit_scale,
        };

        Ok(Self {
            encoder,
            index,
            head,
            logit_scale,
        })
    }

    pub fn index(&self) -> &ImageIndex {
        &self.index
    }

    pub fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchHit>> {
        let mut embedding = self.encoder.embed_text(query)?;
        if let Some(head) = &self.head {
            embedding = head.project_text(&embedding)?;
        }
        self.index.search(&embedding, top_k, self.logit_scale)
    }
}
