//! CLIP model implementation using ONNX Runtime

use anyhow::{anyhow, Context, Result};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};

use super::preprocess::ImageTensor;
use super::{normalize, Embedding, ImageEncoder, TextEncoder};
use crate::config::ModelConfig;

const VISUAL_FILE: &str = "clip-vit-b32-vision.onnx";
const TEXT_FILE: &str = "clip-vit-b32-text.onnx";
const TOKENIZER_FILE: &str = "clip-vit-b32-tokenizer.json";

pub const MODEL_NAME: &str = "clip-vit-b32";

/// CLIP dual encoder. Sessions are created on first use.
pub struct ClipModel {
    config: ModelConfig,
    visual: OnceLock<Mutex<Session>>,
    text: OnceLock<Mutex<Session>>,
    tokenizer: OnceLock<Tokenizer>,
}

impl ClipModel {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            visual: OnceLock::new(),
            text: OnceLock::new(),
            tokenizer: OnceLock::new(),
        }
    }

    fn visual_session(&self) -> Result<&Mutex<Session>> {
        if let Some(session) = self.visual.get() {
            return Ok(session);
        }
        let path = self.ensure_model(VISUAL_FILE, &self.config.visual_url)?;
        let session = self.build_session(&path)?;
        Ok(self.visual.get_or_init(|| Mutex::new(session)))
    }

    fn text_session(&self) -> Result<&Mutex<Session>> {
        if let Some(session) = self.text.get() {
            return Ok(session);
        }
        let path = self.ensure_model(TEXT_FILE, &self.config.text_url)?;
        let session = self.build_session(&path)?;
        Ok(self.text.get_or_init(|| Mutex::new(session)))
    }

    fn tokenizer(&self) -> Result<&Tokenizer> {
        if let Some(tokenizer) = self.tokenizer.get() {
            return Ok(tokenizer);
        }
        let path = self.ensure_model(TOKENIZER_FILE, &self.config.tokenizer_url)?;
        let tokenizer = load_tokenizer(&path, self.config.context_length)?;
        Ok(self.tokenizer.get_or_init(|| tokenizer))
    }

    fn build_session(&self, path: &Path) -> Result<Session> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(self.config.intra_threads)?
            .commit_from_file(path)
            .with_context(|| format!("Failed to load ONNX model {}", path.display()))?;
        Ok(session)
    }

    /// Download a model file if it doesn't exist
    fn ensure_model(&self, filename: &str, url: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.config.models_dir)?;
        let model_path = self.config.models_dir.join(filename);

        if !model_path.exists() {
            tracing::info!(model = %filename, "Downloading CLIP model...");
            let response = ureq::get(url)
                .call()
                .map_err(|e| anyhow!("Failed to download {}: {}", url, e))?;

            // Write to a temporary name so an interrupted download is not mistaken for a model
            let partial = model_path.with_extension("part");
            let mut file = std::fs::File::create(&partial)?;
            std::io::copy(&mut response.into_reader(), &mut file)?;
            std::fs::rename(&partial, &model_path)?;
            tracing::info!(model = %filename, path = ?model_path, "CLIP model downloaded");
        }

        Ok(model_path)
    }

    fn tokenize(&self, texts: &[String]) -> Result<(Vec<i64>, Vec<i64>)> {
        let tokenizer = self.tokenizer()?;
        let encodings = tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| anyhow!("Tokenization failed: {}", e))?;

        let mut input_ids = Vec::with_capacity(texts.len() * self.config.context_length);
        let mut attention_mask = Vec::with_capacity(input_ids.capacity());
        for encoding in &encodings {
            input_ids.extend(encoding.get_ids().iter().map(|&id| id as i64));
            attention_mask.extend(encoding.get_attention_mask().iter().map(|&m| m as i64));
        }

        Ok((input_ids, attention_mask))
    }
}

impl ImageEncoder for ClipModel {
    fn model_name(&self) -> &str {
        MODEL_NAME
    }

    fn embed_images(&self, images: &[ImageTensor]) -> Result<Vec<Embedding>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }

        let size = images[0].size as usize;
        let mut input_data = Vec::with_capacity(images.len() * 3 * size * size);
        for image in images {
            if image.size as usize != size {
                return Err(anyhow!("Mixed image sizes in one batch"));
            }
            input_data.extend_from_slice(&image.data);
        }

        let input_tensor = Tensor::from_array((
            [images.len(), 3, size, size],
            input_data.into_boxed_slice(),
        ))?;

        let mut model = self
            .visual_session()?
            .lock()
            .map_err(|e| anyhow!("Failed to lock model: {}", e))?;

        let outputs = model.run(ort::inputs!["pixel_values" => input_tensor])?;

        let embedding_output = outputs
            .iter()
            .next()
            .ok_or_else(|| anyhow!("No embedding output"))?;

        let (_shape, embedding_data) = embedding_output.1.try_extract_tensor::<f32>()?;

        split_rows(embedding_data, images.len())
    }
}

impl TextEncoder for ClipModel {
    fn embed_texts(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let (input_ids, attention_mask) = self.tokenize(texts)?;
        let seq_len = input_ids.len() / texts.len();

        let ids_tensor = Tensor::from_array(([texts.len(), seq_len], input_ids.into_boxed_slice()))?;
        let mask_tensor =
            Tensor::from_array(([texts.len(), seq_len], attention_mask.into_boxed_slice()))?;

        let mut model = self
            .text_session()?
            .lock()
            .map_err(|e| anyhow!("Failed to lock model: {}", e))?;

        let outputs = model.run(ort::inputs![
            "input_ids" => ids_tensor,
            "attention_mask" => mask_tensor
        ])?;

        let embedding_output = outputs
            .iter()
            .next()
            .ok_or_else(|| anyhow!("No embedding output"))?;

        let (_shape, embedding_data) = embedding_output.1.try_extract_tensor::<f32>()?;

        split_rows(embedding_data, texts.len())
    }
}

/// Load the CLIP BPE tokenizer, padded with id 0 and truncated to the context length.
fn load_tokenizer(path: &Path, context_length: usize) -> Result<Tokenizer> {
    let mut tokenizer =
        Tokenizer::from_file(path).map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;

    tokenizer
        .with_truncation(Some(TruncationParams {
            max_length: context_length,
            ..Default::default()
        }))
        .map_err(|e| anyhow!("Failed to configure truncation: {}", e))?;

    tokenizer.with_padding(Some(PaddingParams {
        strategy: PaddingStrategy::Fixed(context_length),
        pad_id: 0,
        ..Default::default()
    }));

    Ok(tokenizer)
}

/// Split a flat `[rows, dim]` output into normalized rows.
fn split_rows(data: &[f32], rows: usize) -> Result<Vec<Embedding>> {
    if rows == 0 || data.len() % rows != 0 {
        return Err(anyhow!(
            "Encoder output of {} values does not split into {} rows",
            data.len(),
            rows
        ));
    }

    let dim = data.len() / rows;
    Ok(data
        .chunks_exact(dim)
        .map(|row| {
            let mut embedding = row.to_vec();
            normalize(&mut embedding);
            embedding
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_rows_normalizes_each_row() {
        let data = [3.0, 4.0, 0.0, 2.0];
        let rows = split_rows(&data, 2).unwrap();
        assert_eq!(rows.len(), 2);
        assert!((rows[0][0] - 0.6).abs() < 1e-6);
        assert!((rows[1][1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_split_rows_rejects_ragged_output() {
        assert!(split_rows(&[1.0, 2.0, 3.0], 2).is_err());
    }
}
