//! Trainable part of the model: one adapter per tower plus the logit scale.

use anyhow::{anyhow, Result};
use candle_core::{Device, Tensor, Var};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use super::adapter::{Adapter, AdapterState};
use super::loss::{contrastive_loss, LossOutput};

/// `ln(100)`: the logit scale is never allowed to exceed 100.
pub const MAX_LOG_LOGIT_SCALE: f32 = 4.605_170_2;

#[derive(Debug, Clone)]
pub struct ClipHead {
    pub image: Adapter,
    pub text: Adapter,
    log_logit_scale: Var,
    dim: usize,
    device: Device,
}

/// Serialisable snapshot of a [`ClipHead`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadState {
    pub dim: usize,
    pub image: AdapterState,
    pub text: AdapterState,
    pub log_logit_scale: f32,
}

impl ClipHead {
    /// Identity adapters and the pretrained logit scale of 100.
    pub fn identity(dim: usize) -> Result<Self> {
        let device = Device::Cpu;
        Ok(Self {
            image: Adapter::identity(dim, &device)?,
            text: Adapter::identity(dim, &device)?,
            log_logit_scale: Var::from_tensor(&Tensor::new(MAX_LOG_LOGIT_SCALE, &device)?)?,
            dim,
            device,
        })
    }

    pub fn from_state(state: &HeadState) -> Result<Self> {
        if !state.log_logit_scale.is_finite() {
            return Err(anyhow!("logit scale is not finite"));
        }

        let device = Device::Cpu;
        let image = Adapter::from_state(&state.image, state.dim, &device)
            .map_err(|e| anyhow!("image {e}"))?;
        let text = Adapter::from_state(&state.text, state.dim, &device)
            .map_err(|e| anyhow!("text {e}"))?;

        Ok(Self {
            image,
            text,
            log_logit_scale: Var::from_tensor(&Tensor::new(state.log_logit_scale, &device)?)?,
            dim: state.dim,
            device,
        })
    }

    pub fn state(&self) -> Result<HeadState> {
        Ok(HeadState {
            dim: self.dim,
            image: self.image.state()?,
            text: self.text.state()?,
            log_logit_scale: self.log_logit_scale.as_tensor().to_scalar()?,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn logit_scale(&self) -> Result<f32> {
        let log_scale: f32 = self.log_logit_scale.as_tensor().to_scalar()?;
        Ok(log_scale.exp())
    }

    pub fn clamp_logit_scale(&self) -> Result<()> {
        let clamped = self
            .log_logit_scale
            .as_tensor()
            .clamp(0f32, MAX_LOG_LOGIT_SCALE)?;
        self.log_logit_scale.set(&clamped)?;
        Ok(())
    }

    /// Every parameter the optimizer updates.
    pub fn vars(&self) -> Vec<Var> {
        let mut vars = self.image.vars();
        vars.extend(self.text.vars());
        vars.push(self.log_logit_scale.clone());
        vars
    }

    /// Project a `[N, dim]` matrix of image embeddings.
    pub fn project_images(&self, embeddings: &Array2<f32>) -> Result<Array2<f32>> {
        let rows = embeddings.nrows();
        let flat: Vec<f32> = embeddings.iter().copied().collect();
        let x = Tensor::from_vec(flat, (rows, self.dim), &self.device)?;
        let projected = self.image.forward(&x)?.flatten_all()?.to_vec1::<f32>()?;
        Ok(Array2::from_shape_vec((rows, self.dim), projected)?)
    }

    pub fn project_text(&self, embedding: &[f32]) -> Result<Vec<f32>> {
        let x = Tensor::from_slice(embedding, (1, embedding.len()), &self.device)?;
        Ok(self.text.forward(&x)?.flatten_all()?.to_vec1()?)
    }

    /// Loss on one batch of aligned `[N, dim]` pairs.
    pub fn loss(&self, images: &Tensor, texts: &Tensor) -> Result<LossOutput> {
        let image_out = self.image.forward(images)?;
        let text_out = self.text.forward(texts)?;
        let scale = self.log_logit_scale.as_tensor().exp()?;
        contrastive_loss(&image_out, &text_out, &scale)
    }
}
