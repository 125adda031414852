//! Symmetric contrastive loss over a batch of aligned pairs.

use anyhow::Result;
use candle_core::{DType, Tensor, D};
use candle_nn::loss::cross_entropy;

pub struct LossOutput {
    /// Scalar loss, still attached to the graph.
    pub loss: Tensor,
    /// Rows whose best-scoring caption is their own.
    pub correct: usize,
}

/// `logits = s * images · textsᵀ`, cross-entropy towards the diagonal in both
/// directions, averaged.
///
/// Inputs are `[N, D]` and unit length; `logit_scale` is a scalar tensor.
pub fn contrastive_loss(images: &Tensor, texts: &Tensor, logit_scale: &Tensor) -> Result<LossOutput> {
    let n = images.dim(0)?;
    let logits = images.matmul(&texts.t()?)?.broadcast_mul(logit_scale)?;
    let targets = Tensor::arange(0u32, n as u32, images.device())?;

    let loss_images = cross_entropy(&logits, &targets)?;
    let loss_texts = cross_entropy(&logits.t()?.contiguous()?, &targets)?;
    let loss = ((loss_images + loss_texts)? / 2.0)?;

    let predicted: Vec<u32> = logits.argmax(D::Minus1)?.to_dtype(DType::U32)?.to_vec1()?;
    let correct = predicted
        .iter()
        .enumerate()
        .filter(|(i, &p)| p as usize == *i)
        .count();

    Ok(LossOutput { loss, correct })
}
