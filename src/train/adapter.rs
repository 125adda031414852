//! Residual linear adapter placed on top of a frozen encoder.
//!
//! `u = x + x W + b`, output `u / |u|`. With `W = 0, b = 0` the adapter is the
//! identity on unit-length inputs.

use anyhow::{anyhow, Result};
use candle_core::{DType, Device, Tensor, Var};
use serde::{Deserialize, Serialize};

const NORM_EPS: f64 = 1e-12;

/// Trainable adapter weights. `weight` is `[dim, dim]`, `bias` is `[dim]`.
#[derive(Debug, Clone)]
pub struct Adapter {
    weight: Var,
    bias: Var,
}

/// Plain copy of an adapter's weights, row-major, for checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterState {
    pub weight: Vec<f32>,
    pub bias: Vec<f32>,
}

impl Adapter {
    pub fn identity(dim: usize, device: &Device) -> Result<Self> {
        Ok(Self {
            weight: Var::zeros((dim, dim), DType::F32, device)?,
            bias: Var::zeros(dim, DType::F32, device)?,
        })
    }

    pub fn from_state(state: &AdapterState, dim: usize, device: &Device) -> Result<Self> {
        if state.weight.len() != dim * dim || state.bias.len() != dim {
            return Err(anyhow!(
                "adapter has {} weights and {} biases, expected {}x{}",
                state.weight.len(),
                state.bias.len(),
                dim,
                dim
            ));
        }

        Ok(Self {
            weight: Var::from_tensor(&Tensor::from_slice(&state.weight, (dim, dim), device)?)?,
            bias: Var::from_tensor(&Tensor::from_slice(&state.bias, dim, device)?)?,
        })
    }

    pub fn state(&self) -> Result<AdapterState> {
        Ok(AdapterState {
            weight: self.weight.as_tensor().flatten_all()?.to_vec1()?,
            bias: self.bias.as_tensor().to_vec1()?,
        })
    }

    pub fn dim(&self) -> usize {
        self.bias.as_tensor().elem_count()
    }

    /// Forward a `[N, dim]` batch of row vectors to unit-length outputs.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = x
            .matmul(self.weight.as_tensor())?
            .add(x)?
            .broadcast_add(self.bias.as_tensor())?;
        l2_normalize(&hidden)
    }

    pub fn vars(&self) -> Vec<Var> {
        vec![self.weight.clone(), self.bias.clone()]
    }

    #[cfg(test)]
    pub(crate) fn weight(&self) -> &Var {
        &self.weight
    }

    #[cfg(test)]
    pub(crate) fn bias(&self) -> &Var {
        &self.bias
    }
}

/// Divide every row by its L2 norm.
fn l2_normalize(x: &Tensor) -> Result<Tensor> {
    let norm = x.sqr()?.sum_keepdim(1)?.sqrt()?.affine(1.0, NORM_EPS)?;
    Ok(x.broadcast_div(&norm)?)
}
