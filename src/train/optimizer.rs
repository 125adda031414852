//! AdamW settings as stored in checkpoints.
//!
//! The update itself is `candle_nn::AdamW`; it keeps its moment estimates
//! private, so a resumed run rebuilds them from zero.

use anyhow::Result;
use candle_core::Var;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
    /// Optimizer steps taken so far.
    pub step: u64,
}

impl OptimizerState {
    pub fn new(lr: f64, weight_decay: f64) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay,
            step: 0,
        }
    }

    pub fn params(&self) -> ParamsAdamW {
        ParamsAdamW {
            lr: self.lr,
            beta1: self.beta1,
            beta2: self.beta2,
            eps: self.eps,
            weight_decay: self.weight_decay,
        }
    }

    pub fn build(&self, vars: Vec<Var>) -> Result<AdamW> {
        Ok(AdamW::new(vars, self.params())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};

    #[test]
    fn test_defaults_follow_adamw() {
        let state = OptimizerState::new(1e-4, 0.01);
        let params = state.params();
        assert_eq!(params.beta1, 0.9);
        assert_eq!(params.beta2, 0.999);
        assert_eq!(params.eps, 1e-8);
        assert_eq!(params.weight_decay, 0.01);
    }

    #[test]
    fn test_step_moves_against_gradient() {
        let var = Var::zeros(2, DType::F32, &Device::Cpu).unwrap();
        let mut optimizer = OptimizerState::new(0.1, 0.0).build(vec![var.clone()]).unwrap();

        // d/dx sum(x * [1, -1]) = [1, -1]
        let direction = Tensor::from_slice(&[1.0f32, -1.0], 2, &Device::Cpu).unwrap();
        let loss = var.as_tensor().mul(&direction).unwrap().sum_all().unwrap();
        optimizer.backward_step(&loss).unwrap();

        let values: Vec<f32> = var.as_tensor().to_vec1().unwrap();
        assert!((values[0] + 0.1).abs() < 1e-4, "{values:?}");
        assert!((values[1] - 0.1).abs() < 1e-4, "{values:?}");
    }
}
