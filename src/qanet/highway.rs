// SPDX-License-Identifier: MIT OR Apache-2.0

//! Highway network over the channel axis.

use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::error::Result;

use super::init::dense;

/// One gate/transform pair.
struct HighwayLayer {
    /// Transform projection (`linear.{i}`).
    linear: Linear,
    /// Gate projection (`gate.{i}`).
    gate: Linear,
}

/// Stack of highway layers: `x = g * relu(W_l x) + (1 - g) * x`,
/// `g = sigmoid(W_g x)`.
///
/// Layout contract: takes and returns channel-first tensors; the projections
/// run feature-last, so the input is transposed on entry and back on exit.
pub struct Highway {
    /// Layers applied in order.
    layers: Vec<HighwayLayer>,
}

impl Highway {
    /// Build `num_layers` gate/transform pairs of width `size`.
    ///
    /// # Errors
    ///
    /// Returns [`QaError::Model`](crate::QaError::Model) if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn new(num_layers: usize, size: usize, vb: VarBuilder<'_>) -> Result<Self> {
        let mut layers = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            layers.push(HighwayLayer {
                linear: dense(size, size, true, vb.pp(format!("linear.{i}")))?,
                gate: dense(size, size, true, vb.pp(format!("gate.{i}")))?,
            });
        }
        Ok(Self { layers })
    }

    /// Apply every layer.
    ///
    /// # Shapes
    /// - `x`: `[batch, size, len]`
    /// - returns: `[batch, size, len]`
    ///
    /// # Errors
    ///
    /// Returns [`QaError::Model`](crate::QaError::Model) on tensor operation failures.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // [batch, size, len] -> [batch, len, size]
        let mut x = x.transpose(1, 2)?.contiguous()?;
        for layer in &self.layers {
            let gate = candle_nn::ops::sigmoid(&layer.gate.forward(&x)?)?;
            let transform = layer.linear.forward(&x)?.relu()?;
            let carry = gate.affine(-1.0, 1.0)?.mul(&x)?;
            x = (gate.mul(&transform)? + carry)?;
        }
        Ok(x.transpose(1, 2)?)
    }

    /// Number of layers.
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    use super::*;

    #[test]
    fn preserves_channel_first_shape() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let high = Highway::new(2, 6, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (3, 6, 5), &Device::Cpu).unwrap();
        assert_eq!(high.forward(&x).unwrap().dims(), &[3, 6, 5]);
        assert_eq!(high.num_layers(), 2);
    }

    #[test]
    fn closed_gate_is_identity() {
        // Gate weights zero and bias very negative: sigmoid -> 0, output == input.
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let high = Highway::new(1, 4, vb).unwrap();
        let mut varmap = varmap;
        varmap
            .set_one("gate.0.weight", Tensor::zeros((4, 4), DType::F32, &Device::Cpu).unwrap())
            .unwrap();
        let closed = Tensor::full(-100f32, 4, &Device::Cpu).unwrap();
        varmap.set_one("gate.0.bias", closed).unwrap();

        let x = Tensor::randn(0f32, 1.0, (2, 4, 3), &Device::Cpu).unwrap();
        let y = high.forward(&x).unwrap();
        let diff = (y - &x)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6);
    }
}
