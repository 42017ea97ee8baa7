// SPDX-License-Identifier: MIT OR Apache-2.0

//! Layer normalization over the joint `(channels, len)` shape.
//!
//! Statistics are taken over every channel *and* position of a sequence, and
//! the affine parameters are per `(channel, position)`.  A norm is therefore
//! tied to one sequence length; encoder blocks for the context and the
//! question cannot share one.

use candle_core::{Module, Tensor};
use candle_nn::{Init, LayerNorm, VarBuilder};

use crate::error::{QaError, Result};

/// Layer norm with `[channels, len]` normalized shape.
pub struct SeqLayerNorm {
    /// candle layer norm over the flattened `channels * len` axis.
    norm: LayerNorm,
    /// Normalized channel count.
    channels: usize,
    /// Normalized sequence length.
    len: usize,
}

impl SeqLayerNorm {
    /// Create the norm (`weight` ones, `bias` zeros).
    ///
    /// # Errors
    ///
    /// Returns [`QaError::Model`] if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn new(channels: usize, len: usize, eps: f64, vb: VarBuilder<'_>) -> Result<Self> {
        let weight = vb.get_with_hints((channels, len), "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints((channels, len), "bias", Init::Const(0.0))?;
        let norm = LayerNorm::new(weight.flatten_all()?, bias.flatten_all()?, eps);
        Ok(Self {
            norm,
            channels,
            len,
        })
    }

    /// Normalize each batch row over its channels and positions.
    ///
    /// # Shapes
    /// - `x`: `[batch, channels, len]`
    /// - returns: `[batch, channels, len]`
    ///
    /// # Errors
    ///
    /// Returns [`QaError::Shape`] if `(channels, len)` differs from the
    /// normalized shape.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, channels, len) = x.dims3()?;
        if (channels, len) != (self.channels, self.len) {
            return Err(QaError::Shape(format!(
                "layer norm normalized shape is ({}, {}), input has ({channels}, {len})",
                self.channels, self.len
            )));
        }
        let flat = x.reshape((batch, channels * len))?;
        Ok(self.norm.forward(&flat)?.reshape((batch, channels, len))?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    use super::*;

    #[test]
    fn zero_mean_unit_variance_per_row() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let norm = SeqLayerNorm::new(3, 4, 1e-5, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 3, 4), &Device::Cpu)
            .unwrap()
            .affine(5.0, 2.0)
            .unwrap();
        let y = norm.forward(&x).unwrap();
        for b in 0..2 {
            let row: Vec<f32> = y.get(b).unwrap().flatten_all().unwrap().to_vec1().unwrap();
            #[allow(clippy::cast_precision_loss)]
            let n = row.len() as f32;
            let mean = row.iter().sum::<f32>() / n;
            let var = row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
            assert!(mean.abs() < 1e-4);
            assert!((var - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn affine_parameters_apply_per_position() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let norm = SeqLayerNorm::new(2, 3, 1e-5, vb).unwrap();
        let scale = Tensor::new(&[[1f32, 2.0, 3.0], [4.0, 5.0, 6.0]], &Device::Cpu).unwrap();
        let shift = Tensor::new(&[[0f32, 0.0, 0.0], [0.0, 0.0, 10.0]], &Device::Cpu).unwrap();
        {
            let data = varmap.data().lock().unwrap();
            data.get("weight").unwrap().set(&scale).unwrap();
            data.get("bias").unwrap().set(&shift).unwrap();
        }
        // Alternating +1/-1 normalizes to itself.
        let x = Tensor::new(&[[[3f32, 1.0, 3.0], [1.0, 3.0, 1.0]]], &Device::Cpu).unwrap();
        let y: Vec<f32> = norm.forward(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let want = [1f32, -2.0, 3.0, -4.0, 5.0, 4.0];
        for (got, want) in y.iter().zip(want) {
            assert!((got - want).abs() < 1e-3, "{got} vs {want}");
        }
    }

    #[test]
    fn wrong_length_is_rejected() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let norm = SeqLayerNorm::new(3, 4, 1e-5, vb).unwrap();
        let x = Tensor::zeros((1, 3, 5), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(norm.forward(&x), Err(QaError::Shape(_))));
    }
}
