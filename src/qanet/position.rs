// SPDX-License-Identifier: MIT OR Apache-2.0

//! Learned absolute position embeddings.

use candle_core::Tensor;
use candle_nn::{Init, VarBuilder};

use crate::error::{QaError, Result};

/// Adds a learned, position-dependent bias to a channel-first sequence.
pub struct PositionalEncoder {
    /// Position table: `[max_length, channels]`.
    table: Tensor,
    /// Number of rows in `table`.
    max_length: usize,
}

impl PositionalEncoder {
    /// Create the encoder; the table is `positional_embedding.weight`,
    /// initialized from a standard normal.
    ///
    /// # Errors
    ///
    /// Returns [`QaError::Model`] if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn new(max_length: usize, channels: usize, vb: VarBuilder<'_>) -> Result<Self> {
        let table = vb.pp("positional_embedding").get_with_hints(
            (max_length, channels),
            "weight",
            Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        )?;
        Ok(Self { table, max_length })
    }

    /// Add the embeddings of positions `0..len` to `x`.
    ///
    /// # Shapes
    /// - `x`: `[batch, channels, len]`, `len <= max_length`
    /// - returns: `[batch, channels, len]`
    ///
    /// # Errors
    ///
    /// Returns [`QaError::Shape`] if `len` exceeds the table size.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (_batch, _channels, len) = x.dims3()?;
        if len > self.max_length {
            return Err(QaError::Shape(format!(
                "sequence length {len} exceeds positional table size {}",
                self.max_length
            )));
        }
        // [len, channels] -> [1, channels, len]
        let pos = self.table.narrow(0, 0, len)?.t()?.unsqueeze(0)?;
        Ok(x.broadcast_add(&pos.to_dtype(x.dtype())?)?)
    }

    /// Maximum supported sequence length.
    #[must_use]
    pub const fn max_length(&self) -> usize {
        self.max_length
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    use super::*;

    #[test]
    fn adds_same_bias_to_every_batch_row() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let pe = PositionalEncoder::new(6, 4, vb).unwrap();

        let x = Tensor::zeros((2, 4, 5), DType::F32, &Device::Cpu).unwrap();
        let y = pe.forward(&x).unwrap();
        assert_eq!(y.dims(), &[2, 4, 5]);
        let diff = (y.get(0).unwrap() - y.get(1).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn rejects_too_long_sequence() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let pe = PositionalEncoder::new(4, 2, vb).unwrap();
        let x = Tensor::zeros((1, 2, 5), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(pe.forward(&x), Err(QaError::Shape(_))));
    }
}
