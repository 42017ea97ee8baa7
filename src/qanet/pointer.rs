// SPDX-License-Identifier: MIT OR Apache-2.0

//! Start/end span pointer over the model encoder outputs.

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::config::QaNetConfig;
use crate::error::Result;
use crate::hooks::{HookCache, HookPoint, HookSpec};
use crate::util::masks::mask_logits;

use super::init::uniform;

/// Projects `[M1; M2]` and `[M1; M3]` to start and end log-probabilities.
///
/// The two distributions are computed independently; nothing couples the
/// end position to the start.
pub struct SpanPointer {
    /// Start projection `[2D]`.
    w1: Tensor,
    /// End projection `[2D]`.
    w2: Tensor,
}

impl SpanPointer {
    /// Create the pointer; `w1` and `w2` are uniform on `±sqrt(3 / 2D)`.
    ///
    /// # Errors
    ///
    /// Returns [`QaError::Model`](crate::QaError::Model) if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn new(config: &QaNetConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let two_d = 2 * config.connector_dim;
        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let bound = (3.0 / two_d as f64).sqrt();
        Ok(Self {
            w1: vb.get_with_hints(two_d, "w1", uniform(bound))?,
            w2: vb.get_with_hints(two_d, "w2", uniform(bound))?,
        })
    }

    /// Compute `(log p_start, log p_end)`.
    ///
    /// # Shapes
    /// - `m1`, `m2`, `m3`: `[batch, D, Lc]`
    /// - `mask`: `[batch, Lc]`
    /// - returns: two `[batch, Lc]` log-distributions
    ///
    /// # Errors
    ///
    /// Returns [`QaError::Model`](crate::QaError::Model) on shape mismatch or
    /// tensor operation failures.
    pub fn forward(
        &self,
        m1: &Tensor,
        m2: &Tensor,
        m3: &Tensor,
        mask: &Tensor,
        hooks: &HookSpec,
        cache: &mut HookCache,
    ) -> Result<(Tensor, Tensor)> {
        let mask = mask.to_dtype(m1.dtype())?;
        let start = project(&Tensor::cat(&[m1, m2], 1)?, &self.w1)?;
        let end = project(&Tensor::cat(&[m1, m3], 1)?, &self.w2)?;

        let start = mask_logits(&start, &mask)?;
        let start = hooks.observe(HookPoint::StartLogits, start, cache)?;
        let end = mask_logits(&end, &mask)?;
        let end = hooks.observe(HookPoint::EndLogits, end, cache)?;

        Ok((
            candle_nn::ops::log_softmax(&start, 1)?,
            candle_nn::ops::log_softmax(&end, 1)?,
        ))
    }
}

/// `w · x` over the channel axis: `[batch, 2D, Lc]` -> `[batch, Lc]`.
fn project(x: &Tensor, w: &Tensor) -> Result<Tensor> {
    let w = w.to_dtype(x.dtype())?.reshape((1, (), 1))?;
    Ok(x.broadcast_mul(&w)?.sum(1)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    use super::*;

    #[test]
    fn distributions_normalize_over_valid_positions() {
        let config = QaNetConfig::from_json(&serde_json::json!({
            "connector_dim": 4, "num_heads": 1, "glove_dim": 4, "char_dim": 4,
            "para_limit": 6, "ques_limit": 3
        }))
        .unwrap();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let pointer = SpanPointer::new(&config, vb).unwrap();

        let m = |_: usize| Tensor::randn(0f32, 1.0, (2, 4, 6), &Device::Cpu).unwrap();
        let mask = Tensor::new(
            &[[1f32, 1.0, 1.0, 1.0, 0.0, 0.0], [1.0, 1.0, 1.0, 1.0, 1.0, 1.0]],
            &Device::Cpu,
        )
        .unwrap();
        let (p1, p2) = pointer
            .forward(&m(1), &m(2), &m(3), &mask, &HookSpec::new(), &mut HookCache::new())
            .unwrap();

        for logp in [p1, p2] {
            let probs = logp.exp().unwrap();
            let sums: Vec<f32> = probs.sum(1).unwrap().to_vec1().unwrap();
            assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-5));
            let rows: Vec<Vec<f32>> = probs.to_vec2().unwrap();
            assert_eq!(rows[0][4], 0.0);
            assert_eq!(rows[0][5], 0.0);
        }
    }
}
