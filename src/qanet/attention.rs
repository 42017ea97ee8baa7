// SPDX-License-Identifier: MIT OR Apache-2.0

//! Multi-head scaled dot-product self-attention with padding masks.

use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::config::QaNetConfig;
use crate::error::Result;
use crate::hooks::{BlockId, HookCache, HookPoint, HookSpec};
use crate::util::masks::mask_logits;

use super::init::xavier_no_bias;

// ---------------------------------------------------------------------------
// SelfAttention
// ---------------------------------------------------------------------------

/// Multi-head self-attention over a channel-first sequence.
///
/// Q, K, V and output projections are bias-free (`Wqs`, `Wks`, `Wvs`, `Wo`)
/// and Xavier-uniform initialized.  Padding is masked twice: additively on
/// the key axis before the softmax, and multiplicatively on both the key
/// and query axes after it.  Padded keys therefore get exactly zero weight
/// and padded queries produce a zero output row.
pub struct SelfAttention {
    /// Query projection.
    q_proj: Linear,
    /// Key projection.
    k_proj: Linear,
    /// Value projection.
    v_proj: Linear,
    /// Output projection.
    o_proj: Linear,
    /// Number of heads.
    num_heads: usize,
    /// Dimension per head.
    head_dim: usize,
    /// Score scale `1/sqrt(head_dim)`.
    scale: f64,
}

impl SelfAttention {
    /// Create the attention layer with `D = config.connector_dim`.
    ///
    /// # Errors
    ///
    /// Returns [`QaError::Model`](crate::QaError::Model) if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn new(config: &QaNetConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let d = config.connector_dim;
        Ok(Self {
            q_proj: xavier_no_bias(d, d, vb.pp("Wqs"))?,
            k_proj: xavier_no_bias(d, d, vb.pp("Wks"))?,
            v_proj: xavier_no_bias(d, d, vb.pp("Wvs"))?,
            o_proj: xavier_no_bias(d, d, vb.pp("Wo"))?,
            num_heads: config.num_heads,
            head_dim: config.head_dim(),
            scale: config.attention_scale(),
        })
    }

    /// Run attention with hook capture and intervention.
    ///
    /// `mask` must be binary (see [`ensure_binary`](crate::util::masks::ensure_binary)).
    ///
    /// # Shapes
    /// - `x`: `[batch, D, len]`
    /// - `mask`: `[batch, len]` -- `1.0` at real tokens
    /// - returns: `[batch, D, len]`
    ///
    /// # Errors
    ///
    /// Returns [`QaError::Model`](crate::QaError::Model) on shape mismatch or
    /// tensor operation failures.
    pub fn forward(
        &self,
        x: &Tensor,
        mask: &Tensor,
        block: BlockId,
        hooks: &HookSpec,
        cache: &mut HookCache,
    ) -> Result<Tensor> {
        let (batch, _d, len) = x.dims3()?;
        let d = self.num_heads * self.head_dim;

        // [batch, D, len] -> [batch, len, D]
        let x = x.transpose(1, 2)?.contiguous()?;

        // [batch, len, D] -> [batch, heads, len, head_dim]
        let split = |t: Tensor| -> Result<Tensor> {
            Ok(t.reshape((batch, len, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let q = split(self.q_proj.forward(&x)?)?;
        let k = split(self.k_proj.forward(&x)?)?;
        let v = split(self.v_proj.forward(&x)?)?;

        let mask = mask.to_dtype(x.dtype())?;
        let key_mask = mask.reshape((batch, 1, 1, len))?;
        let query_mask = mask.reshape((batch, 1, len, 1))?;

        // --- Scores ---
        let scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * self.scale)?;
        let scores = mask_logits(&scores, &key_mask)?;
        let scores = hooks.observe(HookPoint::AttnScores(block), scores, cache)?;

        // --- Pattern ---
        let pattern = candle_nn::ops::softmax_last_dim(&scores)?;
        let pattern = pattern
            .broadcast_mul(&key_mask)?
            .broadcast_mul(&query_mask)?;
        let pattern = hooks.observe(HookPoint::AttnPattern(block), pattern, cache)?;

        // --- Output ---
        let attn = pattern
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, len, d))?;
        let out = self.o_proj.forward(&attn)?;
        Ok(out.transpose(1, 2)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
