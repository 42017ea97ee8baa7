// SPDX-License-Identifier: MIT OR Apache-2.0

//! Context-query co-attention with a trilinear similarity function.

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::config::QaNetConfig;
use crate::error::Result;
use crate::hooks::{HookCache, HookPoint, HookSpec};
use crate::util::dropout::{Mode, dropout};
use crate::util::masks::mask_logits;

use super::init::uniform;

/// Bidirectional attention between context and question encodings.
///
/// The similarity `S[b, i, j] = w · [c_i; q_j; c_i ⊙ q_j]` is evaluated as
/// `c_i · w_c + q_j · w_q + (c_i ⊙ w_cq) · q_j`, which never builds the
/// `[batch, Lc, Lq, 3D]` concatenation.
pub struct ContextQueryAttention {
    /// Trilinear weight `[3D]`, laid out as `[w_c; w_q; w_cq]`.
    w: Tensor,
    /// Model dimension `D`.
    dim: usize,
    /// Output dropout rate.
    dropout: f64,
}

impl ContextQueryAttention {
    /// Create the layer; `w` is uniform on `±sqrt(1/D)`.
    ///
    /// # Errors
    ///
    /// Returns [`QaError::Model`](crate::QaError::Model) if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn new(config: &QaNetConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let d = config.connector_dim;
        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let bound = (1.0 / d as f64).sqrt();
        let w = vb.get_with_hints(3 * d, "w", uniform(bound))?;
        Ok(Self {
            w,
            dim: d,
            dropout: config.dropout,
        })
    }

    /// Co-attend context and question.
    ///
    /// # Shapes
    /// - `c`: `[batch, D, Lc]`, `q`: `[batch, D, Lq]`
    /// - `cmask`: `[batch, Lc]`, `qmask`: `[batch, Lq]`
    /// - returns: `[batch, 4D, Lc]` -- `[C; A; C⊙A; C⊙B]`
    ///
    /// # Errors
    ///
    /// Returns [`QaError::Model`](crate::QaError::Model) on shape mismatch or
    /// tensor operation failures.
    #[allow(clippy::too_many_arguments, clippy::many_single_char_names)]
    pub fn forward(
        &self,
        c: &Tensor,
        q: &Tensor,
        cmask: &Tensor,
        qmask: &Tensor,
        mode: Mode,
        hooks: &HookSpec,
        cache: &mut HookCache,
    ) -> Result<Tensor> {
        let d = self.dim;
        // [batch, D, len] -> [batch, len, D]
        let c = c.transpose(1, 2)?.contiguous()?;
        let q = q.transpose(1, 2)?.contiguous()?;
        let (batch, lc, _) = c.dims3()?;
        let lq = q.dim(1)?;

        let w = self.w.to_dtype(c.dtype())?;
        let w_c = w.narrow(0, 0, d)?.reshape((1, 1, d))?;
        let w_q = w.narrow(0, d, d)?.reshape((1, 1, d))?;
        let w_cq = w.narrow(0, 2 * d, d)?.reshape((1, 1, d))?;

        // --- Trilinear similarity [batch, Lc, Lq] ---
        let s_c = c.broadcast_mul(&w_c)?.sum_keepdim(2)?; // [batch, Lc, 1]
        let s_q = q.broadcast_mul(&w_q)?.sum(2)?.unsqueeze(1)?; // [batch, 1, Lq]
        let s_cq = c
            .broadcast_mul(&w_cq)?
            .matmul(&q.transpose(1, 2)?.contiguous()?)?;
        let s = s_cq.broadcast_add(&s_c)?.broadcast_add(&s_q)?;
        let s = hooks.observe(HookPoint::CqSimilarity, s, cache)?;

        let cmask = cmask.to_dtype(c.dtype())?.reshape((batch, lc, 1))?;
        let qmask = qmask.to_dtype(c.dtype())?.reshape((batch, 1, lq))?;

        // --- Attention weights ---
        let s1 = candle_nn::ops::softmax_last_dim(&mask_logits(&s, &qmask)?)?;
        let s1 = hooks.observe(HookPoint::CqContextToQuery, s1, cache)?;
        let s2 = candle_nn::ops::softmax(&mask_logits(&s, &cmask)?, 1)?;
        let s2 = hooks.observe(HookPoint::CqQueryToContext, s2, cache)?;

        // --- Attended vectors ---
        let a = s1.matmul(&q)?;
        let b = s1
            .matmul(&s2.transpose(1, 2)?.contiguous()?)?
            .matmul(&c)?;

        let out = Tensor::cat(&[&c, &a, &(&c * &a)?, &(&c * &b)?], 2)?;
        let out = dropout(&out, self.dropout, mode)?;
        hooks.observe(HookPoint::CqOut, out.transpose(1, 2)?, cache)
    }
}
