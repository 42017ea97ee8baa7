// SPDX-License-Identifier: MIT OR Apache-2.0

//! Encoder block (conv stack, self-attention, feed-forward) and the shared
//! model encoder that repeats one block.

use std::sync::Arc;

use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::config::QaNetConfig;
use crate::error::{QaError, Result};
use crate::hooks::{BlockId, HookCache, HookPoint, HookSpec};
use crate::util::dropout::{Mode, dropout};

use super::attention::SelfAttention;
use super::conv::DepthwiseSeparableConv;
use super::init::dense;
use super::norm::SeqLayerNorm;
use super::position::PositionalEncoder;

// ---------------------------------------------------------------------------
// EncoderBlock
// ---------------------------------------------------------------------------

/// One QANet encoder block over a sequence of fixed length `L`.
///
/// ```text
/// x -> pos -> normb -> [conv -> relu -> +res -> (dropout) -> norms[i]] * n
///   -> self_att -> +res -> dropout -> norme -> fc -> relu -> +res -> dropout
/// ```
///
/// Convolutions with an even 1-based index get progressive dropout
/// `dropout * (i + 1) / n`.
pub struct EncoderBlock {
    /// Learned position table.
    pos: PositionalEncoder,
    /// Convolution stack.
    convs: Vec<DepthwiseSeparableConv>,
    /// Norm before the first convolution.
    normb: SeqLayerNorm,
    /// Norm after each convolution.
    norms: Vec<SeqLayerNorm>,
    /// Norm before the feed-forward layer.
    norme: SeqLayerNorm,
    /// Multi-head self-attention.
    self_att: SelfAttention,
    /// Feed-forward projection over channels.
    fc: Linear,
    /// Fixed sequence length.
    length: usize,
    /// Base dropout rate.
    dropout: f64,
}

impl EncoderBlock {
    /// Build a block with `conv_num` convolutions of kernel `kernel` over
    /// sequences of exactly `length` positions and `D = config.connector_dim`
    /// channels.
    ///
    /// # Errors
    ///
    /// Returns [`QaError::Config`] for a zero kernel and
    /// [`QaError::Model`] if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn new(
        config: &QaNetConfig,
        conv_num: usize,
        kernel: usize,
        length: usize,
        vb: VarBuilder<'_>,
    ) -> Result<Self> {
        let d = config.connector_dim;
        let eps = config.norm_eps;

        let mut convs = Vec::with_capacity(conv_num);
        let mut norms = Vec::with_capacity(conv_num);
        for i in 0..conv_num {
            convs.push(DepthwiseSeparableConv::new(
                d,
                d,
                kernel,
                1,
                true,
                vb.pp(format!("convs.{i}")),
            )?);
            norms.push(SeqLayerNorm::new(d, length, eps, vb.pp(format!("norms.{i}")))?);
        }

        Ok(Self {
            pos: PositionalEncoder::new(length, d, vb.pp("pos"))?,
            convs,
            normb: SeqLayerNorm::new(d, length, eps, vb.pp("normb"))?,
            norms,
            norme: SeqLayerNorm::new(d, length, eps, vb.pp("norme"))?,
            self_att: SelfAttention::new(config, vb.pp("self_att"))?,
            fc: dense(d, d, true, vb.pp("fc"))?,
            length,
            dropout: config.dropout,
        })
    }

    /// Run the block.
    ///
    /// `block` names this invocation for hook lookup.
    ///
    /// # Shapes
    /// - `x`: `[batch, D, L]`
    /// - `mask`: `[batch, L]`
    /// - returns: `[batch, D, L]`
    ///
    /// # Errors
    ///
    /// Returns [`QaError::Shape`] if the input length is not exactly `L`,
    /// and [`QaError::Model`] on tensor operation failures.
    pub fn forward(
        &self,
        x: &Tensor,
        mask: &Tensor,
        mode: Mode,
        block: BlockId,
        hooks: &HookSpec,
        cache: &mut HookCache,
    ) -> Result<Tensor> {
        let (_batch, _d, len) = x.dims3()?;
        if len != self.length {
            return Err(QaError::Shape(format!(
                "{block} expects sequences of length {}, got {len}",
                self.length
            )));
        }

        let out = self.pos.forward(x)?;
        let out = hooks.observe(HookPoint::ResidPre(block), out, cache)?;

        // --- Convolution stack ---
        let mut res = out.clone();
        let mut out = self.normb.forward(&out)?;
        let conv_num = self.convs.len();
        for (i, (conv, norm)) in self.convs.iter().zip(&self.norms).enumerate() {
            out = (conv.forward(&out)?.relu()? + &res)?;
            if (i + 1) % 2 == 0 {
                #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
                let p = self.dropout * (i + 1) as f64 / conv_num as f64;
                out = dropout(&out, p, mode)?;
            }
            out = hooks.observe(HookPoint::ConvOut(block, i), out, cache)?;
            res = out.clone();
            out = norm.forward(&out)?;
        }

        // --- Self-attention ---
        let attn = self.self_att.forward(&out, mask, block, hooks, cache)?;
        let attn = hooks.observe(HookPoint::AttnOut(block), attn, cache)?;
        let out = dropout(&(attn + &res)?, self.dropout, mode)?;

        // --- Feed-forward ---
        let res = out.clone();
        let out = self.norme.forward(&out)?;
        // [batch, D, L] -> [batch, L, D] -> fc -> back
        let out = self
            .fc
            .forward(&out.transpose(1, 2)?.contiguous()?)?
            .transpose(1, 2)?
            .relu()?;
        let out = dropout(&(out + res)?, self.dropout, mode)?;
        hooks.observe(HookPoint::ResidPost(block), out, cache)
    }

    /// Fixed sequence length `L`.
    #[must_use]
    pub const fn length(&self) -> usize {
        self.length
    }
}

// ---------------------------------------------------------------------------
// ModelEncoder
// ---------------------------------------------------------------------------

/// The model encoder: one [`EncoderBlock`] applied `repeats` times.
///
/// Every repeat of every pass shares the same parameters.
pub struct ModelEncoder {
    /// The single shared block.
    block: Arc<EncoderBlock>,
    /// Applications per pass.
    repeats: usize,
}

impl ModelEncoder {
    /// Wrap a block for `repeats` applications per pass.
    #[must_use]
    pub const fn new(block: Arc<EncoderBlock>, repeats: usize) -> Self {
        Self { block, repeats }
    }

    /// Run pass `pass` (0, 1 or 2): the block applied `repeats` times in
    /// sequence.
    ///
    /// # Shapes
    /// - `x`: `[batch, D, Lc]`
    /// - `mask`: `[batch, Lc]`
    /// - returns: `[batch, D, Lc]`
    ///
    /// # Errors
    ///
    /// Propagates errors from [`EncoderBlock::forward`].
    pub fn forward(
        &self,
        x: &Tensor,
        mask: &Tensor,
        mode: Mode,
        pass: usize,
        hooks: &HookSpec,
        cache: &mut HookCache,
    ) -> Result<Tensor> {
        let mut out = x.clone();
        for repeat in 0..self.repeats {
            out = self
                .block
                .forward(&out, mask, mode, BlockId::Model { pass, repeat }, hooks, cache)?;
        }
        hooks.observe(HookPoint::ModelEncoderOut(pass), out, cache)
    }

    /// The shared block.
    #[must_use]
    pub const fn block(&self) -> &Arc<EncoderBlock> {
        &self.block
    }

    /// Applications per pass.
    #[must_use]
    pub const fn repeats(&self) -> usize {
        self.repeats
    }
}
