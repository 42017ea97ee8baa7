// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fusion of word and character embeddings into one channel-first stream.

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::config::QaNetConfig;
use crate::error::{QaError, Result};
use crate::util::dropout::{Mode, dropout};

use super::conv::DepthwiseSeparableConv;
use super::highway::Highway;

/// Char-grid convolution plus max-pool, concatenated with word vectors and
/// passed through a two-layer highway network.
pub struct EmbeddingFusion {
    /// 2-D depthwise separable conv over `(len, char_limit)`.
    conv2d: DepthwiseSeparableConv,
    /// Highway over the fused `Dw + Dc` channels.
    high: Highway,
    /// Word dimension `Dw`.
    word_dim: usize,
    /// Char dimension `Dc`.
    char_dim: usize,
    /// Word dropout rate.
    dropout: f64,
    /// Char dropout rate.
    dropout_char: f64,
}

impl EmbeddingFusion {
    /// Build the fusion layer.
    ///
    /// # Errors
    ///
    /// Returns [`QaError::Model`] if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn new(config: &QaNetConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let dc = config.char_dim;
        Ok(Self {
            conv2d: DepthwiseSeparableConv::new(
                dc,
                dc,
                config.char_kernel,
                2,
                true,
                vb.pp("conv2d"),
            )?,
            high: Highway::new(2, config.embedding_dim(), vb.pp("high"))?,
            word_dim: config.glove_dim,
            char_dim: dc,
            dropout: config.dropout,
            dropout_char: config.dropout_char,
        })
    }

    /// Fuse already looked-up embeddings.
    ///
    /// # Shapes
    /// - `ch`: `[batch, len, char_limit, Dc]`
    /// - `wd`: `[batch, len, Dw]`
    /// - returns: `[batch, Dw + Dc, len]`
    ///
    /// # Errors
    ///
    /// Returns [`QaError::Shape`] if the two inputs disagree on batch or
    /// length or have the wrong channel widths, and [`QaError::Model`] on
    /// tensor operation failures.
    pub fn forward(&self, ch: &Tensor, wd: &Tensor, mode: Mode) -> Result<Tensor> {
        let (batch, len, _lch, dc) = ch.dims4()?;
        let (wb, wl, dw) = wd.dims3()?;
        if (wb, wl) != (batch, len) {
            return Err(QaError::Shape(format!(
                "char embeddings are [{batch}, {len}, ..], word embeddings are [{wb}, {wl}, ..]"
            )));
        }
        if dc != self.char_dim || dw != self.word_dim {
            return Err(QaError::Shape(format!(
                "expected embedding widths (Dw={}, Dc={}), got (Dw={dw}, Dc={dc})",
                self.word_dim, self.char_dim
            )));
        }

        // [batch, len, Lch, Dc] -> [batch, Dc, len, Lch]
        let ch = ch.permute((0, 3, 1, 2))?;
        let ch = dropout(&ch, self.dropout_char, mode)?;
        let ch = self.conv2d.forward(&ch)?.relu()?.max(3)?;

        let wd = dropout(wd, self.dropout, mode)?;
        let wd = wd.transpose(1, 2)?;

        let emb = Tensor::cat(&[&ch, &wd], 1)?;
        self.high.forward(&emb)
    }
}
