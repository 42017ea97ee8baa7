// SPDX-License-Identifier: MIT OR Apache-2.0

//! Depthwise separable convolution in 1-D (sequence) or 2-D (char grid) form.
//!
//! A depthwise pass (`groups = in_channels`, same-length padding `k / 2`)
//! followed by a 1×1 pointwise pass that mixes channels.

use candle_core::{Module, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, Conv2d, Conv2dConfig, Init, VarBuilder};

use crate::error::{QaError, Result};

use super::init::{fan_in_bound, uniform};

// ---------------------------------------------------------------------------
// ConvPair
// ---------------------------------------------------------------------------

/// The two convolution stages, specialized to one dimensionality.
enum ConvPair {
    /// Sequence convolution over `[batch, channels, len]`.
    OneD {
        /// Per-channel spatial filter.
        depthwise: Conv1d,
        /// Channel mixing 1×1 filter.
        pointwise: Conv1d,
    },
    /// Grid convolution over `[batch, channels, height, width]`.
    TwoD {
        /// Per-channel spatial filter.
        depthwise: Conv2d,
        /// Channel mixing 1×1 filter.
        pointwise: Conv2d,
    },
}

// ---------------------------------------------------------------------------
// DepthwiseSeparableConv
// ---------------------------------------------------------------------------

/// Factored convolution: depthwise spatial filter, then pointwise channel mix.
///
/// Weight names are `depthwise_conv.{weight,bias}` and
/// `pointwise_conv.{weight,bias}`.
pub struct DepthwiseSeparableConv {
    /// Convolution stages.
    convs: ConvPair,
    /// Output channel count.
    out_channels: usize,
}

impl DepthwiseSeparableConv {
    /// Build a depthwise separable convolution.
    ///
    /// `dim` selects the mode: `1` for sequences, `2` for character grids.
    /// Depthwise weights use Kaiming-normal (fan-in, `ReLU` gain), pointwise
    /// weights uniform `±1/sqrt(in_channels)`, all biases start at zero.
    ///
    /// # Errors
    ///
    /// Returns [`QaError::Config`] if `dim` is not 1 or 2, or `kernel` is not
    /// a positive odd size, and [`QaError::Model`] if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        dim: usize,
        bias: bool,
        vb: VarBuilder<'_>,
    ) -> Result<Self> {
        if kernel.is_multiple_of(2) {
            return Err(QaError::Config(format!(
                "convolution kernel size must be odd to keep the length, got {kernel}"
            )));
        }
        let vb_dw = vb.pp("depthwise_conv");
        let vb_pw = vb.pp("pointwise_conv");
        let pw_init = uniform(fan_in_bound(in_channels));

        let load_bias = |vb: &VarBuilder<'_>, n: usize| -> Result<Option<Tensor>> {
            if bias {
                Ok(Some(vb.get_with_hints(n, "bias", Init::Const(0.0))?))
            } else {
                Ok(None)
            }
        };

        let convs = match dim {
            1 => {
                let dw_weight = vb_dw.get_with_hints(
                    (in_channels, 1, kernel),
                    "weight",
                    candle_nn::init::DEFAULT_KAIMING_NORMAL,
                )?;
                let pw_weight =
                    vb_pw.get_with_hints((out_channels, in_channels, 1), "weight", pw_init)?;
                let dw_cfg = Conv1dConfig {
                    padding: kernel / 2,
                    groups: in_channels,
                    ..Default::default()
                };
                ConvPair::OneD {
                    depthwise: Conv1d::new(dw_weight, load_bias(&vb_dw, in_channels)?, dw_cfg),
                    pointwise: Conv1d::new(
                        pw_weight,
                        load_bias(&vb_pw, out_channels)?,
                        Conv1dConfig::default(),
                    ),
                }
            }
            2 => {
                let dw_weight = vb_dw.get_with_hints(
                    (in_channels, 1, kernel, kernel),
                    "weight",
                    candle_nn::init::DEFAULT_KAIMING_NORMAL,
                )?;
                let pw_weight =
                    vb_pw.get_with_hints((out_channels, in_channels, 1, 1), "weight", pw_init)?;
                let dw_cfg = Conv2dConfig {
                    padding: kernel / 2,
                    groups: in_channels,
                    ..Default::default()
                };
                ConvPair::TwoD {
                    depthwise: Conv2d::new(dw_weight, load_bias(&vb_dw, in_channels)?, dw_cfg),
                    pointwise: Conv2d::new(
                        pw_weight,
                        load_bias(&vb_pw, out_channels)?,
                        Conv2dConfig::default(),
                    ),
                }
            }
            other => {
                return Err(QaError::Config(format!(
                    "depthwise separable convolution supports 1-D or 2-D, got {other}-D"
                )));
            }
        };

        Ok(Self {
            convs,
            out_channels,
        })
    }

    /// Apply depthwise then pointwise convolution.
    ///
    /// # Shapes
    /// - 1-D: `x` `[batch, in_channels, len]` -> `[batch, out_channels, len]`
    /// - 2-D: `x` `[batch, in_channels, h, w]` -> `[batch, out_channels, h, w]`
    ///
    /// # Errors
    ///
    /// Returns [`QaError::Model`] if `x` has the wrong rank or channel count.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // CONTIGUOUS: inputs often arrive transposed; conv kernels want dense layout
        let x = x.contiguous()?;
        match &self.convs {
            ConvPair::OneD {
                depthwise,
                pointwise,
            } => Ok(pointwise.forward(&depthwise.forward(&x)?)?),
            ConvPair::TwoD {
                depthwise,
                pointwise,
            } => Ok(pointwise.forward(&depthwise.forward(&x)?)?),
        }
    }

    /// Output channel count.
    #[must_use]
    pub const fn out_channels(&self) -> usize {
        self.out_channels
    }
}
