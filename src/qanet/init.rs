// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parameter initializers matching the PyTorch module defaults.
//!
//! Each helper fetches its tensors through a [`VarBuilder`]: with a
//! `VarMap` backend the init hint creates a fresh trainable variable, with a
//! safetensors backend the hint is ignored and the stored value is loaded.

use candle_nn::{Init, Linear, VarBuilder};

use crate::error::Result;

/// Symmetric uniform initializer on `[-bound, bound]`.
pub(crate) const fn uniform(bound: f64) -> Init {
    Init::Uniform {
        lo: -bound,
        up: bound,
    }
}

/// `1 / sqrt(fan_in)`, the bound of PyTorch's default `Linear`/`Conv` init.
pub(crate) fn fan_in_bound(fan_in: usize) -> f64 {
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    let fan_in = fan_in as f64;
    1.0 / fan_in.sqrt()
}

/// Dense layer with PyTorch `nn.Linear` default init
/// (weight and bias uniform on `±1/sqrt(in_dim)`).
#[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
pub(crate) fn dense(
    in_dim: usize,
    out_dim: usize,
    bias: bool,
    vb: VarBuilder<'_>,
) -> Result<Linear> {
    let bound = fan_in_bound(in_dim);
    let weight = vb.get_with_hints((out_dim, in_dim), "weight", uniform(bound))?;
    let bias = if bias {
        Some(vb.get_with_hints(out_dim, "bias", uniform(bound))?)
    } else {
        None
    };
    Ok(Linear::new(weight, bias))
}

/// Bias-free dense layer with Xavier-uniform init
/// (`±sqrt(6 / (in_dim + out_dim))`).
#[allow(clippy::needless_pass_by_value)] // VarBuilder convention
pub(crate) fn xavier_no_bias(in_dim: usize, out_dim: usize, vb: VarBuilder<'_>) -> Result<Linear> {
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    let bound = (6.0 / (in_dim + out_dim) as f64).sqrt();
    let weight = vb.get_with_hints((out_dim, in_dim), "weight", uniform(bound))?;
    Ok(Linear::new(weight, None))
}
