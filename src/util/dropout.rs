// SPDX-License-Identifier: MIT OR Apache-2.0

//! Execution mode and mode-aware dropout.

use candle_core::Tensor;

use crate::error::Result;

/// Execution mode passed explicitly to every forward call.
///
/// Dropout is the only behavior that depends on it: active in
/// [`Train`](Self::Train), identity in [`Eval`](Self::Eval).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Training: dropout is sampled from the device RNG.
    Train,
    /// Inference: deterministic, all dropout is identity.
    #[default]
    Eval,
}

impl Mode {
    /// Whether stochastic training-only behavior is active.
    #[must_use]
    pub const fn is_train(self) -> bool {
        matches!(self, Self::Train)
    }
}

/// Inverted dropout with drop probability `p`, active only in [`Mode::Train`].
///
/// # Errors
///
/// Returns [`QaError::Model`](crate::QaError::Model) if `p` is outside
/// `[0, 1)` or the tensor operation fails.
pub fn dropout(x: &Tensor, p: f64, mode: Mode) -> Result<Tensor> {
    if !mode.is_train() || p <= 0.0 {
        return Ok(x.clone());
    }
    #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
    let p = p as f32;
    Ok(candle_nn::ops::dropout(x, p)?)
}
