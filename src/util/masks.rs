// SPDX-License-Identifier: MIT OR Apache-2.0

//! Padding masks and masked logits.
//!
//! Index `0` is the padding token everywhere.  A mask is an `f32` tensor
//! holding `1.0` at real tokens and `0.0` at padding, always derived from
//! the index tensor it describes.

use candle_core::{DType, Tensor};

use crate::error::{QaError, Result};

/// Value written into masked logit positions before a softmax.
///
/// Large enough that `exp` underflows to exactly zero, small enough to stay
/// finite in `f32`.
pub const NEG_LARGE: f64 = -1e30;

/// Replace masked positions of `target` with [`NEG_LARGE`].
///
/// Computes `target * mask + (1 - mask) * NEG_LARGE`.  Unmasked positions
/// come back bit-identical to `target`.
///
/// # Shapes
/// - `target`: any shape
/// - `mask`: broadcast-compatible with `target`, values in `{0, 1}`
/// - returns: broadcast shape of `target` and `mask`
///
/// # Errors
///
/// Returns [`QaError::Model`] if the shapes do not broadcast.
pub fn mask_logits(target: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let mask = mask.to_dtype(target.dtype())?;
    // (1 - mask) * NEG_LARGE folded into one affine: mask * 1e30 - 1e30
    let fill = mask.affine(-NEG_LARGE, NEG_LARGE)?;
    Ok(target.broadcast_mul(&mask)?.broadcast_add(&fill)?)
}

/// Derive the `f32` validity mask of an index tensor (`1.0` where `id != 0`).
///
/// # Shapes
/// - `ids`: `[batch, len]` -- integer token indices
/// - returns: `[batch, len]` -- `f32` mask
///
/// # Errors
///
/// Returns [`QaError::Model`] on tensor operation failure.
pub fn padding_mask(ids: &Tensor) -> Result<Tensor> {
    let zeros = ids.zeros_like()?;
    Ok(ids.ne(&zeros)?.to_dtype(DType::F32)?)
}

/// Reject masks containing values other than `0.0` and `1.0`.
///
/// The attention components assume binary masks; a fractional mask would
/// leak a scaled `NEG_LARGE` into the logits.
///
/// # Errors
///
/// Returns [`QaError::Shape`] if any entry is not exactly `0` or `1`
/// (including `NaN`).
pub fn ensure_binary(mask: &Tensor) -> Result<()> {
    let mask = mask.to_dtype(DType::F32)?;
    // m * (1 - m) vanishes exactly on {0, 1}
    let off = mask
        .mul(&mask.affine(-1.0, 1.0)?)?
        .abs()?
        .sum_all()?
        .to_scalar::<f32>()?;
    if off.is_nan() || off > 0.0 {
        return Err(QaError::Shape(format!(
            "mask must contain only 0.0 and 1.0 (off-binary mass {off})"
        )));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use candle_core::Device;

    use super::*;

    #[test]
    fn masked_positions_are_large_negative() {
        let target = Tensor::new(&[[3.5f32, -1e20, 7.0, 1e20]], &Device::Cpu).unwrap();
        let mask = Tensor::new(&[[1.0f32, 1.0, 0.0, 0.0]], &Device::Cpu).unwrap();
        let out: Vec<f32> = mask_logits(&target, &mask)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(out[0], 3.5);
        assert_eq!(out[1], -1e20);
        // Masked value is independent of the target magnitude.
        assert_eq!(out[2], out[3]);
        assert!(out[2] < -1e29);
    }

    #[test]
    fn mask_broadcasts_over_heads() {
        let scores = Tensor::zeros((2, 3, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let mask = Tensor::ones((2, 1, 1, 4), DType::F32, &Device::Cpu).unwrap();
        let out = mask_logits(&scores, &mask).unwrap();
        assert_eq!(out.dims(), &[2, 3, 4, 4]);
    }

    #[test]
    fn padding_mask_from_ids() {
        let ids = Tensor::new(&[[4u32, 9, 0, 0], [1, 2, 3, 0]], &Device::Cpu).unwrap();
        let mask: Vec<Vec<f32>> = padding_mask(&ids).unwrap().to_vec2().unwrap();
        assert_eq!(mask, vec![vec![1.0, 1.0, 0.0, 0.0], vec![1.0, 1.0, 1.0, 0.0]]);
    }

    #[test]
    fn ensure_binary_accepts_and_rejects() {
        let good = Tensor::new(&[1.0f32, 0.0, 1.0], &Device::Cpu).unwrap();
        assert!(ensure_binary(&good).is_ok());
        let bad = Tensor::new(&[1.0f32, 0.5, 1.0], &Device::Cpu).unwrap();
        assert!(ensure_binary(&bad).is_err());
    }
}
