// SPDX-License-Identifier: MIT OR Apache-2.0

//! QANet hyperparameters and JSON config parsing.
//!
//! [`QaNetConfig`] is built once, validated, and then threaded by reference
//! through every component constructor.  Derived values (head dimension,
//! attention scale, fused embedding width) are methods so they can never go
//! stale.
//!
//! # Usage
//!
//! ```
//! use candle_qanet::QaNetConfig;
//!
//! let json = serde_json::json!({
//!     "connector_dim": 128, "num_heads": 8,
//!     "glove_dim": 300, "char_dim": 64,
//!     "para_limit": 400, "ques_limit": 50
//! });
//! let config = QaNetConfig::from_json(&json).unwrap();
//! assert_eq!(config.head_dim(), 16);
//! assert_eq!(config.char_limit, 16);
//! ```

use serde_json::Value;

use crate::error::{QaError, Result};

// ---------------------------------------------------------------------------
// QaNetConfig
// ---------------------------------------------------------------------------

/// Configuration for a QANet model.
///
/// Field names follow the common QANet PyTorch config keys so an
/// existing JSON config can be passed to [`from_json`](Self::from_json)
/// unchanged.
#[derive(Debug, Clone, PartialEq)]
#[allow(clippy::struct_excessive_bools)]
pub struct QaNetConfig {
    // --- Dimensions ----------------------------------------------------------
    /// Model (connector) dimension `D` shared by every encoder block.
    pub connector_dim: usize,
    /// Number of self-attention heads.
    pub num_heads: usize,
    /// Word embedding width (columns of the pretrained word matrix).
    pub glove_dim: usize,
    /// Character embedding width (columns of the pretrained char matrix).
    pub char_dim: usize,

    // --- Sequence limits -----------------------------------------------------
    /// Context length `Lc`.  Context inputs must be padded to exactly this.
    pub para_limit: usize,
    /// Question length `Lq`.  Question inputs must be padded to exactly this.
    pub ques_limit: usize,
    /// Characters per token.
    pub char_limit: usize,

    // --- Regularization ------------------------------------------------------
    /// Base dropout rate for word embeddings and encoder sub-layers.
    pub dropout: f64,
    /// Dropout rate for character embeddings.
    pub dropout_char: f64,

    // --- Embedding tables ----------------------------------------------------
    /// Freeze the pretrained character table (no gradient updates).
    pub pretrained_char: bool,
    /// Freeze the pretrained word table (no gradient updates).
    pub freeze_word: bool,

    // --- Encoder geometry ----------------------------------------------------
    /// Convolutions per embedding encoder block.
    pub emb_encoder_convs: usize,
    /// Kernel size of the embedding encoder convolutions.
    pub emb_encoder_kernel: usize,
    /// Convolutions per model encoder block.
    pub model_encoder_convs: usize,
    /// Kernel size of the model encoder convolutions.
    pub model_encoder_kernel: usize,
    /// How many times the shared model encoder block runs per pass.
    pub model_encoder_blocks: usize,
    /// Kernel size of the character grid convolution.
    pub char_kernel: usize,
    /// Kernel size of the stream projection and co-attention resizing convs.
    pub projection_kernel: usize,
    /// Epsilon for the encoder layer norms.
    pub norm_eps: f64,
}

impl QaNetConfig {
    /// Parse a [`QaNetConfig`] from a JSON object.
    ///
    /// `connector_dim`, `num_heads`, `glove_dim`, `char_dim`, `para_limit`
    /// and `ques_limit` are required; every other key has a default taken
    /// from the QANet paper setup.  The result is validated before it is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns [`QaError::Config`] if a required field is missing or the
    /// values fail [`validate`](Self::validate).
    pub fn from_json(config: &Value) -> Result<Self> {
        let parsed = Self {
            connector_dim: get_usize(config, "connector_dim")?,
            num_heads: get_usize(config, "num_heads")?,
            glove_dim: get_usize(config, "glove_dim")?,
            char_dim: get_usize(config, "char_dim")?,

            para_limit: get_usize(config, "para_limit")?,
            ques_limit: get_usize(config, "ques_limit")?,
            char_limit: get_usize_or(config, "char_limit", 16),

            dropout: get_f64_or(config, "dropout", 0.1),
            dropout_char: get_f64_or(config, "dropout_char", 0.05),

            pretrained_char: get_bool_or(config, "pretrained_char", false),
            freeze_word: get_bool_or(config, "freeze_word", true),

            emb_encoder_convs: get_usize_or(config, "emb_encoder_convs", 4),
            emb_encoder_kernel: get_usize_or(config, "emb_encoder_kernel", 7),
            model_encoder_convs: get_usize_or(config, "model_encoder_convs", 2),
            model_encoder_kernel: get_usize_or(config, "model_encoder_kernel", 5),
            model_encoder_blocks: get_usize_or(config, "model_encoder_blocks", 7),
            char_kernel: get_usize_or(config, "char_kernel", 5),
            projection_kernel: get_usize_or(config, "projection_kernel", 5),
            norm_eps: get_f64_or(config, "norm_eps", 1e-5),
        };
        parsed.validate()?;
        Ok(parsed)
    }

    /// Check internal consistency of the hyperparameters.
    ///
    /// # Errors
    ///
    /// Returns [`QaError::Config`] if a size is zero, `connector_dim` is not
    /// divisible by `num_heads`, a kernel size is even, a dropout rate is
    /// outside `[0, 1)`, or `norm_eps` is not a positive finite number.
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("connector_dim", self.connector_dim),
            ("num_heads", self.num_heads),
            ("glove_dim", self.glove_dim),
            ("char_dim", self.char_dim),
            ("para_limit", self.para_limit),
            ("ques_limit", self.ques_limit),
            ("char_limit", self.char_limit),
            ("emb_encoder_convs", self.emb_encoder_convs),
            ("model_encoder_convs", self.model_encoder_convs),
            ("model_encoder_blocks", self.model_encoder_blocks),
        ];
        for (key, value) in sizes {
            if value == 0 {
                return Err(QaError::Config(format!("'{key}' must be nonzero")));
            }
        }

        if !self.connector_dim.is_multiple_of(self.num_heads) {
            return Err(QaError::Config(format!(
                "connector_dim {} is not divisible by num_heads {}",
                self.connector_dim, self.num_heads
            )));
        }

        // Even kernels would shift the sequence under `k / 2` padding.
        let kernels = [
            ("emb_encoder_kernel", self.emb_encoder_kernel),
            ("model_encoder_kernel", self.model_encoder_kernel),
            ("char_kernel", self.char_kernel),
            ("projection_kernel", self.projection_kernel),
        ];
        for (key, k) in kernels {
            if k.is_multiple_of(2) {
                return Err(QaError::Config(format!(
                    "'{key}' must be odd for same-length padding, got {k}"
                )));
            }
        }

        for (key, p) in [("dropout", self.dropout), ("dropout_char", self.dropout_char)] {
            if !(0.0..1.0).contains(&p) {
                return Err(QaError::Config(format!(
                    "'{key}' must be in [0, 1), got {p}"
                )));
            }
        }

        if !self.norm_eps.is_finite() || self.norm_eps <= 0.0 {
            return Err(QaError::Config(format!(
                "'norm_eps' must be positive and finite, got {}",
                self.norm_eps
            )));
        }
        Ok(())
    }

    /// Dimension per attention head (`D / num_heads`).
    #[must_use]
    pub const fn head_dim(&self) -> usize {
        self.connector_dim / self.num_heads
    }

    /// Attention score scale `1 / sqrt(head_dim)`.
    #[must_use]
    pub fn attention_scale(&self) -> f64 {
        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let head_dim = self.head_dim() as f64;
        1.0 / head_dim.sqrt()
    }

    /// Width of the fused word+char embedding (`glove_dim + char_dim`).
    #[must_use]
    pub const fn embedding_dim(&self) -> usize {
        self.glove_dim + self.char_dim
    }

    /// Channel width of the co-attention output (`4 * D`).
    #[must_use]
    pub const fn cq_dim(&self) -> usize {
        4 * self.connector_dim
    }
}

// ---------------------------------------------------------------------------
// JSON extraction helpers
// ---------------------------------------------------------------------------

/// Extract a required `usize` field from a JSON object.
fn get_usize(config: &Value, key: &str) -> Result<usize> {
    let val = config
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| QaError::Config(format!("missing or invalid field '{key}'")))?;
    usize::try_from(val)
        .map_err(|_| QaError::Config(format!("field '{key}' value {val} overflows usize")))
}

/// Extract an optional `usize` field, returning a default if absent.
fn get_usize_or(config: &Value, key: &str, default: usize) -> usize {
    config
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| usize::try_from(v).ok())
        .unwrap_or(default)
}

/// Extract an `f64` field, returning a default if absent.
fn get_f64_or(config: &Value, key: &str, default: f64) -> f64 {
    config.get(key).and_then(Value::as_f64).unwrap_or(default)
}

/// Extract a `bool` field, returning a default if absent.
fn get_bool_or(config: &Value, key: &str, default: bool) -> bool {
    config.get(key).and_then(Value::as_bool).unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn base_json() -> Value {
        serde_json::json!({
            "connector_dim": 128,
            "num_heads": 8,
            "glove_dim": 300,
            "char_dim": 64,
            "para_limit": 400,
            "ques_limit": 50
        })
    }

    #[test]
    fn parse_defaults() {
        let config = QaNetConfig::from_json(&base_json()).unwrap();
        assert_eq!(config.connector_dim, 128);
        assert_eq!(config.char_limit, 16);
        assert_eq!(config.emb_encoder_convs, 4);
        assert_eq!(config.emb_encoder_kernel, 7);
        assert_eq!(config.model_encoder_convs, 2);
        assert_eq!(config.model_encoder_kernel, 5);
        assert_eq!(config.model_encoder_blocks, 7);
        assert!((config.dropout - 0.1).abs() < f64::EPSILON);
        assert!((config.dropout_char - 0.05).abs() < f64::EPSILON);
        assert!(!config.pretrained_char);
        assert!(config.freeze_word);
    }

    #[test]
    fn derived_values() {
        let config = QaNetConfig::from_json(&base_json()).unwrap();
        assert_eq!(config.head_dim(), 16);
        assert!((config.attention_scale() - 0.25).abs() < 1e-12);
        assert_eq!(config.embedding_dim(), 364);
        assert_eq!(config.cq_dim(), 512);
    }

    #[test]
    fn overrides_are_read() {
        let mut json = base_json();
        json["dropout"] = serde_json::json!(0.2);
        json["pretrained_char"] = serde_json::json!(true);
        json["model_encoder_blocks"] = serde_json::json!(3);
        let config = QaNetConfig::from_json(&json).unwrap();
        assert!((config.dropout - 0.2).abs() < f64::EPSILON);
        assert!(config.pretrained_char);
        assert_eq!(config.model_encoder_blocks, 3);
    }

    #[test]
    fn missing_required_field_errors() {
        let mut json = base_json();
        json.as_object_mut().unwrap().remove("para_limit");
        let err = QaNetConfig::from_json(&json).unwrap_err();
        assert!(err.to_string().contains("para_limit"));
    }

    #[test]
    fn indivisible_heads_error() {
        let mut json = base_json();
        json["num_heads"] = serde_json::json!(3);
        assert!(QaNetConfig::from_json(&json).is_err());
    }

    #[test]
    fn dropout_out_of_range_errors() {
        let mut json = base_json();
        json["dropout_char"] = serde_json::json!(1.0);
        assert!(QaNetConfig::from_json(&json).is_err());
    }

    #[test]
    fn even_kernel_errors() {
        let mut json = base_json();
        json["char_kernel"] = serde_json::json!(4);
        assert!(QaNetConfig::from_json(&json).is_err());
    }

    #[test]
    fn non_positive_or_nan_eps_errors() {
        let mut config = QaNetConfig::from_json(&base_json()).unwrap();
        for eps in [0.0, -1e-5, f64::NAN, f64::INFINITY] {
            config.norm_eps = eps;
            let err = config.validate().unwrap_err();
            assert!(matches!(err, QaError::Config(_)), "norm_eps {eps} accepted");
        }
    }
}
