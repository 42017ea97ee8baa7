// SPDX-License-Identifier: MIT OR Apache-2.0

//! # candle-qanet
//!
//! The QANet extractive question-answering network in Rust, built on
//! [candle](https://github.com/huggingface/candle).
//!
//! Given word and character ids for a context passage and a question, the
//! model returns two log-distributions over context positions: where the
//! answer span starts and where it ends.  The network is convolution plus
//! self-attention throughout, with no recurrence.
//!
//! ## Pipeline
//!
//! ```text
//! ids -> embeddings -> EmbeddingFusion -> projection conv -> EncoderBlock
//!     -> ContextQueryAttention -> resizer conv -> ModelEncoder (x3 passes)
//!     -> SpanPointer -> (log p_start, log p_end)
//! ```
//!
//! Parameter names match the PyTorch QANet `state_dict`
//! (`c_emb_enc.convs.0.depthwise_conv.weight`, `cq_att.w`, `out.w1`, ...),
//! so exported checkpoints load through [`QaNet::load`] and
//! [`weights::var_builder_from_safetensors`].
//!
//! ## Hooks
//!
//! Every forward pass takes a [`HookSpec`].  Capture any [`HookPoint`]
//! (attention patterns, co-attention matrices, encoder residuals) or apply an
//! [`Intervention`] there; an empty spec costs nothing.
//!
//! ```no_run
//! use candle_core::{Device, Tensor};
//! use candle_nn::VarMap;
//! use candle_qanet::{HookPoint, HookSpec, Mode, QaInputs, QaNet, QaNetConfig};
//!
//! # fn main() -> candle_qanet::Result<()> {
//! let config = QaNetConfig::from_json(&serde_json::json!({
//!     "connector_dim": 96, "num_heads": 1, "glove_dim": 300, "char_dim": 64,
//!     "para_limit": 400, "ques_limit": 50
//! }))?;
//! let device = Device::Cpu;
//! let word_mat = Tensor::zeros((1000, 300), candle_core::DType::F32, &device)?;
//! let char_mat = Tensor::zeros((100, 64), candle_core::DType::F32, &device)?;
//! let mut varmap = VarMap::new();
//! let model = QaNet::init(&config, &word_mat, &char_mat, &mut varmap, &device)?;
//!
//! # let inputs: QaInputs = unimplemented!();
//! let mut hooks = HookSpec::new();
//! hooks.capture(HookPoint::CqContextToQuery);
//! let out = model.forward(&inputs, Mode::Eval, &hooks)?;
//! let c2q = out.cache.require(&HookPoint::CqContextToQuery)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod hooks;
pub mod qanet;
pub mod util;
pub mod weights;

pub use config::QaNetConfig;
pub use error::{QaError, Result};
pub use hooks::{BlockId, HookCache, HookPoint, HookSpec, Intervention, Stream};
pub use qanet::attention::SelfAttention;
pub use qanet::conv::DepthwiseSeparableConv;
pub use qanet::cq_attention::ContextQueryAttention;
pub use qanet::embedding::EmbeddingFusion;
pub use qanet::encoder::{EncoderBlock, ModelEncoder};
pub use qanet::highway::Highway;
pub use qanet::norm::SeqLayerNorm;
pub use qanet::pointer::SpanPointer;
pub use qanet::position::PositionalEncoder;
pub use qanet::{QaInputs, QaNet, SpanOutput};
pub use util::dropout::Mode;
pub use util::masks::{NEG_LARGE, ensure_binary, mask_logits, padding_mask};
