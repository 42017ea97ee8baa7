// SPDX-License-Identifier: MIT OR Apache-2.0

//! The QANet reading-comprehension network.
//!
//! Word and character ids for a context passage and a question go in; start
//! and end log-distributions over context positions come out.  Everything in
//! between is channel-first `[batch, channels, len]`.

pub mod attention;
pub mod conv;
pub mod cq_attention;
pub mod embedding;
pub mod encoder;
pub mod highway;
pub(crate) mod init;
pub mod norm;
pub mod pointer;
pub mod position;

use std::sync::Arc;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Embedding, Init, VarBuilder, VarMap};

use crate::config::QaNetConfig;
use crate::error::{QaError, Result};
use crate::hooks::{BlockId, HookCache, HookPoint, HookSpec, Stream};
use crate::util::dropout::Mode;
use crate::util::masks::padding_mask;

use self::conv::DepthwiseSeparableConv;
use self::cq_attention::ContextQueryAttention;
use self::embedding::EmbeddingFusion;
use self::encoder::{EncoderBlock, ModelEncoder};
use self::pointer::SpanPointer;

/// Checkpoint name of the word table.
const WORD_TABLE: &str = "word_emb.weight";
/// Checkpoint name of the character table.
const CHAR_TABLE: &str = "char_emb.weight";
/// Checkpoint prefix of the shared model encoder block.
const MODEL_ENCODER_PREFIX: &str = "model_enc_blks.0";

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

/// Token and character ids for one batch.
///
/// Index `0` is padding in every tensor.  Ids must be `u32` or `i64`.
#[derive(Debug, Clone)]
pub struct QaInputs {
    /// Context word ids: `[batch, para_limit]`.
    pub context_words: Tensor,
    /// Context char ids: `[batch, para_limit, char_limit]`.
    pub context_chars: Tensor,
    /// Question word ids: `[batch, ques_limit]`.
    pub question_words: Tensor,
    /// Question char ids: `[batch, ques_limit, char_limit]`.
    pub question_chars: Tensor,
}

/// Result of a forward pass.
#[derive(Debug)]
pub struct SpanOutput {
    /// Log-probability of each context position being the span start:
    /// `[batch, para_limit]`.
    pub log_p_start: Tensor,
    /// Log-probability of each context position being the span end:
    /// `[batch, para_limit]`.
    pub log_p_end: Tensor,
    /// Activations captured by the [`HookSpec`] passed to the forward call.
    pub cache: HookCache,
}

// ---------------------------------------------------------------------------
// Embedding tables
// ---------------------------------------------------------------------------

/// A lookup table and whether it takes gradient updates.
struct Table {
    /// Lookup layer.
    embedding: Embedding,
    /// `false` for a frozen table.
    trainable: bool,
}

impl Table {
    /// Wrap `weight` (`[vocab, dim]`).
    fn new(weight: Tensor, trainable: bool) -> Result<Self> {
        let dim = weight.dim(1)?;
        Ok(Self {
            embedding: Embedding::new(weight, dim),
            trainable,
        })
    }

    /// Check a pretrained matrix has `dim` columns and move it to `device`.
    fn prepare(
        matrix: &Tensor,
        dim: usize,
        name: &str,
        dtype: DType,
        device: &Device,
    ) -> Result<Tensor> {
        let (_vocab, cols) = matrix.dims2()?;
        if cols != dim {
            return Err(QaError::Config(format!(
                "{name} has {cols} columns, config expects {dim}"
            )));
        }
        Ok(matrix.to_dtype(dtype)?.to_device(device)?)
    }
}

// ---------------------------------------------------------------------------
// QaNet
// ---------------------------------------------------------------------------

/// Full QANet model.
///
/// Holds tensors only, so a shared `&QaNet` can serve concurrent forward
/// calls.
pub struct QaNet {
    /// Word table (`word_emb.weight`).
    word_emb: Table,
    /// Character table (`char_emb.weight`).
    char_emb: Table,
    /// Word/char fusion (`emb`).
    emb: EmbeddingFusion,
    /// Context projection to `D` (`context_conv`).
    context_conv: DepthwiseSeparableConv,
    /// Question projection to `D` (`question_conv`).
    question_conv: DepthwiseSeparableConv,
    /// Context embedding encoder (`c_emb_enc`).
    c_emb_enc: EncoderBlock,
    /// Question embedding encoder (`q_emb_enc`).
    q_emb_enc: EncoderBlock,
    /// Co-attention (`cq_att`).
    cq_att: ContextQueryAttention,
    /// `4D -> D` resizing convolution (`cq_resizer`).
    cq_resizer: DepthwiseSeparableConv,
    /// Shared model encoder (`model_enc_blks.0`).
    model_enc: ModelEncoder,
    /// Span pointer (`out`).
    out: SpanPointer,
    /// Model configuration.
    config: QaNetConfig,
}

impl QaNet {
    /// Create a freshly initialized model whose trainable parameters are
    /// registered in `varmap`.
    ///
    /// `word_mat` (`[word_vocab, glove_dim]`) and `char_mat`
    /// (`[char_vocab, char_dim]`) seed the embedding tables.  A table that is
    /// frozen by the config stays outside the `VarMap`; a trainable one is
    /// registered under its checkpoint name and holds a copy of the matrix.
    ///
    /// # Errors
    ///
    /// Returns [`QaError::Config`] if the config is invalid or a matrix has
    /// the wrong width, and [`QaError::Model`] on tensor failures.
    pub fn init(
        config: &QaNetConfig,
        word_mat: &Tensor,
        char_mat: &Tensor,
        varmap: &mut VarMap,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let dtype = DType::F32;
        let vb = VarBuilder::from_varmap(varmap, dtype, device);

        let word = Table::prepare(word_mat, config.glove_dim, "word matrix", dtype, device)?;
        let chars = Table::prepare(char_mat, config.char_dim, "char matrix", dtype, device)?;

        let word_trainable = !config.freeze_word;
        let char_trainable = !config.pretrained_char;
        let word_emb = Table::new(
            register_table(varmap, &vb, WORD_TABLE, word, word_trainable)?,
            word_trainable,
        )?;
        let char_emb = Table::new(
            register_table(varmap, &vb, CHAR_TABLE, chars, char_trainable)?,
            char_trainable,
        )?;

        let model = Self::build(config, word_emb, char_emb, &vb)?;
        let trainable: usize = varmap.all_vars().iter().map(|v| v.elem_count()).sum();
        tracing::info!(
            d = config.connector_dim,
            heads = config.num_heads,
            para_limit = config.para_limit,
            ques_limit = config.ques_limit,
            trainable_parameters = trainable,
            "initialized QANet"
        );
        Ok(model)
    }

    /// Load a model from a checkpoint.
    ///
    /// Embedding tables are read from the checkpoint when present and fall
    /// back to `word_mat` / `char_mat` otherwise.  All other parameters are
    /// required.
    ///
    /// # Errors
    ///
    /// Returns [`QaError::Config`] if the config is invalid or a matrix has
    /// the wrong width, and [`QaError::Model`] if a required tensor is
    /// missing or has the wrong shape.
    pub fn load(
        config: &QaNetConfig,
        word_mat: &Tensor,
        char_mat: &Tensor,
        vb: VarBuilder<'_>,
    ) -> Result<Self> {
        config.validate()?;
        let word = load_table(&vb, WORD_TABLE, word_mat, config.glove_dim, !config.freeze_word)?;
        let chars = load_table(
            &vb,
            CHAR_TABLE,
            char_mat,
            config.char_dim,
            !config.pretrained_char,
        )?;
        let word_emb = Table::new(word, !config.freeze_word)?;
        let char_emb = Table::new(chars, !config.pretrained_char)?;

        let model = Self::build(config, word_emb, char_emb, &vb)?;
        tracing::info!(
            d = config.connector_dim,
            heads = config.num_heads,
            para_limit = config.para_limit,
            ques_limit = config.ques_limit,
            "loaded QANet"
        );
        Ok(model)
    }

    /// Construct every component below the embedding tables.
    fn build(
        config: &QaNetConfig,
        word_emb: Table,
        char_emb: Table,
        vb: &VarBuilder<'_>,
    ) -> Result<Self> {
        let d = config.connector_dim;
        let fused = config.embedding_dim();
        let pk = config.projection_kernel;

        let model_block = EncoderBlock::new(
            config,
            config.model_encoder_convs,
            config.model_encoder_kernel,
            config.para_limit,
            vb.pp(MODEL_ENCODER_PREFIX),
        )?;
        tracing::debug!(
            repeats = config.model_encoder_blocks,
            "model encoder shares one block across all repeats"
        );

        Ok(Self {
            emb: EmbeddingFusion::new(config, vb.pp("emb"))?,
            context_conv: DepthwiseSeparableConv::new(
                fused,
                d,
                pk,
                1,
                true,
                vb.pp("context_conv"),
            )?,
            question_conv: DepthwiseSeparableConv::new(
                fused,
                d,
                pk,
                1,
                true,
                vb.pp("question_conv"),
            )?,
            c_emb_enc: EncoderBlock::new(
                config,
                config.emb_encoder_convs,
                config.emb_encoder_kernel,
                config.para_limit,
                vb.pp("c_emb_enc"),
            )?,
            q_emb_enc: EncoderBlock::new(
                config,
                config.emb_encoder_convs,
                config.emb_encoder_kernel,
                config.ques_limit,
                vb.pp("q_emb_enc"),
            )?,
            cq_att: ContextQueryAttention::new(config, vb.pp("cq_att"))?,
            cq_resizer: DepthwiseSeparableConv::new(
                config.cq_dim(),
                d,
                pk,
                1,
                true,
                vb.pp("cq_resizer"),
            )?,
            model_enc: ModelEncoder::new(Arc::new(model_block), config.model_encoder_blocks),
            out: SpanPointer::new(config, vb.pp("out"))?,
            word_emb,
            char_emb,
            config: config.clone(),
        })
    }

    /// Run the network.
    ///
    /// Masks are derived from the word ids (`id != 0`).  In
    /// [`Mode::Eval`] the result is deterministic.
    ///
    /// # Shapes
    /// - see [`QaInputs`]
    /// - returns: `log_p_start`, `log_p_end` `[batch, para_limit]`
    ///
    /// # Errors
    ///
    /// Returns [`QaError::Shape`] if an input does not match the configured
    /// limits or the batch sizes disagree, [`QaError::Hook`] if an
    /// intervention is malformed, and [`QaError::Model`] on tensor failures.
    pub fn forward(&self, inputs: &QaInputs, mode: Mode, hooks: &HookSpec) -> Result<SpanOutput> {
        self.validate_inputs(inputs)?;
        if mode.is_train() && self.config.dropout == 0.0 && self.config.dropout_char == 0.0 {
            tracing::warn!("forward in training mode with every dropout rate at zero");
        }
        let mut cache = HookCache::new();

        let cmask = padding_mask(&inputs.context_words)?;
        let qmask = padding_mask(&inputs.question_words)?;

        // --- Embedding ---
        let c = self.embed(&inputs.context_words, &inputs.context_chars, mode)?;
        let c = hooks.observe(HookPoint::Embed(Stream::Context), c, &mut cache)?;
        let q = self.embed(&inputs.question_words, &inputs.question_chars, mode)?;
        let q = hooks.observe(HookPoint::Embed(Stream::Question), q, &mut cache)?;

        let c = self.context_conv.forward(&c)?;
        let c = hooks.observe(HookPoint::Projected(Stream::Context), c, &mut cache)?;
        let q = self.question_conv.forward(&q)?;
        let q = hooks.observe(HookPoint::Projected(Stream::Question), q, &mut cache)?;

        // --- Embedding encoders ---
        let ce = self
            .c_emb_enc
            .forward(&c, &cmask, mode, BlockId::ContextEmbedding, hooks, &mut cache)?;
        let qe = self
            .q_emb_enc
            .forward(&q, &qmask, mode, BlockId::QuestionEmbedding, hooks, &mut cache)?;

        // --- Co-attention and model encoder ---
        let x = self
            .cq_att
            .forward(&ce, &qe, &cmask, &qmask, mode, hooks, &mut cache)?;
        let m0 = self.cq_resizer.forward(&x)?;
        let m1 = self.model_enc.forward(&m0, &cmask, mode, 0, hooks, &mut cache)?;
        let m2 = self.model_enc.forward(&m1, &cmask, mode, 1, hooks, &mut cache)?;
        let m3 = self.model_enc.forward(&m2, &cmask, mode, 2, hooks, &mut cache)?;

        let (log_p_start, log_p_end) = self.out.forward(&m1, &m2, &m3, &cmask, hooks, &mut cache)?;
        Ok(SpanOutput {
            log_p_start,
            log_p_end,
            cache,
        })
    }

    /// Look up and fuse word and char embeddings: `[batch, Dw + Dc, len]`.
    fn embed(&self, word_ids: &Tensor, char_ids: &Tensor, mode: Mode) -> Result<Tensor> {
        let wd = self.word_emb.embedding.forward(word_ids)?;
        let ch = self.char_emb.embedding.forward(char_ids)?;
        self.emb.forward(&ch, &wd, mode)
    }

    /// Check input shapes against the configured limits.
    fn validate_inputs(&self, inputs: &QaInputs) -> Result<()> {
        let cfg = &self.config;
        let (batch, lc) = inputs.context_words.dims2()?;
        let (qb, lq) = inputs.question_words.dims2()?;
        if lc != cfg.para_limit {
            return Err(QaError::Shape(format!(
                "context length must be para_limit = {}, got {lc}",
                cfg.para_limit
            )));
        }
        if lq != cfg.ques_limit {
            return Err(QaError::Shape(format!(
                "question length must be ques_limit = {}, got {lq}",
                cfg.ques_limit
            )));
        }
        if qb != batch {
            return Err(QaError::Shape(format!(
                "context batch {batch} differs from question batch {qb}"
            )));
        }
        for (name, chars, len) in [
            ("context", &inputs.context_chars, lc),
            ("question", &inputs.question_chars, lq),
        ] {
            let dims = chars.dims();
            if dims != [batch, len, cfg.char_limit] {
                return Err(QaError::Shape(format!(
                    "{name} char ids must be [{batch}, {len}, {}], got {dims:?}",
                    cfg.char_limit
                )));
            }
        }
        Ok(())
    }

    /// Model configuration.
    #[must_use]
    pub const fn config(&self) -> &QaNetConfig {
        &self.config
    }

    /// The shared model encoder.
    #[must_use]
    pub const fn model_encoder(&self) -> &ModelEncoder {
        &self.model_enc
    }

    /// Word table `[word_vocab, glove_dim]`.
    #[must_use]
    pub fn word_embeddings(&self) -> &Tensor {
        self.word_emb.embedding.embeddings()
    }

    /// Character table `[char_vocab, char_dim]`.
    #[must_use]
    pub fn char_embeddings(&self) -> &Tensor {
        self.char_emb.embedding.embeddings()
    }

    /// Whether the word table takes gradient updates.
    #[must_use]
    pub const fn word_trainable(&self) -> bool {
        self.word_emb.trainable
    }

    /// Whether the character table takes gradient updates.
    #[must_use]
    pub const fn char_trainable(&self) -> bool {
        self.char_emb.trainable
    }
}

/// Return the table tensor for `init`: a trainable table becomes a `VarMap`
/// variable holding `matrix`, a frozen one is returned detached.
fn register_table(
    varmap: &mut VarMap,
    vb: &VarBuilder<'_>,
    name: &str,
    matrix: Tensor,
    trainable: bool,
) -> Result<Tensor> {
    if !trainable {
        tracing::debug!(table = name, "embedding table frozen");
        return Ok(matrix.detach());
    }
    let var = vb.get_with_hints(matrix.dims(), name, Init::Const(0.0))?;
    // The returned tensor shares storage with the variable, so it sees the copy.
    varmap.set_one(name, &matrix)?;
    tracing::debug!(table = name, "embedding table registered as trainable");
    Ok(var)
}

/// Return the table tensor for `load`: from the checkpoint when present,
/// otherwise from `matrix`.
fn load_table(
    vb: &VarBuilder<'_>,
    name: &str,
    matrix: &Tensor,
    dim: usize,
    trainable: bool,
) -> Result<Tensor> {
    let (vocab, _) = matrix.dims2()?;
    if vb.contains_tensor(name) {
        tracing::debug!(table = name, "embedding table read from checkpoint");
        return Ok(vb.get((vocab, dim), name)?);
    }
    if trainable {
        tracing::warn!(
            table = name,
            "trainable embedding table missing from checkpoint, using the pretrained matrix"
        );
    }
    Table::prepare(matrix, dim, name, vb.dtype(), vb.device())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
