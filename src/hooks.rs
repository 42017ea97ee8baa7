// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hook system for activation capture and intervention.
//!
//! Provides [`HookPoint`] (named locations in the QANet forward pass),
//! [`HookSpec`] (what to capture and where to intervene), and
//! [`HookCache`] (tensors captured during one forward pass).
//!
//! Hook names follow the parameter prefixes of the model (`c_emb_enc`,
//! `cq_att`, `model_enc`, ...), so a hook string reads like the weight
//! names it sits next to.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;

use crate::error::{QaError, Result};

// ---------------------------------------------------------------------------
// Stream / BlockId
// ---------------------------------------------------------------------------

/// Which input stream an embedding-stage hook belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    /// The context passage.
    Context,
    /// The question.
    Question,
}

impl Stream {
    /// Single-letter prefix used in hook names (`c` or `q`).
    const fn prefix(self) -> &'static str {
        match self {
            Self::Context => "c",
            Self::Question => "q",
        }
    }
}

/// Identifies one invocation of an encoder block.
///
/// The model encoder is a single block run `model_encoder_blocks` times per
/// pass, three passes in total; `pass` and `repeat` say which run it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockId {
    /// The context embedding encoder (`c_emb_enc`).
    ContextEmbedding,
    /// The question embedding encoder (`q_emb_enc`).
    QuestionEmbedding,
    /// Model encoder run `repeat` within pass `pass` (`model_enc.{pass}.{repeat}`).
    Model {
        /// Pass index: 0 produces M1, 1 produces M2, 2 produces M3.
        pass: usize,
        /// Repeat index within the pass.
        repeat: usize,
    },
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContextEmbedding => write!(f, "c_emb_enc"),
            Self::QuestionEmbedding => write!(f, "q_emb_enc"),
            Self::Model { pass, repeat } => write!(f, "model_enc.{pass}.{repeat}"),
        }
    }
}

// ---------------------------------------------------------------------------
// HookPoint
// ---------------------------------------------------------------------------

/// Named location in the forward pass where activations can be captured
/// or interventions applied.
///
/// # String conversion
///
/// ```
/// use candle_qanet::{BlockId, HookPoint};
///
/// let hook = HookPoint::AttnPattern(BlockId::Model { pass: 1, repeat: 3 });
/// assert_eq!(hook.to_string(), "model_enc.1.3.attn.hook_pattern");
///
/// let parsed: HookPoint = "model_enc.1.3.attn.hook_pattern".parse().unwrap();
/// assert_eq!(parsed, hook);
/// ```
///
/// Unknown strings parse as [`HookPoint::Custom`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HookPoint {
    // -- Embedding stage --
    /// Fused word+char embedding (`{c,q}_emb.hook_fused`), `[batch, Dw + Dc, len]`.
    Embed(Stream),
    /// Stream projection output (`{c,q}_conv.hook_out`), `[batch, D, len]`.
    Projected(Stream),

    // -- Per encoder block invocation --
    /// Block input after positional encoding (`{block}.hook_resid_pre`).
    ResidPre(BlockId),
    /// Residual stream after convolution `i` (`{block}.convs.{i}.hook_out`).
    ConvOut(BlockId, usize),
    /// Pre-softmax, masked attention scores (`{block}.attn.hook_scores`),
    /// `[batch, heads, len, len]`.
    AttnScores(BlockId),
    /// Post-softmax, masked attention pattern (`{block}.attn.hook_pattern`),
    /// `[batch, heads, len, len]`.
    AttnPattern(BlockId),
    /// Self-attention output before the residual add (`{block}.hook_attn_out`).
    AttnOut(BlockId),
    /// Block output (`{block}.hook_resid_post`).
    ResidPost(BlockId),

    // -- Context-query attention --
    /// Trilinear similarity `S` (`cq_att.hook_similarity`), `[batch, Lc, Lq]`.
    CqSimilarity,
    /// Context-to-query weights `S1` (`cq_att.hook_c2q`), `[batch, Lc, Lq]`.
    CqContextToQuery,
    /// Query-to-context weights `S2` (`cq_att.hook_q2c`), `[batch, Lc, Lq]`.
    CqQueryToContext,
    /// Co-attention output (`cq_att.hook_out`), `[batch, 4D, Lc]`.
    CqOut,

    // -- Model encoder and output --
    /// Output of model encoder pass `p`: M1, M2, M3 (`model_enc.{p}.hook_out`).
    ModelEncoderOut(usize),
    /// Masked start logits (`out.hook_start_logits`), `[batch, Lc]`.
    StartLogits,
    /// Masked end logits (`out.hook_end_logits`), `[batch, Lc]`.
    EndLogits,

    // -- Escape hatch --
    /// Hook point not covered by the enum.
    Custom(String),
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Embed(s) => write!(f, "{}_emb.hook_fused", s.prefix()),
            Self::Projected(s) => write!(f, "{}_conv.hook_out", s.prefix()),
            Self::ResidPre(b) => write!(f, "{b}.hook_resid_pre"),
            Self::ConvOut(b, i) => write!(f, "{b}.convs.{i}.hook_out"),
            Self::AttnScores(b) => write!(f, "{b}.attn.hook_scores"),
            Self::AttnPattern(b) => write!(f, "{b}.attn.hook_pattern"),
            Self::AttnOut(b) => write!(f, "{b}.hook_attn_out"),
            Self::ResidPost(b) => write!(f, "{b}.hook_resid_post"),
            Self::CqSimilarity => write!(f, "cq_att.hook_similarity"),
            Self::CqContextToQuery => write!(f, "cq_att.hook_c2q"),
            Self::CqQueryToContext => write!(f, "cq_att.hook_q2c"),
            Self::CqOut => write!(f, "cq_att.hook_out"),
            Self::ModelEncoderOut(p) => write!(f, "model_enc.{p}.hook_out"),
            Self::StartLogits => write!(f, "out.hook_start_logits"),
            Self::EndLogits => write!(f, "out.hook_end_logits"),
            Self::Custom(s) => write!(f, "{s}"),
        }
    }
}

/// Parse a hook string into a [`HookPoint`].
///
/// Unknown strings produce [`HookPoint::Custom`] rather than an error.
impl FromStr for HookPoint {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(parse_hook_string(s))
    }
}

/// Allow `hooks.capture("cq_att.hook_c2q")` via `Into<HookPoint>`.
impl From<&str> for HookPoint {
    fn from(s: &str) -> Self {
        parse_hook_string(s)
    }
}

/// Parse a hook string, falling back to [`HookPoint::Custom`] for unknown patterns.
fn parse_hook_string(s: &str) -> HookPoint {
    let fixed = match s {
        "c_emb.hook_fused" => Some(HookPoint::Embed(Stream::Context)),
        "q_emb.hook_fused" => Some(HookPoint::Embed(Stream::Question)),
        "c_conv.hook_out" => Some(HookPoint::Projected(Stream::Context)),
        "q_conv.hook_out" => Some(HookPoint::Projected(Stream::Question)),
        "cq_att.hook_similarity" => Some(HookPoint::CqSimilarity),
        "cq_att.hook_c2q" => Some(HookPoint::CqContextToQuery),
        "cq_att.hook_q2c" => Some(HookPoint::CqQueryToContext),
        "cq_att.hook_out" => Some(HookPoint::CqOut),
        "out.hook_start_logits" => Some(HookPoint::StartLogits),
        "out.hook_end_logits" => Some(HookPoint::EndLogits),
        _ => None,
    };
    if let Some(hook) = fixed {
        return hook;
    }

    if let Some(suffix) = s.strip_prefix("c_emb_enc.") {
        if let Some(hook) = parse_block_suffix(BlockId::ContextEmbedding, suffix) {
            return hook;
        }
    }
    if let Some(suffix) = s.strip_prefix("q_emb_enc.") {
        if let Some(hook) = parse_block_suffix(BlockId::QuestionEmbedding, suffix) {
            return hook;
        }
    }

    // "model_enc.{pass}.hook_out" or "model_enc.{pass}.{repeat}.{suffix}"
    if let Some(rest) = s.strip_prefix("model_enc.") {
        if let Some((pass_str, rest)) = rest.split_once('.') {
            if let Ok(pass) = pass_str.parse::<usize>() {
                if rest == "hook_out" {
                    return HookPoint::ModelEncoderOut(pass);
                }
                if let Some((repeat_str, suffix)) = rest.split_once('.') {
                    if let Ok(repeat) = repeat_str.parse::<usize>() {
                        let block = BlockId::Model { pass, repeat };
                        if let Some(hook) = parse_block_suffix(block, suffix) {
                            return hook;
                        }
                    }
                }
            }
        }
    }

    HookPoint::Custom(s.to_string())
}

/// Parse the part of a block hook name after the block prefix.
fn parse_block_suffix(block: BlockId, suffix: &str) -> Option<HookPoint> {
    match suffix {
        "hook_resid_pre" => Some(HookPoint::ResidPre(block)),
        "attn.hook_scores" => Some(HookPoint::AttnScores(block)),
        "attn.hook_pattern" => Some(HookPoint::AttnPattern(block)),
        "hook_attn_out" => Some(HookPoint::AttnOut(block)),
        "hook_resid_post" => Some(HookPoint::ResidPost(block)),
        other => {
            let idx = other.strip_prefix("convs.")?.strip_suffix(".hook_out")?;
            idx.parse::<usize>()
                .ok()
                .map(|i| HookPoint::ConvOut(block, i))
        }
    }
}

// ---------------------------------------------------------------------------
// Intervention
// ---------------------------------------------------------------------------

/// An intervention to apply at a hook point during the forward pass.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Intervention {
    /// Replace the tensor entirely.  The replacement must have the same shape.
    Replace(Tensor),

    /// Add a (broadcastable) tensor to the activation.
    Add(Tensor),

    /// Add a pre-softmax knockout mask: `0.0` keeps a position, a large
    /// negative value removes it.  Meant for [`HookPoint::AttnScores`].
    Knockout(Tensor),

    /// Multiply the activation by a constant factor.
    Scale(f64),

    /// Zero the tensor at this hook point.
    Zero,
}

/// Apply a single [`Intervention`] to a tensor.
///
/// # Shapes
/// - `tensor`: any shape -- the activation at the hook point.
/// - returns: same shape as `tensor`.
///
/// # Errors
///
/// Returns [`QaError::Hook`] if a replacement has the wrong shape and
/// [`QaError::Model`] if the underlying tensor operation fails.
pub(crate) fn apply_intervention(tensor: &Tensor, intervention: &Intervention) -> Result<Tensor> {
    match intervention {
        Intervention::Replace(replacement) => {
            if replacement.dims() != tensor.dims() {
                return Err(QaError::Hook(format!(
                    "replacement shape {:?} does not match activation shape {:?}",
                    replacement.dims(),
                    tensor.dims()
                )));
            }
            Ok(replacement.to_dtype(tensor.dtype())?)
        }
        Intervention::Add(delta) => Ok(tensor.broadcast_add(delta)?),
        Intervention::Knockout(mask) => Ok(tensor.broadcast_add(mask)?),
        Intervention::Scale(factor) => Ok((tensor * *factor)?),
        Intervention::Zero => Ok(tensor.zeros_like()?),
    }
}

// ---------------------------------------------------------------------------
// HookSpec
// ---------------------------------------------------------------------------

/// Declares which activations to capture and which interventions to apply.
///
/// When empty, the forward pass does no extra clones or allocations.
///
/// # Example
///
/// ```
/// use candle_qanet::{BlockId, HookPoint, HookSpec};
///
/// let mut hooks = HookSpec::new();
/// hooks.capture(HookPoint::AttnPattern(BlockId::ContextEmbedding))
///      .capture("cq_att.hook_c2q");
/// assert_eq!(hooks.num_captures(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct HookSpec {
    /// Hook points to capture during the forward pass.
    captures: HashSet<HookPoint>,
    /// Interventions to apply, stored as (`hook_point`, intervention) pairs.
    interventions: Vec<(HookPoint, Intervention)>,
}

impl HookSpec {
    /// Create an empty hook specification (no captures, no interventions).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request capture of the activation at the given hook point.
    pub fn capture<H: Into<HookPoint>>(&mut self, hook: H) -> &mut Self {
        self.captures.insert(hook.into());
        self
    }

    /// Register an intervention at the given hook point.
    pub fn intervene<H: Into<HookPoint>>(
        &mut self,
        hook: H,
        intervention: Intervention,
    ) -> &mut Self {
        self.interventions.push((hook.into(), intervention));
        self
    }

    /// Check whether a specific hook point should be captured.
    #[must_use]
    pub fn is_captured(&self, hook: &HookPoint) -> bool {
        self.captures.contains(hook)
    }

    /// Check whether this spec has no captures and no interventions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.captures.is_empty() && self.interventions.is_empty()
    }

    /// Number of requested captures.
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }

    /// Number of registered interventions.
    #[must_use]
    pub const fn num_interventions(&self) -> usize {
        self.interventions.len()
    }

    /// Iterate over interventions registered at a specific hook point.
    pub fn interventions_at(&self, hook: &HookPoint) -> impl Iterator<Item = &Intervention> {
        self.interventions
            .iter()
            .filter(move |(h, _)| h == hook)
            .map(|(_, intervention)| intervention)
    }

    /// Check whether any intervention targets the given hook point.
    #[must_use]
    pub fn has_intervention_at(&self, hook: &HookPoint) -> bool {
        self.interventions.iter().any(|(h, _)| h == hook)
    }

    /// Capture and intervene at `hook` in one step.
    ///
    /// Stores a clone of `tensor` when the hook is captured (before any
    /// intervention), then applies every intervention registered at the
    /// hook in registration order.  Returns `tensor` untouched when the
    /// spec is empty.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`Intervention`] application.
    pub(crate) fn observe(
        &self,
        hook: HookPoint,
        tensor: Tensor,
        cache: &mut HookCache,
    ) -> Result<Tensor> {
        if self.is_empty() {
            return Ok(tensor);
        }
        if self.is_captured(&hook) {
            cache.store(hook.clone(), tensor.clone());
        }
        let mut tensor = tensor;
        for intervention in self.interventions_at(&hook) {
            tensor = apply_intervention(&tensor, intervention)?;
        }
        Ok(tensor)
    }
}

// ---------------------------------------------------------------------------
// HookCache
// ---------------------------------------------------------------------------

/// Tensors captured during a forward pass.
///
/// # Example
///
/// ```
/// use candle_qanet::{HookCache, HookPoint};
/// use candle_core::{DType, Device, Tensor};
///
/// let mut cache = HookCache::new();
/// let s1 = Tensor::zeros((1, 8, 5), DType::F32, &Device::Cpu).unwrap();
/// cache.store(HookPoint::CqContextToQuery, s1);
/// assert!(cache.get(&HookPoint::CqContextToQuery).is_some());
/// assert!(cache.require(&HookPoint::CqOut).is_err());
/// ```
#[derive(Debug, Default)]
pub struct HookCache {
    /// Captured activations keyed by hook point.
    captures: HashMap<HookPoint, Tensor>,
}

impl HookCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Retrieve a captured tensor by hook point.
    #[must_use]
    pub fn get(&self, hook: &HookPoint) -> Option<&Tensor> {
        self.captures.get(hook)
    }

    /// Retrieve a captured tensor, returning an error if not found.
    ///
    /// # Errors
    ///
    /// Returns [`QaError::Hook`] if the hook point was not captured.
    pub fn require(&self, hook: &HookPoint) -> Result<&Tensor> {
        self.captures
            .get(hook)
            .ok_or_else(|| QaError::Hook(format!("hook point `{hook}` was not captured")))
    }

    /// Store a captured activation.
    pub fn store(&mut self, hook: HookPoint, tensor: Tensor) {
        self.captures.insert(hook, tensor);
    }

    /// Number of captured tensors.
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
