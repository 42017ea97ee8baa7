// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests: hook capture and interventions on the full model, and
//! safetensors checkpoint round trips through `QaNet::load`.
//!
//! Run:
//!   `cargo test --test hooks_and_checkpoints`

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::cast_possible_truncation,
    clippy::as_conversions,
    clippy::missing_docs_in_private_items,
    clippy::missing_panics_doc,
    missing_docs
)]

use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarMap;
use candle_qanet::weights::{resolve_safetensors_paths, var_builder_from_safetensors};
use candle_qanet::{
    BlockId, HookPoint, HookSpec, Intervention, Mode, QaError, QaInputs, QaNet, QaNetConfig, Stream,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const LC: usize = 6;
const LQ: usize = 4;

fn config(pretrained_char: bool) -> QaNetConfig {
    QaNetConfig::from_json(&serde_json::json!({
        "connector_dim": 8, "num_heads": 2, "glove_dim": 6, "char_dim": 4,
        "para_limit": LC, "ques_limit": LQ, "char_limit": 3,
        "model_encoder_blocks": 3, "pretrained_char": pretrained_char
    }))
    .unwrap()
}

fn matrices() -> (Tensor, Tensor) {
    (
        Tensor::randn(0f32, 1.0, (16, 6), &Device::Cpu).unwrap(),
        Tensor::randn(0f32, 1.0, (8, 4), &Device::Cpu).unwrap(),
    )
}

fn inputs() -> QaInputs {
    let dev = Device::Cpu;
    QaInputs {
        context_words: Tensor::new(&[[2u32, 3, 4, 5, 0, 0]], &dev).unwrap(),
        context_chars: Tensor::new(
            &[[[1u32, 2, 3], [2, 3, 0], [4, 5, 6], [7, 1, 0], [0, 0, 0], [0, 0, 0]]],
            &dev,
        )
        .unwrap(),
        question_words: Tensor::new(&[[6u32, 7, 8, 0]], &dev).unwrap(),
        question_chars: Tensor::new(&[[[3u32, 3, 0], [1, 2, 3], [5, 0, 0], [0, 0, 0]]], &dev)
            .unwrap(),
    }
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .max_all()
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

#[test]
fn captures_every_stage_with_expected_shapes() {
    let (word, chars) = matrices();
    let mut varmap = VarMap::new();
    let model = QaNet::init(&config(true), &word, &chars, &mut varmap, &Device::Cpu).unwrap();

    let mut hooks = HookSpec::new();
    hooks
        .capture(HookPoint::Embed(Stream::Context))
        .capture(HookPoint::Projected(Stream::Question))
        .capture(HookPoint::AttnPattern(BlockId::QuestionEmbedding))
        .capture(HookPoint::CqSimilarity)
        .capture(HookPoint::CqOut)
        .capture(HookPoint::ModelEncoderOut(2))
        .capture("model_enc.2.2.attn.hook_pattern");
    let out = model.forward(&inputs(), Mode::Eval, &hooks).unwrap();
    let cache = &out.cache;

    assert_eq!(cache.num_captures(), 7);
    let dims = |h: HookPoint| cache.require(&h).unwrap().dims().to_vec();
    assert_eq!(dims(HookPoint::Embed(Stream::Context)), vec![1, 10, LC]);
    assert_eq!(dims(HookPoint::Projected(Stream::Question)), vec![1, 8, LQ]);
    assert_eq!(dims(HookPoint::AttnPattern(BlockId::QuestionEmbedding)), vec![1, 2, LQ, LQ]);
    assert_eq!(dims(HookPoint::CqSimilarity), vec![1, LC, LQ]);
    assert_eq!(dims(HookPoint::CqOut), vec![1, 32, LC]);
    assert_eq!(
        dims(HookPoint::AttnPattern(BlockId::Model { pass: 2, repeat: 2 })),
        vec![1, 2, LC, LC]
    );
}

#[test]
fn scale_one_is_a_no_op_and_zero_changes_the_output() {
    let (word, chars) = matrices();
    let mut varmap = VarMap::new();
    let model = QaNet::init(&config(true), &word, &chars, &mut varmap, &Device::Cpu).unwrap();
    let base = model.forward(&inputs(), Mode::Eval, &HookSpec::new()).unwrap();

    let mut identity = HookSpec::new();
    identity.intervene(HookPoint::CqOut, Intervention::Scale(1.0));
    let same = model.forward(&inputs(), Mode::Eval, &identity).unwrap();
    assert!(max_abs_diff(&base.log_p_start, &same.log_p_start) < 1e-6);

    let mut zero = HookSpec::new();
    zero.intervene(HookPoint::ModelEncoderOut(2), Intervention::Zero);
    let changed = model.forward(&inputs(), Mode::Eval, &zero).unwrap();
    let valid = |t: &Tensor| t.i((.., 0..4)).unwrap();
    assert!(max_abs_diff(&valid(&base.log_p_end), &valid(&changed.log_p_end)) > 0.0);
    // Start depends only on M1 and M2.
    assert!(max_abs_diff(&base.log_p_start, &changed.log_p_start) < 1e-6);
}

#[test]
fn capture_sees_activation_before_intervention() {
    let (word, chars) = matrices();
    let mut varmap = VarMap::new();
    let model = QaNet::init(&config(true), &word, &chars, &mut varmap, &Device::Cpu).unwrap();

    let mut hooks = HookSpec::new();
    hooks.capture(HookPoint::CqOut);
    hooks.intervene(HookPoint::CqOut, Intervention::Zero);
    let out = model.forward(&inputs(), Mode::Eval, &hooks).unwrap();
    let captured = out.cache.require(&HookPoint::CqOut).unwrap();
    let norm = captured.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
    assert!(norm > 0.0);
}

#[test]
fn replacement_with_wrong_shape_is_a_hook_error() {
    let (word, chars) = matrices();
    let mut varmap = VarMap::new();
    let model = QaNet::init(&config(true), &word, &chars, &mut varmap, &Device::Cpu).unwrap();

    let mut hooks = HookSpec::new();
    let wrong = Tensor::zeros((1, 3, 3), DType::F32, &Device::Cpu).unwrap();
    hooks.intervene(HookPoint::CqSimilarity, Intervention::Replace(wrong));
    let err = model.forward(&inputs(), Mode::Eval, &hooks).unwrap_err();
    assert!(matches!(err, QaError::Hook(_)));
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

#[test]
fn saved_varmap_reloads_to_identical_outputs() {
    let (word, chars) = matrices();
    let cfg = config(false);
    let mut varmap = VarMap::new();
    let model = QaNet::init(&cfg, &word, &chars, &mut varmap, &Device::Cpu).unwrap();
    let expected = model.forward(&inputs(), Mode::Eval, &HookSpec::new()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    varmap.save(dir.path().join("model.safetensors")).unwrap();

    let paths = resolve_safetensors_paths(dir.path()).unwrap();
    let vb = var_builder_from_safetensors(&paths, DType::F32, &Device::Cpu).unwrap();
    // The trainable char table comes from the checkpoint, so a different
    // fallback matrix must not matter.
    let other_chars = Tensor::zeros((8, 4), DType::F32, &Device::Cpu).unwrap();
    let loaded = QaNet::load(&cfg, &word, &other_chars, vb).unwrap();
    let got = loaded.forward(&inputs(), Mode::Eval, &HookSpec::new()).unwrap();

    let prob = |t: &Tensor| t.exp().unwrap();
    assert!(max_abs_diff(&prob(&expected.log_p_start), &prob(&got.log_p_start)) < 1e-6);
    assert!(max_abs_diff(&prob(&expected.log_p_end), &prob(&got.log_p_end)) < 1e-6);
}

#[test]
fn checkpoint_from_other_geometry_fails_to_load() {
    let (word, chars) = matrices();
    let mut varmap = VarMap::new();
    QaNet::init(&config(true), &word, &chars, &mut varmap, &Device::Cpu).unwrap();

    let dir = tempfile::tempdir().unwrap();
    varmap.save(dir.path().join("model.safetensors")).unwrap();

    let mut wider = config(true);
    wider.connector_dim = 12;
    let paths = resolve_safetensors_paths(dir.path()).unwrap();
    let vb = var_builder_from_safetensors(&paths, DType::F32, &Device::Cpu).unwrap();
    assert!(QaNet::load(&wider, &word, &chars, vb).is_err());
}
