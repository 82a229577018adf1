//! Synthetic translation checkpoints for integration tests.

#![allow(dead_code)]

use candle_core::{Device, Result, Tensor};
use stack_engine::model::keys::{history_key, layer_key};
use stack_engine::{ModelState, Role, StateMetadata};

pub const DIM: usize = 4;
pub const VOCAB: usize = 16;

static ENCODER_PARAMS: [(&str, &[usize]); 6] = [
    ("self_attn.in_proj_weight", &[3 * DIM, DIM]),
    ("self_attn.out_proj.weight", &[DIM, DIM]),
    ("self_attn_layer_norm.weight", &[DIM]),
    ("fc1.weight", &[2 * DIM, DIM]),
    ("fc2.weight", &[DIM, 2 * DIM]),
    ("final_layer_norm.weight", &[DIM]),
];

static DECODER_EXTRA: [(&str, &[usize]); 2] = [
    ("encoder_attn.in_proj_weight", &[3 * DIM, DIM]),
    ("encoder_attn_layer_norm.weight", &[DIM]),
];

/// Tensor with values unique to `seed`.
fn patterned(shape: &[usize], seed: f64) -> Result<Tensor> {
    let n: usize = shape.iter().product();
    Tensor::arange(0f32, n as f32, &Device::Cpu)?
        .reshape(shape)?
        .affine(0.001, seed)
}

/// Flat tensors of an `enc`/`dec` layer model with `history` history norms
/// on the encoder side.
pub fn flat_tensors(enc: usize, dec: usize, history: usize) -> Result<Vec<(String, Tensor)>> {
    let mut out = vec![
        ("encoder.embed_tokens.weight".to_string(), patterned(&[VOCAB, DIM], -1.0)?),
        ("decoder.embed_tokens.weight".to_string(), patterned(&[VOCAB, DIM], -2.0)?),
        ("decoder.embed_out".to_string(), patterned(&[VOCAB, DIM], -3.0)?),
        ("encoder.layer_norm.weight".to_string(), patterned(&[DIM], -4.0)?),
        ("decoder.layer_norm.weight".to_string(), patterned(&[DIM], -5.0)?),
    ];
    if history > 0 {
        out.push((
            "encoder.history.weight".to_string(),
            patterned(&[history + 1, history + 1], -6.0)?,
        ));
    }

    for (role, depth, role_seed) in [(Role::Encoder, enc, 100.0), (Role::Decoder, dec, 200.0)] {
        for i in 0..depth {
            let extra: &[(&str, &[usize])] = if role == Role::Decoder { &DECODER_EXTRA } else { &[] };
            let params = ENCODER_PARAMS.iter().chain(extra.iter());
            for (p, (suffix, shape)) in params.enumerate() {
                let seed = role_seed + i as f64 + p as f64 * 0.01;
                out.push((layer_key(role, i, suffix), patterned(shape, seed)?));
            }
        }
    }

    for j in 0..history {
        out.push((history_key(Role::Encoder, j, "weight"), patterned(&[DIM], 300.0 + j as f64)?));
        out.push((history_key(Role::Encoder, j, "bias"), patterned(&[DIM], 400.0 + j as f64)?));
    }
    Ok(out)
}

pub fn translation_state(depth: usize) -> ModelState {
    translation_state_with_history(depth, 0)
}

pub fn translation_state_with_history(depth: usize, history: usize) -> ModelState {
    let tensors = flat_tensors(depth, depth, history).expect("fixture tensors");
    with_metadata(tensors, depth)
}

/// Encoder with `history` boundary norms, decoder with one norm per layer.
pub fn translation_state_with_decoder_history(depth: usize, history: usize) -> ModelState {
    let mut tensors = flat_tensors(depth, depth, history).expect("fixture tensors");
    for j in 0..depth {
        let weight = patterned(&[DIM], 500.0 + j as f64).expect("history tensor");
        tensors.push((history_key(Role::Decoder, j, "weight"), weight));
    }
    with_metadata(tensors, depth)
}

fn with_metadata(tensors: Vec<(String, Tensor)>, depth: usize) -> ModelState {
    let metadata = StateMetadata::new(format!("transformer_t2t_wmt_en_de_{}l", depth), depth, depth)
        .with_progress(20, 31_000);
    let mut state = ModelState::from_flat(tensors, metadata).expect("valid fixture");
    state.optimizer_state = Some(
        [(
            "exp_avg.encoder.embed_tokens.weight".to_string(),
            patterned(&[VOCAB, DIM], 9.0).expect("optimizer tensor"),
        )]
        .into_iter()
        .collect(),
    );
    state
}
