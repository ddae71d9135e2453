//! Shared fixtures: a tiny deterministic llama checkpoint.
#![allow(dead_code)]

use std::collections::HashMap;

use candle_core::{Device, Tensor};
use pagedserve::model::StateDict;
use serde_json::{json, Value};

/// Hidden size of the fixture model.
pub const HIDDEN: usize = 16;
/// Number of layers of the fixture model.
pub const LAYERS: usize = 2;
/// Vocab size of the fixture model.
pub const VOCAB: usize = 32;

/// `config.json` for the fixture model.
pub fn tiny_llama_config() -> Value {
    json!({
        "model_type": "llama",
        "hidden_size": HIDDEN,
        "intermediate_size": 2 * HIDDEN,
        "num_hidden_layers": LAYERS,
        "num_attention_heads": 4,
        "num_key_value_heads": 2,
        "vocab_size": VOCAB,
        "rms_norm_eps": 1e-5,
        "rope_theta": 10000.0,
        "max_position_embeddings": 64,
        "bos_token_id": 1,
        "eos_token_id": 2,
        "torch_dtype": "float32",
    })
}

// Deterministic filler in [-0.1, 0.1] so runs are reproducible without a
// rand dependency in the fixture.
fn filler(shape: &[usize], seed: u64, device: &Device) -> Tensor {
    let n: usize = shape.iter().product();
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    let data: Vec<f32> = (0..n)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (((state >> 40) & 0xffffff) as f32 / 16_777_216.0 - 0.5) * 0.2
        })
        .collect();
    Tensor::from_vec(data, shape.to_vec(), device).unwrap()
}

fn ones(shape: &[usize], device: &Device) -> Tensor {
    Tensor::ones(shape.to_vec(), candle_core::DType::F32, device).unwrap()
}

/// LM-head flavor of the fixture checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadKind {
    /// Deterministic filler weights; sampled tokens are arbitrary.
    Random,
    /// Rows 2 (+10) and 3 (-10): the greedy token is always the EOS token
    /// or a conventional stop token, whatever the hidden state's sign.
    ForcedStop,
    /// Rows 4 (+10) and 5 (-10): the greedy token is never a stop token,
    /// so generation always runs to its max-new-tokens budget.
    NeverStop,
}

/// Full weight shard for the fixture model.
pub fn tiny_llama_state_dict(device: &Device, head: HeadKind) -> StateDict {
    let kv_dim = HIDDEN / 2; // 2 kv heads of head_dim 4
    let inter = 2 * HIDDEN;
    let mut map: HashMap<String, Tensor> = HashMap::new();
    map.insert(
        "model.embed_tokens.weight".to_string(),
        filler(&[VOCAB, HIDDEN], 1, device),
    );
    for i in 0..LAYERS {
        let p = format!("model.layers.{i}.");
        let s = (i as u64 + 2) * 100;
        map.insert(format!("{p}input_layernorm.weight"), ones(&[HIDDEN], device));
        map.insert(
            format!("{p}self_attn.q_proj.weight"),
            filler(&[HIDDEN, HIDDEN], s + 1, device),
        );
        map.insert(
            format!("{p}self_attn.k_proj.weight"),
            filler(&[kv_dim, HIDDEN], s + 2, device),
        );
        map.insert(
            format!("{p}self_attn.v_proj.weight"),
            filler(&[kv_dim, HIDDEN], s + 3, device),
        );
        map.insert(
            format!("{p}self_attn.o_proj.weight"),
            filler(&[HIDDEN, HIDDEN], s + 4, device),
        );
        map.insert(
            format!("{p}post_attention_layernorm.weight"),
            ones(&[HIDDEN], device),
        );
        map.insert(
            format!("{p}mlp.gate_proj.weight"),
            filler(&[inter, HIDDEN], s + 5, device),
        );
        map.insert(
            format!("{p}mlp.up_proj.weight"),
            filler(&[inter, HIDDEN], s + 6, device),
        );
        map.insert(
            format!("{p}mlp.down_proj.weight"),
            filler(&[HIDDEN, inter], s + 7, device),
        );
    }
    map.insert("model.norm.weight".to_string(), ones(&[HIDDEN], device));

    let lm_head = match head {
        HeadKind::Random => filler(&[VOCAB, HIDDEN], 9, device),
        HeadKind::ForcedStop | HeadKind::NeverStop => {
            let (hi, lo) = if head == HeadKind::ForcedStop { (2, 3) } else { (4, 5) };
            let mut data = vec![0f32; VOCAB * HIDDEN];
            for c in 0..HIDDEN {
                data[hi * HIDDEN + c] = 10.0;
                data[lo * HIDDEN + c] = -10.0;
            }
            Tensor::from_vec(data, (VOCAB, HIDDEN), device).unwrap()
        }
    };
    map.insert("lm_head.weight".to_string(), lm_head);

    StateDict::from_tensors(map)
}
