//! Model registry: an explicit table from `model_type` to the factories
//! needed to load that family.
//!
//! The registry is a value owned by the engine, populated once at startup
//! from the builtin table; there is no global state. Each entry carries the
//! family's config loader (mapping the checkpoint's native `config.json`
//! keys onto [`ModelArgs`]), a quantization-config loader, and the model
//! factory producing the tagged [`CausalLM`] variant.

use std::collections::HashMap;

use candle_core::{DType, Device};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::args::{ModelArgs, QuantArgs};
use crate::model::causal_lm::{
    BloomForCausalLM, CausalLM, Gpt2ForCausalLM, GptNeoXForCausalLM, LlamaForCausalLM,
    MptForCausalLM,
};
use crate::parallel::ParallelArgs;

/// Build one family's model on a device.
pub type ModelFactory =
    fn(&ModelArgs, &QuantArgs, &ParallelArgs, DType, &Device) -> Result<CausalLM>;

/// Map a checkpoint's `config.json` onto [`ModelArgs`].
pub type ArgsLoader = fn(&Value) -> Result<ModelArgs>;

/// Map quantization metadata onto [`QuantArgs`].
pub type QuantArgsLoader = fn(&Value) -> Result<QuantArgs>;

/// Factories for one recognized model family.
#[derive(Clone)]
pub struct ModelEntry {
    pub model_type: &'static str,
    pub factory: ModelFactory,
    pub args_loader: ArgsLoader,
    pub quant_args_loader: QuantArgsLoader,
}

/// Registry of recognized model families.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    entries: HashMap<String, ModelEntry>,
}

impl ModelRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The builtin family table.
    pub fn with_builtin_models() -> Self {
        let mut registry = Self::new();
        registry.register(ModelEntry {
            model_type: "llama",
            factory: |args, quant, parallel, dtype, device| {
                Ok(CausalLM::Llama(LlamaForCausalLM::new(
                    args, quant, parallel, dtype, device,
                )?))
            },
            args_loader: load_llama_args,
            quant_args_loader: load_quant_args,
        });
        registry.register(ModelEntry {
            model_type: "gpt2",
            factory: |args, quant, parallel, dtype, device| {
                Ok(CausalLM::Gpt2(Gpt2ForCausalLM::new(
                    args, quant, parallel, dtype, device,
                )?))
            },
            args_loader: load_gpt2_args,
            quant_args_loader: load_quant_args,
        });
        registry.register(ModelEntry {
            model_type: "gpt_neox",
            factory: |args, quant, parallel, dtype, device| {
                Ok(CausalLM::GptNeoX(GptNeoXForCausalLM::new(
                    args, quant, parallel, dtype, device,
                )?))
            },
            args_loader: load_gpt_neox_args,
            quant_args_loader: load_quant_args,
        });
        registry.register(ModelEntry {
            model_type: "mpt",
            factory: |args, quant, parallel, dtype, device| {
                Ok(CausalLM::Mpt(MptForCausalLM::new(
                    args, quant, parallel, dtype, device,
                )?))
            },
            args_loader: load_mpt_args,
            quant_args_loader: load_quant_args,
        });
        registry.register(ModelEntry {
            model_type: "bloom",
            factory: |args, quant, parallel, dtype, device| {
                Ok(CausalLM::Bloom(BloomForCausalLM::new(
                    args, quant, parallel, dtype, device,
                )?))
            },
            args_loader: load_bloom_args,
            quant_args_loader: load_quant_args,
        });
        registry
    }

    /// Add or replace a family entry.
    pub fn register(&mut self, entry: ModelEntry) {
        self.entries.insert(entry.model_type.to_string(), entry);
    }

    /// Look up a family by `model_type`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an unrecognized name.
    pub fn lookup(&self, model_type: &str) -> Result<&ModelEntry> {
        self.entries.get(model_type).ok_or_else(|| {
            Error::Config(format!("unrecognized model type: {model_type}"))
        })
    }

    /// Registered family names.
    pub fn model_types(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

fn as_usize(json: &Value, key: &str, default: usize) -> usize {
    json.get(key)
        .and_then(Value::as_u64)
        .map_or(default, |v| v as usize)
}

fn as_f64(json: &Value, key: &str, default: f64) -> f64 {
    json.get(key).and_then(Value::as_f64).unwrap_or(default)
}

fn as_bool(json: &Value, key: &str, default: bool) -> bool {
    json.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn as_u32(json: &Value, key: &str, default: u32) -> u32 {
    json.get(key)
        .and_then(Value::as_u64)
        .map_or(default, |v| v as u32)
}

fn as_string(json: &Value, key: &str) -> String {
    json.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn load_llama_args(json: &Value) -> Result<ModelArgs> {
    let hidden_size = as_usize(json, "hidden_size", 4096);
    Ok(ModelArgs {
        model_type: "llama".to_string(),
        hidden_size,
        intermediate_size: as_usize(json, "intermediate_size", 11008),
        n_layers: as_usize(json, "num_hidden_layers", 32),
        n_heads: as_usize(json, "num_attention_heads", 32),
        n_kv_heads: json
            .get("num_key_value_heads")
            .and_then(Value::as_u64)
            .map(|v| v as usize),
        vocab_size: as_usize(json, "vocab_size", 32000),
        rms_norm_eps: as_f64(json, "rms_norm_eps", 1e-5),
        rope_theta: as_f64(json, "rope_theta", 10000.0),
        max_position_embeddings: as_usize(json, "max_position_embeddings", 2048),
        bos_token_id: as_u32(json, "bos_token_id", 1),
        eos_token_id: as_u32(json, "eos_token_id", 2),
        dtype: as_string(json, "torch_dtype"),
        ..Default::default()
    })
}

fn load_gpt2_args(json: &Value) -> Result<ModelArgs> {
    let hidden_size = as_usize(json, "n_embd", 768);
    Ok(ModelArgs {
        model_type: "gpt2".to_string(),
        hidden_size,
        intermediate_size: as_usize(json, "n_inner", 4 * hidden_size),
        n_layers: as_usize(json, "n_layer", 12),
        n_heads: as_usize(json, "n_head", 12),
        vocab_size: as_usize(json, "vocab_size", 50257),
        layer_norm_eps: as_f64(json, "layer_norm_epsilon", 1e-5),
        max_position_embeddings: as_usize(json, "n_positions", 1024),
        bos_token_id: as_u32(json, "bos_token_id", 50256),
        eos_token_id: as_u32(json, "eos_token_id", 50256),
        dtype: as_string(json, "torch_dtype"),
        ..Default::default()
    })
}

fn load_gpt_neox_args(json: &Value) -> Result<ModelArgs> {
    Ok(ModelArgs {
        model_type: "gpt_neox".to_string(),
        hidden_size: as_usize(json, "hidden_size", 6144),
        intermediate_size: as_usize(json, "intermediate_size", 24576),
        n_layers: as_usize(json, "num_hidden_layers", 44),
        n_heads: as_usize(json, "num_attention_heads", 64),
        vocab_size: as_usize(json, "vocab_size", 50432),
        layer_norm_eps: as_f64(json, "layer_norm_eps", 1e-5),
        rope_theta: as_f64(json, "rotary_emb_base", 10000.0),
        rotary_pct: as_f64(json, "rotary_pct", 0.25) as f32,
        max_position_embeddings: as_usize(json, "max_position_embeddings", 2048),
        bos_token_id: as_u32(json, "bos_token_id", 0),
        eos_token_id: as_u32(json, "eos_token_id", 2),
        use_parallel_residual: as_bool(json, "use_parallel_residual", true),
        dtype: as_string(json, "torch_dtype"),
        ..Default::default()
    })
}

fn load_mpt_args(json: &Value) -> Result<ModelArgs> {
    let hidden_size = as_usize(json, "d_model", 2048);
    let expansion = as_usize(json, "expansion_ratio", 4);
    let attn_config = json.get("attn_config").cloned().unwrap_or(Value::Null);
    Ok(ModelArgs {
        model_type: "mpt".to_string(),
        hidden_size,
        intermediate_size: as_usize(json, "intermediate_size", expansion * hidden_size),
        n_layers: as_usize(json, "n_layers", 32),
        n_heads: as_usize(json, "n_heads", 32),
        vocab_size: as_usize(json, "vocab_size", 50368),
        layer_norm_eps: as_f64(json, "layer_norm_eps", 1e-5),
        max_position_embeddings: as_usize(json, "max_seq_len", 2048),
        bos_token_id: as_u32(json, "bos_token_id", 0),
        eos_token_id: as_u32(json, "eos_token_id", 0),
        no_bias: as_bool(json, "no_bias", true),
        attn_qk_ln: as_bool(&attn_config, "qk_ln", false),
        attn_alibi: as_bool(&attn_config, "alibi", true),
        alibi_bias_max: as_f64(&attn_config, "alibi_bias_max", 8.0) as f32,
        attn_qkv_clip: attn_config
            .get("clip_qkv")
            .and_then(Value::as_f64)
            .map(|v| v as f32),
        dtype: as_string(json, "torch_dtype"),
        ..Default::default()
    })
}

fn load_bloom_args(json: &Value) -> Result<ModelArgs> {
    let hidden_size = as_usize(json, "n_embed", as_usize(json, "hidden_size", 14336));
    Ok(ModelArgs {
        model_type: "bloom".to_string(),
        hidden_size,
        intermediate_size: as_usize(json, "intermediate_size", 4 * hidden_size),
        n_layers: as_usize(json, "n_layer", 70),
        n_heads: as_usize(json, "num_attention_heads", 112),
        vocab_size: as_usize(json, "vocab_size", 250880),
        layer_norm_eps: as_f64(json, "layer_norm_epsilon", 1e-5),
        bos_token_id: as_u32(json, "bos_token_id", 1),
        eos_token_id: as_u32(json, "eos_token_id", 2),
        residual_post_layernorm: as_bool(
            json,
            "apply_residual_connection_post_layernorm",
            false,
        ),
        attn_alibi: true,
        dtype: as_string(json, "torch_dtype"),
        ..Default::default()
    })
}

/// Quantization metadata from `quantization_config` (or a standalone
/// `quantize_config.json` object).
pub fn load_quant_args(json: &Value) -> Result<QuantArgs> {
    let config = json.get("quantization_config").unwrap_or(json);
    Ok(QuantArgs {
        quant_method: as_string(config, "quant_method"),
        bits: as_usize(config, "bits", 0),
        group_size: as_usize(config, "group_size", 0),
        desc_act: as_bool(config, "desc_act", false),
        true_sequential: as_bool(config, "true_sequential", false),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup_builtin() {
        let registry = ModelRegistry::with_builtin_models();
        assert!(registry.lookup("llama").is_ok());
        assert!(registry.lookup("gpt_neox").is_ok());
        assert!(registry.lookup("falcon").is_err());
    }

    #[test]
    fn test_llama_args_from_config() {
        let registry = ModelRegistry::with_builtin_models();
        let entry = registry.lookup("llama").unwrap();
        let config = json!({
            "hidden_size": 256,
            "intermediate_size": 512,
            "num_hidden_layers": 2,
            "num_attention_heads": 4,
            "num_key_value_heads": 2,
            "vocab_size": 1000,
            "rms_norm_eps": 1e-6,
            "torch_dtype": "bfloat16",
        });
        let args = (entry.args_loader)(&config).unwrap();
        assert_eq!(args.hidden_size, 256);
        assert_eq!(args.n_kv_heads, Some(2));
        assert_eq!(args.head_dim(), 64);
        assert_eq!(args.dtype, "bfloat16");
    }

    #[test]
    fn test_quant_args_nested() {
        let config = json!({
            "quantization_config": {
                "quant_method": "gptq",
                "bits": 4,
                "group_size": 128,
                "desc_act": true,
            }
        });
        let quant = load_quant_args(&config).unwrap();
        assert!(quant.is_quantized());
        assert_eq!(quant.bits, 4);
        assert!(quant.desc_act);
    }
}
