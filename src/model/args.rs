//! Model and quantization metadata read once at initialization.
//!
//! Field values come from a checkpoint's `config.json`; the per-family
//! loaders in the registry map the checkpoint's native key names onto this
//! struct.

use serde::{Deserialize, Serialize};

/// Architecture metadata the core consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArgs {
    /// Model family name, e.g. `llama` or `gpt_neox`.
    pub model_type: String,
    /// Dimension of the decoder layer.
    pub hidden_size: usize,
    /// Dimension of the feed-forward layer.
    pub intermediate_size: usize,
    /// Number of decoder layers.
    pub n_layers: usize,
    /// Number of attention heads.
    pub n_heads: usize,
    /// Number of key/value heads; `None` means multi-head attention.
    pub n_kv_heads: Option<usize>,
    /// Number of tokens in the vocabulary.
    pub vocab_size: usize,
    /// Epsilon for rms norm.
    pub rms_norm_eps: f64,
    /// Epsilon for layer norm.
    pub layer_norm_eps: f64,
    /// Base period of the rotary position embeddings.
    pub rope_theta: f64,
    /// Fraction of the head dimension given to rotary embeddings.
    pub rotary_pct: f32,
    /// Maximum sequence length for position embeddings.
    pub max_position_embeddings: usize,
    /// Token id for beginning of sentence.
    pub bos_token_id: u32,
    /// Token id for end of sentence.
    pub eos_token_id: u32,
    /// GPT-NeoX: run attention and MLP from the same normed input.
    pub use_parallel_residual: bool,
    /// Bloom: residual connects from the post-layernorm activations.
    pub residual_post_layernorm: bool,
    /// MPT: linear layers carry no bias.
    pub no_bias: bool,
    /// MPT: layer-norm queries and keys before attention.
    pub attn_qk_ln: bool,
    /// Use ALiBi attention biases instead of rotary embeddings.
    pub attn_alibi: bool,
    /// ALiBi maximum bias.
    pub alibi_bias_max: f32,
    /// MPT: clamp fused QKV activations to `[-clip, clip]`.
    pub attn_qkv_clip: Option<f32>,
    /// Checkpoint dtype hint, resolved through the dtype table.
    pub dtype: String,
}

impl Default for ModelArgs {
    fn default() -> Self {
        Self {
            model_type: String::new(),
            hidden_size: 0,
            intermediate_size: 0,
            n_layers: 0,
            n_heads: 0,
            n_kv_heads: None,
            vocab_size: 0,
            rms_norm_eps: 1e-5,
            layer_norm_eps: 1e-5,
            rope_theta: 10000.0,
            rotary_pct: 1.0,
            max_position_embeddings: 2048,
            bos_token_id: 1,
            eos_token_id: 2,
            use_parallel_residual: false,
            residual_post_layernorm: false,
            no_bias: false,
            attn_qk_ln: false,
            attn_alibi: false,
            alibi_bias_max: 8.0,
            attn_qkv_clip: None,
            dtype: String::new(),
        }
    }
}

impl ModelArgs {
    /// Dimension per attention head.
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.n_heads
    }

    /// Number of key/value heads, defaulting to the query head count.
    pub fn n_kv_heads(&self) -> usize {
        self.n_kv_heads.unwrap_or(self.n_heads)
    }
}

/// Weight-only quantization metadata, threaded through to model factories.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuantArgs {
    /// Quantization scheme, e.g. `gptq`; empty means unquantized.
    pub quant_method: String,
    /// Quantization bits.
    pub bits: usize,
    /// Quantization group size.
    pub group_size: usize,
    /// Activation-order quantization.
    pub desc_act: bool,
    /// Quantize layers in their forward order.
    pub true_sequential: bool,
}

impl QuantArgs {
    /// Whether a quantization scheme is configured.
    pub fn is_quantized(&self) -> bool {
        !self.quant_method.is_empty()
    }
}
