//! The recognized model families, as a tagged variant over concrete model
//! structures sharing one capability set: `forward`, `load_state_dict`,
//! `verify_loaded_weights`.
//!
//! Each family is the shared [`DecoderStack`] configured with that family's
//! checkpoint layout and layer wiring. The engine and workers only ever see
//! [`CausalLM`].

use candle_core::{DType, Device, Tensor};
use tracing::warn;

use crate::batch::input_params::InputParameters;
use crate::core::kv_cache::KvCache;
use crate::error::Result;
use crate::model::args::{ModelArgs, QuantArgs};
use crate::model::attention::QkvLayout;
use crate::model::decoder::{DecoderStack, FamilySpec, MlpKind, NormKind, PosKind, QkvNames};
use crate::model::layers::MlpNames;
use crate::model::state_dict::StateDict;
use crate::parallel::ParallelArgs;

const LLAMA_SPEC: FamilySpec = FamilySpec {
    embed: "model.embed_tokens.",
    pos_embed: None,
    embed_norm: None,
    layer_prefix: "model.layers.",
    final_norm: "model.norm.",
    lm_head: Some("lm_head."),
    attn_prefix: "self_attn.",
    qkv: QkvNames::Split {
        q: "q_proj.",
        k: "k_proj.",
        v: "v_proj.",
    },
    o_proj: "o_proj.",
    qk_norm: None,
    input_norm: "input_layernorm.",
    post_norm: "post_attention_layernorm.",
    mlp_prefix: "mlp.",
    mlp_names: MlpNames {
        gate: "gate_proj.",
        up: "up_proj.",
        down: "down_proj.",
    },
    norm: NormKind::Rms,
    mlp: MlpKind::SwiGlu,
    pos: PosKind::Rotary { interleaved: false },
    qkv_layout: QkvLayout::QkvMajor,
    transpose_weights: false,
    linear_bias: false,
};

const GPT2_SPEC: FamilySpec = FamilySpec {
    embed: "transformer.wte.",
    pos_embed: Some("transformer.wpe."),
    embed_norm: None,
    layer_prefix: "transformer.h.",
    final_norm: "transformer.ln_f.",
    lm_head: None,
    attn_prefix: "attn.",
    qkv: QkvNames::Fused("c_attn."),
    o_proj: "c_proj.",
    qk_norm: None,
    input_norm: "ln_1.",
    post_norm: "ln_2.",
    mlp_prefix: "mlp.",
    mlp_names: MlpNames {
        gate: "",
        up: "c_fc.",
        down: "c_proj.",
    },
    norm: NormKind::Layer,
    mlp: MlpKind::Gelu,
    pos: PosKind::Learned,
    qkv_layout: QkvLayout::QkvMajor,
    transpose_weights: true,
    linear_bias: true,
};

const GPT_NEOX_SPEC: FamilySpec = FamilySpec {
    embed: "gpt_neox.embed_in.",
    pos_embed: None,
    embed_norm: None,
    layer_prefix: "gpt_neox.layers.",
    final_norm: "gpt_neox.final_layer_norm.",
    lm_head: Some("embed_out."),
    attn_prefix: "attention.",
    qkv: QkvNames::Fused("query_key_value."),
    o_proj: "dense.",
    qk_norm: None,
    input_norm: "input_layernorm.",
    post_norm: "post_attention_layernorm.",
    mlp_prefix: "mlp.",
    mlp_names: MlpNames {
        gate: "",
        up: "dense_h_to_4h.",
        down: "dense_4h_to_h.",
    },
    norm: NormKind::Layer,
    mlp: MlpKind::Gelu,
    pos: PosKind::Rotary { interleaved: false },
    qkv_layout: QkvLayout::HeadsMajor,
    transpose_weights: false,
    linear_bias: true,
};

const MPT_SPEC: FamilySpec = FamilySpec {
    embed: "transformer.wte.",
    pos_embed: None,
    embed_norm: None,
    layer_prefix: "transformer.blocks.",
    final_norm: "transformer.norm_f.",
    lm_head: None,
    attn_prefix: "attn.",
    qkv: QkvNames::Fused("Wqkv."),
    o_proj: "out_proj.",
    qk_norm: Some(("q_ln.", "k_ln.")),
    input_norm: "norm_1.",
    post_norm: "norm_2.",
    mlp_prefix: "ffn.",
    mlp_names: MlpNames {
        gate: "",
        up: "up_proj.",
        down: "down_proj.",
    },
    norm: NormKind::Layer,
    mlp: MlpKind::Gelu,
    pos: PosKind::Alibi,
    qkv_layout: QkvLayout::QkvMajor,
    transpose_weights: false,
    linear_bias: true,
};

const BLOOM_SPEC: FamilySpec = FamilySpec {
    embed: "transformer.word_embeddings.",
    pos_embed: None,
    embed_norm: Some("transformer.word_embeddings_layernorm."),
    layer_prefix: "transformer.h.",
    final_norm: "transformer.ln_f.",
    lm_head: None,
    attn_prefix: "self_attention.",
    qkv: QkvNames::Fused("query_key_value."),
    o_proj: "dense.",
    qk_norm: None,
    input_norm: "input_layernorm.",
    post_norm: "post_attention_layernorm.",
    mlp_prefix: "mlp.",
    mlp_names: MlpNames {
        gate: "",
        up: "dense_h_to_4h.",
        down: "dense_4h_to_h.",
    },
    norm: NormKind::Layer,
    mlp: MlpKind::Gelu,
    pos: PosKind::Alibi,
    qkv_layout: QkvLayout::HeadsMajor,
    transpose_weights: false,
    linear_bias: true,
};

fn build_stack(
    spec: FamilySpec,
    args: &ModelArgs,
    quant_args: &QuantArgs,
    parallel: &ParallelArgs,
    dtype: DType,
    device: &Device,
) -> Result<DecoderStack> {
    if quant_args.is_quantized() {
        // Weight-only quantized execution is handled by the kernel layer;
        // the generic path loads dequantized weights.
        warn!(
            method = %quant_args.quant_method,
            bits = quant_args.bits,
            "quantized checkpoint metadata accepted; executing with generic kernels"
        );
    }
    DecoderStack::new(args, spec, parallel, dtype, device)
}

macro_rules! family {
    ($(#[$doc:meta])* $name:ident, $spec:expr) => {
        $(#[$doc])*
        pub struct $name {
            stack: DecoderStack,
        }

        impl $name {
            pub fn new(
                args: &ModelArgs,
                quant_args: &QuantArgs,
                parallel: &ParallelArgs,
                dtype: DType,
                device: &Device,
            ) -> Result<Self> {
                Ok(Self {
                    stack: build_stack($spec, args, quant_args, parallel, dtype, device)?,
                })
            }
        }
    };
}

family!(
    /// Llama-style decoder: RMS norm, SwiGLU, rotary embeddings, grouped KV.
    LlamaForCausalLM,
    LLAMA_SPEC
);
family!(
    /// GPT-2: learned positions, Conv1D checkpoints, fused QKV, GELU.
    Gpt2ForCausalLM,
    GPT2_SPEC
);
family!(
    /// GPT-NeoX: parallel residual, partial rotary, heads-major fused QKV.
    GptNeoXForCausalLM,
    GPT_NEOX_SPEC
);
family!(
    /// MPT: ALiBi attention, bias-free linears, optional QK layer norm.
    MptForCausalLM,
    MPT_SPEC
);
family!(
    /// Bloom: ALiBi attention, embedding layer norm, heads-major fused QKV.
    BloomForCausalLM,
    BLOOM_SPEC
);

/// The capability set every model family provides, as a tagged variant.
pub enum CausalLM {
    Llama(LlamaForCausalLM),
    Gpt2(Gpt2ForCausalLM),
    GptNeoX(GptNeoXForCausalLM),
    Mpt(MptForCausalLM),
    Bloom(BloomForCausalLM),
}

impl CausalLM {
    fn stack(&self) -> &DecoderStack {
        match self {
            Self::Llama(m) => &m.stack,
            Self::Gpt2(m) => &m.stack,
            Self::GptNeoX(m) => &m.stack,
            Self::Mpt(m) => &m.stack,
            Self::Bloom(m) => &m.stack,
        }
    }

    fn stack_mut(&mut self) -> &mut DecoderStack {
        match self {
            Self::Llama(m) => &mut m.stack,
            Self::Gpt2(m) => &mut m.stack,
            Self::GptNeoX(m) => &mut m.stack,
            Self::Mpt(m) => &mut m.stack,
            Self::Bloom(m) => &mut m.stack,
        }
    }

    /// One forward pass over a packed batch; returns logits for the sampling
    /// positions, `[num_seqs, vocab_size]`.
    pub fn forward(
        &self,
        token_ids: &Tensor,
        positions: &Tensor,
        kv_caches: &mut [KvCache],
        input_params: &InputParameters,
    ) -> Result<Tensor> {
        self.stack()
            .forward(token_ids, positions, kv_caches, input_params)
    }

    /// Stream one checkpoint shard into the model.
    pub fn load_state_dict(&mut self, sd: &StateDict) -> Result<()> {
        self.stack_mut().load_state_dict(sd)
    }

    /// Fail with the list of still-missing parameters, if any.
    pub fn verify_loaded_weights(&self) -> Result<()> {
        self.stack().verify_loaded_weights()
    }
}
