//! Shared decoder stack the model families configure.
//!
//! Every supported family is a decoder-only transformer; they differ in
//! parameter naming, norm flavor, activation, position handling, residual
//! wiring, and fused-QKV layout. [`FamilySpec`] captures those differences
//! as data so the stack itself is written once.

use candle_core::{DType, Device, Tensor};

use crate::batch::input_params::InputParameters;
use crate::core::kv_cache::KvCache;
use crate::error::{Error, Result};
use crate::model::args::ModelArgs;
use crate::model::attention::{
    AlibiSlopes, FusedQkvParallelLinear, PagedAttention, PosEncoding, QkvLayout, RotaryEmbedding,
};
use crate::model::layers::{
    ColumnParallelLinear, Embedding, LayerNorm, Linear, Mlp, MlpNames, Norm, RmsNorm,
    RowParallelLinear, SwiGluMlp,
};
use crate::model::layers::GeluMlp;
use crate::model::state_dict::StateDict;
use crate::parallel::{shard, ParallelArgs};

/// Fused or per-projection QKV parameter names.
#[derive(Debug, Clone, Copy)]
pub enum QkvNames {
    Fused(&'static str),
    Split {
        q: &'static str,
        k: &'static str,
        v: &'static str,
    },
}

/// Norm flavor a family uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormKind {
    Rms,
    Layer,
}

/// Feed-forward flavor a family uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MlpKind {
    SwiGlu,
    Gelu,
}

/// Position-encoding flavor a family uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PosKind {
    /// Rotary embeddings; `interleaved` selects the pairing convention.
    Rotary { interleaved: bool },
    /// ALiBi score biases.
    Alibi,
    /// Learned position embeddings added to the token embeddings.
    Learned,
}

/// Everything family-specific about checkpoint layout and layer wiring.
#[derive(Debug, Clone, Copy)]
pub struct FamilySpec {
    pub embed: &'static str,
    /// Learned position table (GPT-2 style), if the family has one.
    pub pos_embed: Option<&'static str>,
    /// Embedding layer norm (Bloom), if the family has one.
    pub embed_norm: Option<&'static str>,
    pub layer_prefix: &'static str,
    pub final_norm: &'static str,
    /// Output projection parameter; `None` ties it to the token embedding.
    pub lm_head: Option<&'static str>,
    pub attn_prefix: &'static str,
    pub qkv: QkvNames,
    pub o_proj: &'static str,
    /// MPT-style query/key layer norms.
    pub qk_norm: Option<(&'static str, &'static str)>,
    pub input_norm: &'static str,
    pub post_norm: &'static str,
    pub mlp_prefix: &'static str,
    pub mlp_names: MlpNames,
    pub norm: NormKind,
    pub mlp: MlpKind,
    pub pos: PosKind,
    /// Layout of the fused QKV parameter; ignored for split projections.
    pub qkv_layout: QkvLayout,
    /// Conv1D-style checkpoints store linear weights transposed (GPT-2).
    pub transpose_weights: bool,
    /// Whether the family's linear layers carry biases (MPT's `no_bias`
    /// overrides this from the checkpoint config).
    pub linear_bias: bool,
}

fn weight_transform(transpose: bool) -> Box<dyn Fn(&Tensor) -> Result<Tensor>> {
    if transpose {
        Box::new(|w: &Tensor| Ok(w.t()?.contiguous()?))
    } else {
        Box::new(|w: &Tensor| Ok(w.clone()))
    }
}

// Shard every tensor of a scoped state dict along dim 0 (for parameters
// that live in the column-parallel activation space, like MPT's q_ln).
fn shard_state_dict(sd: &StateDict, parallel: &ParallelArgs) -> Result<StateDict> {
    let mut map = std::collections::HashMap::new();
    for name in sd.keys() {
        if let Some(t) = sd.get(name) {
            map.insert(
                name.clone(),
                shard(t, 0, parallel.rank(), parallel.world_size())?.contiguous()?,
            );
        }
    }
    Ok(StateDict::from_tensors(map))
}

enum QkvProj {
    Fused(FusedQkvParallelLinear),
    Split {
        q: ColumnParallelLinear,
        k: ColumnParallelLinear,
        v: ColumnParallelLinear,
    },
}

/// One layer's attention: QKV projection, paged attention, output projection.
struct AttentionLayer {
    qkv: QkvProj,
    o_proj: RowParallelLinear,
    q_ln: Option<LayerNorm>,
    k_ln: Option<LayerNorm>,
    qkv_clip: Option<f32>,
    attention: PagedAttention,
    spec: FamilySpec,
}

impl AttentionLayer {
    fn new(
        args: &ModelArgs,
        spec: FamilySpec,
        pos: PosEncoding,
        has_bias: bool,
        parallel: ParallelArgs,
    ) -> Result<Self> {
        let world = parallel.world_size();
        if args.n_heads % world != 0 || args.n_kv_heads() % world != 0 {
            return Err(Error::Config(format!(
                "{} heads / {} kv heads not divisible across {world} ranks",
                args.n_heads,
                args.n_kv_heads()
            )));
        }
        let head_dim = args.head_dim();
        let qkv = match spec.qkv {
            QkvNames::Fused(_) => QkvProj::Fused(FusedQkvParallelLinear::new(
                has_bias,
                spec.qkv_layout,
                head_dim,
                parallel.clone(),
            )),
            QkvNames::Split { .. } => QkvProj::Split {
                q: ColumnParallelLinear::new(has_bias, parallel.clone()),
                k: ColumnParallelLinear::new(has_bias, parallel.clone()),
                v: ColumnParallelLinear::new(has_bias, parallel.clone()),
            },
        };
        let (q_ln, k_ln) = if args.attn_qk_ln {
            (
                Some(LayerNorm::new(has_bias, args.layer_norm_eps)),
                Some(LayerNorm::new(has_bias, args.layer_norm_eps)),
            )
        } else {
            (None, None)
        };
        Ok(Self {
            qkv,
            o_proj: RowParallelLinear::new(has_bias, parallel.clone()),
            q_ln,
            k_ln,
            qkv_clip: args.attn_qkv_clip,
            attention: PagedAttention::new(
                args.n_heads / world,
                args.n_kv_heads() / world,
                head_dim,
                pos,
            ),
            spec,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        positions: &Tensor,
        kv_cache: &mut KvCache,
        input_params: &InputParameters,
    ) -> Result<Tensor> {
        let (mut q, mut k, mut v) = match &self.qkv {
            QkvProj::Fused(fused) => fused.forward(x)?,
            QkvProj::Split { q, k, v } => (q.forward(x)?, k.forward(x)?, v.forward(x)?),
        };
        if let Some(clip) = self.qkv_clip {
            q = FusedQkvParallelLinear::clamp(&q, clip)?;
            k = FusedQkvParallelLinear::clamp(&k, clip)?;
            v = FusedQkvParallelLinear::clamp(&v, clip)?;
        }
        if let Some(ln) = &self.q_ln {
            q = ln.forward(&q)?;
        }
        if let Some(ln) = &self.k_ln {
            k = ln.forward(&k)?;
        }
        let out = self
            .attention
            .forward(&q, &k, &v, positions, kv_cache, input_params)?;
        self.o_proj.forward(&out)
    }

    fn load_state_dict(&mut self, sd: &StateDict, parallel: &ParallelArgs) -> Result<()> {
        let sd = sd.select(self.spec.attn_prefix);
        let transform = weight_transform(self.spec.transpose_weights);
        match (&mut self.qkv, self.spec.qkv) {
            (QkvProj::Fused(fused), QkvNames::Fused(name)) => {
                fused.load_state_dict_with(&sd.select(name), &transform)?;
            }
            (QkvProj::Split { q, k, v }, QkvNames::Split { q: qn, k: kn, v: vn }) => {
                q.load_state_dict_with(&sd.select(qn), &transform)?;
                k.load_state_dict_with(&sd.select(kn), &transform)?;
                v.load_state_dict_with(&sd.select(vn), &transform)?;
            }
            _ => unreachable!("qkv projection matches its spec by construction"),
        }
        self.o_proj
            .load_state_dict_with(&sd.select(self.spec.o_proj), &transform)?;
        if let (Some(q_ln), Some((qn, _))) = (&mut self.q_ln, self.spec.qk_norm) {
            q_ln.load_state_dict(&shard_state_dict(&sd.select(qn), parallel)?)?;
        }
        if let (Some(k_ln), Some((_, kn))) = (&mut self.k_ln, self.spec.qk_norm) {
            k_ln.load_state_dict(&shard_state_dict(&sd.select(kn), parallel)?)?;
        }
        Ok(())
    }

    fn verify_loaded(&self, prefix: &str, out: &mut Vec<String>) {
        let prefix = format!("{prefix}{}", self.spec.attn_prefix);
        match (&self.qkv, self.spec.qkv) {
            (QkvProj::Fused(fused), QkvNames::Fused(name)) => {
                fused.verify_loaded(&format!("{prefix}{name}"), out);
            }
            (QkvProj::Split { q, k, v }, QkvNames::Split { q: qn, k: kn, v: vn }) => {
                q.verify_loaded(&format!("{prefix}{qn}"), out);
                k.verify_loaded(&format!("{prefix}{kn}"), out);
                v.verify_loaded(&format!("{prefix}{vn}"), out);
            }
            _ => {}
        }
        self.o_proj
            .verify_loaded(&format!("{prefix}{}", self.spec.o_proj), out);
        if let (Some(q_ln), Some((qn, _))) = (&self.q_ln, self.spec.qk_norm) {
            q_ln.verify_loaded(&format!("{prefix}{qn}"), out);
        }
        if let (Some(k_ln), Some((_, kn))) = (&self.k_ln, self.spec.qk_norm) {
            k_ln.verify_loaded(&format!("{prefix}{kn}"), out);
        }
    }
}

/// One decoder layer.
struct TransformerBlock {
    input_norm: Norm,
    post_norm: Norm,
    attn: AttentionLayer,
    mlp: Mlp,
    parallel_residual: bool,
    residual_post_layernorm: bool,
    spec: FamilySpec,
}

impl TransformerBlock {
    fn new(args: &ModelArgs, spec: FamilySpec, pos: PosEncoding, parallel: ParallelArgs) -> Result<Self> {
        let has_bias = spec.linear_bias && !args.no_bias;
        let make_norm = || match spec.norm {
            NormKind::Rms => Norm::Rms(RmsNorm::new(args.rms_norm_eps)),
            NormKind::Layer => Norm::Layer(LayerNorm::new(!args.no_bias, args.layer_norm_eps)),
        };
        let mlp = match spec.mlp {
            MlpKind::SwiGlu => Mlp::SwiGlu(SwiGluMlp::new(has_bias, parallel.clone())),
            MlpKind::Gelu => Mlp::Gelu(GeluMlp::new(
                has_bias,
                spec.transpose_weights,
                parallel.clone(),
            )),
        };
        Ok(Self {
            input_norm: make_norm(),
            post_norm: make_norm(),
            attn: AttentionLayer::new(args, spec, pos, has_bias, parallel)?,
            mlp,
            parallel_residual: args.use_parallel_residual,
            residual_post_layernorm: args.residual_post_layernorm,
            spec,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        positions: &Tensor,
        kv_cache: &mut KvCache,
        input_params: &InputParameters,
    ) -> Result<Tensor> {
        if self.parallel_residual {
            // x + attn(ln1(x)) + mlp(ln2(x))
            let attn_out =
                self.attn
                    .forward(&self.input_norm.forward(x)?, positions, kv_cache, input_params)?;
            let mlp_out = self.mlp.forward(&self.post_norm.forward(x)?)?;
            return Ok(x.add(&attn_out)?.add(&mlp_out)?);
        }

        let normed = self.input_norm.forward(x)?;
        let residual = if self.residual_post_layernorm {
            &normed
        } else {
            x
        };
        let h = residual.add(&self.attn.forward(&normed, positions, kv_cache, input_params)?)?;

        let normed = self.post_norm.forward(&h)?;
        let residual = if self.residual_post_layernorm {
            &normed
        } else {
            &h
        };
        Ok(residual.add(&self.mlp.forward(&normed)?)?)
    }

    fn load_state_dict(&mut self, sd: &StateDict, parallel: &ParallelArgs) -> Result<()> {
        self.input_norm
            .load_state_dict(&sd.select(self.spec.input_norm))?;
        self.post_norm
            .load_state_dict(&sd.select(self.spec.post_norm))?;
        self.attn.load_state_dict(sd, parallel)?;
        self.mlp
            .load_state_dict(&sd.select(self.spec.mlp_prefix), &self.spec.mlp_names)?;
        Ok(())
    }

    fn verify_loaded(&self, prefix: &str, out: &mut Vec<String>) {
        self.input_norm
            .verify_loaded(&format!("{prefix}{}", self.spec.input_norm), out);
        self.post_norm
            .verify_loaded(&format!("{prefix}{}", self.spec.post_norm), out);
        self.attn.verify_loaded(prefix, out);
        self.mlp.verify_loaded(
            &format!("{prefix}{}", self.spec.mlp_prefix),
            &self.spec.mlp_names,
            out,
        );
    }
}

/// Family-configured decoder-only transformer over a paged KV cache.
pub struct DecoderStack {
    embed_tokens: Embedding,
    pos_embed: Option<Embedding>,
    embed_norm: Option<LayerNorm>,
    layers: Vec<TransformerBlock>,
    final_norm: Norm,
    lm_head: Linear,
    spec: FamilySpec,
    parallel: ParallelArgs,
}

impl DecoderStack {
    /// Build an empty (unloaded) stack for `args` on `device`.
    pub fn new(
        args: &ModelArgs,
        spec: FamilySpec,
        parallel: &ParallelArgs,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let head_dim = args.head_dim();
        // Partial rotation rounds down to an even dimension.
        let rotary_dim = ((head_dim as f32 * args.rotary_pct) as usize).max(2) & !1usize;

        let mut layers = Vec::with_capacity(args.n_layers);
        for _ in 0..args.n_layers {
            let pos = match spec.pos {
                PosKind::Rotary { interleaved } => PosEncoding::Rotary(RotaryEmbedding::new(
                    rotary_dim,
                    args.max_position_embeddings,
                    args.rope_theta,
                    interleaved,
                    dtype,
                    device,
                )?),
                PosKind::Alibi => {
                    PosEncoding::Alibi(AlibiSlopes::new(args.n_heads, args.alibi_bias_max, parallel))
                }
                PosKind::Learned => PosEncoding::NoPos,
            };
            layers.push(TransformerBlock::new(args, spec, pos, parallel.clone())?);
        }

        let final_norm = match spec.norm {
            NormKind::Rms => Norm::Rms(RmsNorm::new(args.rms_norm_eps)),
            NormKind::Layer => Norm::Layer(LayerNorm::new(!args.no_bias, args.layer_norm_eps)),
        };
        Ok(Self {
            embed_tokens: Embedding::new(),
            pos_embed: spec.pos_embed.map(|_| Embedding::new()),
            embed_norm: spec
                .embed_norm
                .map(|_| LayerNorm::new(true, args.layer_norm_eps)),
            layers,
            final_norm,
            lm_head: Linear::new(false),
            spec,
            parallel: parallel.clone(),
        })
    }

    /// Forward pass over a packed batch.
    ///
    /// Returns logits for the sampling positions only,
    /// `[num_seqs, vocab_size]`.
    pub fn forward(
        &self,
        token_ids: &Tensor,
        positions: &Tensor,
        kv_caches: &mut [KvCache],
        input_params: &InputParameters,
    ) -> Result<Tensor> {
        let mut h = self.embed_tokens.forward(token_ids)?;
        if let Some(wpe) = &self.pos_embed {
            h = h.add(&wpe.forward(positions)?)?;
        }
        if let Some(norm) = &self.embed_norm {
            h = norm.forward(&h)?;
        }
        for (layer, kv_cache) in self.layers.iter().zip(kv_caches.iter_mut()) {
            h = layer.forward(&h, positions, kv_cache, input_params)?;
        }
        let h = self.final_norm.forward(&h)?;
        let sampled = h.index_select(&input_params.last_token_indicies, 0)?;
        self.lm_head.forward(&sampled)
    }

    /// Stream one checkpoint shard into the stack. May be called repeatedly.
    pub fn load_state_dict(&mut self, sd: &StateDict) -> Result<()> {
        self.embed_tokens.load_state_dict(&sd.select(self.spec.embed))?;
        if let (Some(wpe), Some(name)) = (&mut self.pos_embed, self.spec.pos_embed) {
            wpe.load_state_dict(&sd.select(name))?;
        }
        if let (Some(norm), Some(name)) = (&mut self.embed_norm, self.spec.embed_norm) {
            norm.load_state_dict(&sd.select(name))?;
        }
        for (i, layer) in self.layers.iter_mut().enumerate() {
            let prefix = format!("{}{i}.", self.spec.layer_prefix);
            layer.load_state_dict(&sd.select(&prefix), &self.parallel)?;
        }
        self.final_norm
            .load_state_dict(&sd.select(self.spec.final_norm))?;
        match self.spec.lm_head {
            Some(name) => self.lm_head.load_state_dict(&sd.select(name))?,
            None => {
                if let Some(w) = self.embed_tokens.weight() {
                    self.lm_head.tie_weight(w.clone());
                }
            }
        }
        Ok(())
    }

    /// Check that every registered parameter has been written.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingWeights`] naming the unwritten parameters.
    pub fn verify_loaded_weights(&self) -> Result<()> {
        let mut out = Vec::new();
        self.embed_tokens.verify_loaded(self.spec.embed, &mut out);
        if let (Some(wpe), Some(name)) = (&self.pos_embed, self.spec.pos_embed) {
            wpe.verify_loaded(name, &mut out);
        }
        if let (Some(norm), Some(name)) = (&self.embed_norm, self.spec.embed_norm) {
            norm.verify_loaded(name, &mut out);
        }
        for (i, layer) in self.layers.iter().enumerate() {
            layer.verify_loaded(&format!("{}{i}.", self.spec.layer_prefix), &mut out);
        }
        self.final_norm.verify_loaded(self.spec.final_norm, &mut out);
        if let Some(name) = self.spec.lm_head {
            self.lm_head.verify_loaded(name, &mut out);
        }
        if out.is_empty() {
            Ok(())
        } else {
            Err(Error::MissingWeights(out))
        }
    }
}
