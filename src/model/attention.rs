//! Paged attention over packed prefill/decode batches, plus the position
//! encodings and fused-QKV weight handling the model families share.
//!
//! One call handles the whole packed batch: the prefill segment runs causal
//! attention per sequence over the flat token vector (sliced via
//! `cu_seq_lens`), the decode segment gathers each sequence's cached context
//! through its block table. Both segments write their new K/V entries into
//! the cache slots named by `slot_ids` first, so a step leaves the cache
//! consistent regardless of segment mix.

use candle_core::{DType, Device, Tensor};

use crate::batch::input_params::InputParameters;
use crate::core::kv_cache::KvCache;
use crate::error::{Error, Result};
use crate::model::layers::repeat_kv;
use crate::model::state_dict::StateDict;
use crate::parallel::{shard, ParallelArgs};

/// How a checkpoint lays out its fused QKV projection.
///
/// The canonical in-memory layout is QKV-major (`[3, n_heads, head_dim, ..]`
/// flattened), which lets the forward pass split the projection with one
/// three-way chunk and lets the loader shard each of Q/K/V across ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QkvLayout {
    /// `[3, n_heads, head_dim, ..]` - already canonical (MPT).
    QkvMajor,
    /// `[n_heads, 3, head_dim, ..]` - per-head interleaved (GPT-NeoX, Bloom).
    HeadsMajor,
}

impl QkvLayout {
    /// Reorder a fused QKV parameter into the canonical QKV-major layout.
    ///
    /// Accepts 2-D weights `[3 * n_heads * head_dim, in]` and 1-D biases.
    pub fn canonicalize(&self, tensor: &Tensor, head_dim: usize) -> Result<Tensor> {
        match self {
            Self::QkvMajor => Ok(tensor.clone()),
            Self::HeadsMajor => match tensor.dims().len() {
                2 => {
                    let in_dim = tensor.dim(1)?;
                    Ok(tensor
                        .reshape(((), 3, head_dim, in_dim))?
                        .permute((1, 0, 2, 3))?
                        .contiguous()?
                        .reshape(((), in_dim))?)
                }
                1 => Ok(tensor
                    .reshape(((), 3, head_dim))?
                    .permute((1, 0, 2))?
                    .contiguous()?
                    .flatten_all()?),
                d => Err(Error::Config(format!("unexpected qkv tensor rank: {d}"))),
            },
        }
    }
}

/// Fused QKV projection, column-parallel per attention head.
///
/// The full parameter is canonicalized to QKV-major, then each of the three
/// segments is sharded along its head rows, so every rank holds
/// `[3 * n_local_heads * head_dim, in]` and the forward output chunks into
/// per-rank Q, K, V.
#[derive(Debug, Clone)]
pub struct FusedQkvParallelLinear {
    weight: Option<Tensor>,
    bias: Option<Tensor>,
    has_bias: bool,
    layout: QkvLayout,
    head_dim: usize,
    parallel: ParallelArgs,
}

impl FusedQkvParallelLinear {
    pub fn new(has_bias: bool, layout: QkvLayout, head_dim: usize, parallel: ParallelArgs) -> Self {
        Self {
            weight: None,
            bias: None,
            has_bias,
            layout,
            head_dim,
            parallel,
        }
    }

    /// `x [T, in] -> (q, k, v)`, each `[T, n_local_heads * head_dim]`.
    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let weight = self
            .weight
            .as_ref()
            .ok_or_else(|| Error::Worker("forward before weights loaded: fused qkv".to_string()))?;
        let mut y = x.matmul(&weight.t()?)?;
        if let Some(bias) = &self.bias {
            y = y.broadcast_add(bias)?;
        }
        let chunks = y.chunk(3, 1)?;
        Ok((chunks[0].clone(), chunks[1].clone(), chunks[2].clone()))
    }

    /// Clamp helper for checkpoints trained with QKV clipping.
    pub fn clamp(y: &Tensor, clip: f32) -> Result<Tensor> {
        Ok(y.clamp(-clip, clip)?)
    }

    fn segment_shard(&self, tensor: &Tensor) -> Result<Tensor> {
        let (rank, world) = (self.parallel.rank(), self.parallel.world_size());
        if world == 1 {
            return Ok(tensor.clone());
        }
        let seg = tensor.dim(0)? / 3;
        let mut parts = Vec::with_capacity(3);
        for s in 0..3 {
            let segment = tensor.narrow(0, s * seg, seg)?;
            parts.push(shard(&segment, 0, rank, world)?);
        }
        Ok(Tensor::cat(&parts, 0)?)
    }

    pub fn load_state_dict(&mut self, sd: &StateDict) -> Result<()> {
        self.load_state_dict_with(sd, &|w| Ok(w.clone()))
    }

    /// Load with an extra pre-transform (e.g. Conv1D transposition) applied
    /// before the layout canonicalization and sharding.
    pub fn load_state_dict_with(
        &mut self,
        sd: &StateDict,
        transform: &dyn Fn(&Tensor) -> Result<Tensor>,
    ) -> Result<()> {
        if let Some(w) = sd.get("weight") {
            let w = self.layout.canonicalize(&transform(w)?, self.head_dim)?;
            self.weight = Some(self.segment_shard(&w)?.contiguous()?);
        }
        if self.has_bias {
            if let Some(b) = sd.get("bias") {
                let b = self.layout.canonicalize(b, self.head_dim)?;
                self.bias = Some(self.segment_shard(&b)?.contiguous()?);
            }
        }
        Ok(())
    }

    pub fn verify_loaded(&self, prefix: &str, out: &mut Vec<String>) {
        if self.weight.is_none() {
            out.push(format!("{prefix}weight"));
        }
        if self.has_bias && self.bias.is_none() {
            out.push(format!("{prefix}bias"));
        }
    }
}

/// Rotary position embedding with precomputed cos/sin caches, applied by
/// absolute token position. Supports partial rotation (`rotary_dim` less
/// than the head dimension) and both the half-split and interleaved pair
/// conventions.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    /// `[max_position, rotary_dim / 2]`.
    cos_cache: Tensor,
    /// `[max_position, rotary_dim / 2]`.
    sin_cache: Tensor,
    rotary_dim: usize,
    interleaved: bool,
}

impl RotaryEmbedding {
    pub fn new(
        rotary_dim: usize,
        max_position: usize,
        theta: f64,
        interleaved: bool,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        if rotary_dim % 2 != 0 {
            return Err(Error::Config(format!(
                "rotary dimension must be even, got {rotary_dim}"
            )));
        }
        let half = rotary_dim / 2;
        let inv_freq: Vec<f32> = (0..half)
            .map(|i| (1.0 / theta.powf(2.0 * i as f64 / rotary_dim as f64)) as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, half, device)?;
        let positions: Vec<f32> = (0..max_position).map(|p| p as f32).collect();
        let positions = Tensor::from_vec(positions, (max_position, 1), device)?;
        let freqs = positions.broadcast_mul(&inv_freq.unsqueeze(0)?)?;
        Ok(Self {
            cos_cache: freqs.cos()?.to_dtype(dtype)?,
            sin_cache: freqs.sin()?.to_dtype(dtype)?,
            rotary_dim,
            interleaved,
        })
    }

    /// Rotate `x [T, heads, head_dim]` by each token's absolute position.
    pub fn apply(&self, x: &Tensor, positions: &Tensor) -> Result<Tensor> {
        let (t, heads, head_dim) = x.dims3()?;
        // [T, rot/2] -> [T, 1, rot/2] broadcasting over heads.
        let cos = self.cos_cache.index_select(positions, 0)?.unsqueeze(1)?;
        let sin = self.sin_cache.index_select(positions, 0)?.unsqueeze(1)?;

        let (rotary, pass) = if self.rotary_dim < head_dim {
            (
                x.narrow(2, 0, self.rotary_dim)?,
                Some(x.narrow(2, self.rotary_dim, head_dim - self.rotary_dim)?),
            )
        } else {
            (x.clone(), None)
        };

        let half = self.rotary_dim / 2;
        let rotated = if self.interleaved {
            // Pairs (0,1), (2,3), ...
            let pairs = rotary.reshape((t, heads, half, 2))?;
            let a = pairs.narrow(3, 0, 1)?.squeeze(3)?;
            let b = pairs.narrow(3, 1, 1)?.squeeze(3)?;
            let ra = (a.broadcast_mul(&cos)? - b.broadcast_mul(&sin)?)?;
            let rb = (a.broadcast_mul(&sin)? + b.broadcast_mul(&cos)?)?;
            Tensor::stack(&[&ra, &rb], 3)?.reshape((t, heads, self.rotary_dim))?
        } else {
            // First half pairs with second half.
            let a = rotary.narrow(2, 0, half)?;
            let b = rotary.narrow(2, half, half)?;
            let ra = (a.broadcast_mul(&cos)? - b.broadcast_mul(&sin)?)?;
            let rb = (a.broadcast_mul(&sin)? + b.broadcast_mul(&cos)?)?;
            Tensor::cat(&[&ra, &rb], 2)?
        };

        match pass {
            Some(pass) => Ok(Tensor::cat(&[&rotated, &pass], 2)?),
            None => Ok(rotated),
        }
    }
}

/// Per-head ALiBi slopes for this rank's heads.
#[derive(Debug, Clone)]
pub struct AlibiSlopes {
    slopes: Vec<f32>,
}

impl AlibiSlopes {
    /// Compute slopes for all `n_heads` and keep this rank's chunk.
    pub fn new(n_heads: usize, bias_max: f32, parallel: &ParallelArgs) -> Self {
        let next_pow2 = n_heads.next_power_of_two();
        let mut slopes: Vec<f32> = (1..=next_pow2)
            .map(|i| {
                let m = i as f32 * bias_max / next_pow2 as f32;
                1.0 / 2f32.powf(m)
            })
            .collect();
        if next_pow2 != n_heads {
            // Interleave the steeper extra slopes, then trim.
            let odd: Vec<f32> = slopes.iter().skip(1).step_by(2).copied().collect();
            let even: Vec<f32> = slopes.iter().step_by(2).copied().collect();
            slopes = odd.into_iter().chain(even).take(n_heads).collect();
        }
        let world = parallel.world_size();
        let local = n_heads / world;
        let start = parallel.rank() * local;
        Self {
            slopes: slopes[start..start + local].to_vec(),
        }
    }

    /// Local head count.
    pub fn len(&self) -> usize {
        self.slopes.len()
    }

    /// Whether this rank holds no heads.
    pub fn is_empty(&self) -> bool {
        self.slopes.is_empty()
    }

    /// Slopes for this rank's heads.
    pub fn slopes(&self) -> &[f32] {
        &self.slopes
    }
}

/// Position handling of an attention variant.
#[derive(Debug, Clone)]
pub enum PosEncoding {
    /// Rotate queries and keys by absolute position.
    Rotary(RotaryEmbedding),
    /// Add distance-proportional biases to the attention scores.
    Alibi(AlibiSlopes),
    /// Positions handled elsewhere (learned position embeddings).
    NoPos,
}

/// Paged attention for one layer of one shard.
#[derive(Debug, Clone)]
pub struct PagedAttention {
    n_local_heads: usize,
    n_local_kv_heads: usize,
    head_dim: usize,
    scale: f64,
    pos: PosEncoding,
}

impl PagedAttention {
    pub fn new(
        n_local_heads: usize,
        n_local_kv_heads: usize,
        head_dim: usize,
        pos: PosEncoding,
    ) -> Self {
        Self {
            n_local_heads,
            n_local_kv_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
            pos,
        }
    }

    /// Run attention over a packed batch.
    ///
    /// `q` is `[T, n_local_heads * head_dim]`; `k`/`v` are
    /// `[T, n_local_kv_heads * head_dim]`. New K/V entries land in the cache
    /// slots from `input_params.slot_ids` before any score is computed.
    /// Returns `[T, n_local_heads * head_dim]`.
    pub fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        positions: &Tensor,
        kv_cache: &mut KvCache,
        input_params: &InputParameters,
    ) -> Result<Tensor> {
        let t = q.dim(0)?;
        let mut q = q.reshape((t, self.n_local_heads, self.head_dim))?;
        let mut k = k.reshape((t, self.n_local_kv_heads, self.head_dim))?;
        let v = v.reshape((t, self.n_local_kv_heads, self.head_dim))?;

        if let PosEncoding::Rotary(rope) = &self.pos {
            q = rope.apply(&q, positions)?;
            k = rope.apply(&k, positions)?;
        }

        // Write every new token's K/V to its assigned slot.
        let slot_ids: Vec<u32> = input_params.slot_ids.to_vec1()?;
        for (i, &slot) in slot_ids.iter().enumerate() {
            let ki = k.narrow(0, i, 1)?.squeeze(0)?;
            let vi = v.narrow(0, i, 1)?.squeeze(0)?;
            kv_cache.write_slot(slot as usize, &ki, &vi)?;
        }

        let mut outputs: Vec<Tensor> = Vec::new();

        // Prefill segment: per-sequence causal attention over the batch
        // tensors themselves (the whole prompt is present).
        let cu_seq_lens: Vec<u32> = input_params.cu_seq_lens.to_vec1()?;
        for w in cu_seq_lens.windows(2) {
            let (start, end) = (w[0] as usize, w[1] as usize);
            let len = end - start;
            let q_s = q.narrow(0, start, len)?;
            let k_s = repeat_kv(
                &k.narrow(0, start, len)?,
                self.n_local_heads,
                self.n_local_kv_heads,
            )?;
            let v_s = repeat_kv(
                &v.narrow(0, start, len)?,
                self.n_local_heads,
                self.n_local_kv_heads,
            )?;
            outputs.push(self.attend(&q_s, &k_s, &v_s, len)?);
        }

        // Decode segment: one query token against the gathered cache.
        let num_decode = t - input_params.num_prompt_tokens;
        if num_decode > 0 {
            let context_lens: Vec<u32> = input_params.context_lens.to_vec1()?;
            let block_tables: Vec<Vec<u32>> = input_params.block_tables.to_vec2()?;
            let block_size = kv_cache.shape().block_size;
            for d in 0..num_decode {
                let idx = input_params.num_prompt_tokens + d;
                let context_len = context_lens[d] as usize;
                let used_blocks = context_len.div_ceil(block_size);
                let blocks: Vec<usize> = block_tables[d][..used_blocks]
                    .iter()
                    .map(|&b| b as usize)
                    .collect();
                let (k_ctx, v_ctx) = kv_cache.gather(&blocks, context_len)?;
                let k_ctx = repeat_kv(&k_ctx, self.n_local_heads, self.n_local_kv_heads)?;
                let v_ctx = repeat_kv(&v_ctx, self.n_local_heads, self.n_local_kv_heads)?;
                let q_d = q.narrow(0, idx, 1)?;
                outputs.push(self.attend(&q_d, &k_ctx, &v_ctx, context_len)?);
            }
        }

        let out = Tensor::cat(&outputs, 0)?;
        Ok(out.reshape((t, self.n_local_heads * self.head_dim))?)
    }

    // Scaled dot-product attention for one sequence. `q [q_len, h, hd]`
    // attends over `k`/`v [ctx_len, h, hd]`; the query tokens occupy the
    // final positions of the context.
    fn attend(&self, q: &Tensor, k: &Tensor, v: &Tensor, context_len: usize) -> Result<Tensor> {
        let q_len = q.dim(0)?;
        let qh = q.transpose(0, 1)?.contiguous()?; // [h, q_len, hd]
        let kh = k.transpose(0, 1)?.contiguous()?; // [h, ctx, hd]
        let vh = v.transpose(0, 1)?.contiguous()?;

        let mut scores = (qh.matmul(&kh.transpose(1, 2)?)? * self.scale)?; // [h, q_len, ctx]
        let bias = self.score_bias(q_len, context_len, scores.dtype(), scores.device())?;
        if let Some(bias) = bias {
            scores = scores.broadcast_add(&bias)?;
        }
        let weights = candle_nn::ops::softmax_last_dim(&scores)?;
        let out = weights.matmul(&vh)?; // [h, q_len, hd]
        Ok(out.transpose(0, 1)?.contiguous()?)
    }

    // Causal mask plus optional ALiBi bias. Query token `i` (absolute
    // position ctx - q_len + i) may attend to context positions <= its own.
    fn score_bias(
        &self,
        q_len: usize,
        context_len: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Option<Tensor>> {
        let offset = context_len - q_len;
        let needs_mask = q_len > 1;
        match &self.pos {
            PosEncoding::Alibi(alibi) => {
                let heads = alibi.len();
                let mut bias = vec![0f32; heads * q_len * context_len];
                for (h, &slope) in alibi.slopes().iter().enumerate() {
                    for i in 0..q_len {
                        let pos = offset + i;
                        for j in 0..context_len {
                            bias[h * q_len * context_len + i * context_len + j] = if j > pos {
                                f32::NEG_INFINITY
                            } else {
                                -slope * (pos - j) as f32
                            };
                        }
                    }
                }
                let bias = Tensor::from_vec(bias, (heads, q_len, context_len), device)?
                    .to_dtype(dtype)?;
                Ok(Some(bias))
            }
            _ if needs_mask => {
                let mut mask = vec![0f32; q_len * context_len];
                for i in 0..q_len {
                    let pos = offset + i;
                    for j in 0..context_len {
                        if j > pos {
                            mask[i * context_len + j] = f32::NEG_INFINITY;
                        }
                    }
                }
                let mask =
                    Tensor::from_vec(mask, (q_len, context_len), device)?.to_dtype(dtype)?;
                Ok(Some(mask))
            }
            _ => Ok(None),
        }
    }
}
