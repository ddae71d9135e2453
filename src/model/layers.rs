//! Building-block layers for the model families.
//!
//! Linear layers come in tensor-parallel flavors: a column-parallel layer
//! holds a slice of the output dimension and produces partitioned
//! activations, a row-parallel layer holds a slice of the input dimension
//! and all-reduces its partial output through the process group. Chaining
//! column-parallel QKV/up projections into row-parallel output/down
//! projections keeps the hidden states replicated on every rank with one
//! reduction per layer pair.
//!
//! Every layer is constructed empty and filled by [`StateDict`] shards; a
//! parameter may arrive in any shard, and `verify_loaded` reports the names
//! still missing after streaming finishes.

use candle_core::{Tensor, D};

use crate::error::{Error, Result};
use crate::model::state_dict::StateDict;
use crate::parallel::{shard, ParallelArgs};

/// Weight transform applied at load time, before sharding.
pub type WeightTransform<'a> = &'a dyn Fn(&Tensor) -> Result<Tensor>;

fn missing(tensor: &Option<Tensor>, prefix: &str, name: &str, out: &mut Vec<String>) {
    if tensor.is_none() {
        out.push(format!("{prefix}{name}"));
    }
}

fn loaded<'a>(tensor: &'a Option<Tensor>, what: &str) -> Result<&'a Tensor> {
    tensor
        .as_ref()
        .ok_or_else(|| Error::Worker(format!("forward before weights loaded: {what}")))
}

/// Linear layer replicated on every rank. Weight shape `[out, in]`.
#[derive(Debug, Clone)]
pub struct Linear {
    weight: Option<Tensor>,
    bias: Option<Tensor>,
    has_bias: bool,
}

impl Linear {
    pub fn new(has_bias: bool) -> Self {
        Self {
            weight: None,
            bias: None,
            has_bias,
        }
    }

    /// `x [T, in] -> [T, out]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let weight = loaded(&self.weight, "linear weight")?;
        let mut y = x.matmul(&weight.t()?)?;
        if let Some(bias) = &self.bias {
            y = y.broadcast_add(bias)?;
        }
        Ok(y)
    }

    pub fn load_state_dict(&mut self, sd: &StateDict) -> Result<()> {
        self.load_state_dict_with(sd, &|w| Ok(w.clone()))
    }

    pub fn load_state_dict_with(&mut self, sd: &StateDict, transform: WeightTransform) -> Result<()> {
        if let Some(w) = sd.get("weight") {
            self.weight = Some(transform(w)?.contiguous()?);
        }
        if self.has_bias {
            if let Some(b) = sd.get("bias") {
                self.bias = Some(b.clone());
            }
        }
        Ok(())
    }

    /// Hand the layer an already-prepared weight (tied embeddings).
    pub fn tie_weight(&mut self, weight: Tensor) {
        self.weight = Some(weight);
    }

    pub fn verify_loaded(&self, prefix: &str, out: &mut Vec<String>) {
        missing(&self.weight, prefix, "weight", out);
        if self.has_bias {
            missing(&self.bias, prefix, "bias", out);
        }
    }
}

/// Linear layer split along the output dimension.
///
/// Holds `[out / world, in]`; the output stays partitioned for the next
/// (row-parallel) layer.
#[derive(Debug, Clone)]
pub struct ColumnParallelLinear {
    weight: Option<Tensor>,
    bias: Option<Tensor>,
    has_bias: bool,
    parallel: ParallelArgs,
}

impl ColumnParallelLinear {
    pub fn new(has_bias: bool, parallel: ParallelArgs) -> Self {
        Self {
            weight: None,
            bias: None,
            has_bias,
            parallel,
        }
    }

    /// `x [T, in] -> [T, out_local]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let weight = loaded(&self.weight, "column-parallel weight")?;
        let mut y = x.matmul(&weight.t()?)?;
        if let Some(bias) = &self.bias {
            y = y.broadcast_add(bias)?;
        }
        Ok(y)
    }

    pub fn load_state_dict(&mut self, sd: &StateDict) -> Result<()> {
        self.load_state_dict_with(sd, &|w| Ok(w.clone()))
    }

    pub fn load_state_dict_with(&mut self, sd: &StateDict, transform: WeightTransform) -> Result<()> {
        let (rank, world) = (self.parallel.rank(), self.parallel.world_size());
        if let Some(w) = sd.get("weight") {
            let w = transform(w)?;
            self.weight = Some(shard(&w, 0, rank, world)?.contiguous()?);
        }
        if self.has_bias {
            if let Some(b) = sd.get("bias") {
                self.bias = Some(shard(b, 0, rank, world)?.contiguous()?);
            }
        }
        Ok(())
    }

    pub fn verify_loaded(&self, prefix: &str, out: &mut Vec<String>) {
        missing(&self.weight, prefix, "weight", out);
        if self.has_bias {
            missing(&self.bias, prefix, "bias", out);
        }
    }
}

/// Linear layer split along the input dimension.
///
/// Holds `[out, in / world]`, consumes partitioned activations, and
/// all-reduces the partial product so every rank ends with the full output.
/// The bias is replicated and added after the reduction.
#[derive(Debug, Clone)]
pub struct RowParallelLinear {
    weight: Option<Tensor>,
    bias: Option<Tensor>,
    has_bias: bool,
    parallel: ParallelArgs,
}

impl RowParallelLinear {
    pub fn new(has_bias: bool, parallel: ParallelArgs) -> Self {
        Self {
            weight: None,
            bias: None,
            has_bias,
            parallel,
        }
    }

    /// `x [T, in_local] -> [T, out]`, reduced across ranks.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let weight = loaded(&self.weight, "row-parallel weight")?;
        let partial = x.matmul(&weight.t()?)?;
        let mut y = self.parallel.all_reduce_sum(&partial)?;
        if let Some(bias) = &self.bias {
            y = y.broadcast_add(bias)?;
        }
        Ok(y)
    }

    pub fn load_state_dict(&mut self, sd: &StateDict) -> Result<()> {
        self.load_state_dict_with(sd, &|w| Ok(w.clone()))
    }

    pub fn load_state_dict_with(&mut self, sd: &StateDict, transform: WeightTransform) -> Result<()> {
        let (rank, world) = (self.parallel.rank(), self.parallel.world_size());
        if let Some(w) = sd.get("weight") {
            let w = transform(w)?;
            self.weight = Some(shard(&w, 1, rank, world)?.contiguous()?);
        }
        if self.has_bias {
            if let Some(b) = sd.get("bias") {
                self.bias = Some(b.clone());
            }
        }
        Ok(())
    }

    pub fn verify_loaded(&self, prefix: &str, out: &mut Vec<String>) {
        missing(&self.weight, prefix, "weight", out);
        if self.has_bias {
            missing(&self.bias, prefix, "bias", out);
        }
    }
}

/// Token embedding, replicated on every rank. Weight shape `[vocab, hidden]`.
#[derive(Debug, Clone)]
pub struct Embedding {
    weight: Option<Tensor>,
}

impl Embedding {
    pub fn new() -> Self {
        Self { weight: None }
    }

    /// `ids [T] (u32) -> [T, hidden]`.
    pub fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        let weight = loaded(&self.weight, "embedding weight")?;
        Ok(weight.index_select(ids, 0)?)
    }

    pub fn load_state_dict(&mut self, sd: &StateDict) -> Result<()> {
        if let Some(w) = sd.get("weight") {
            self.weight = Some(w.contiguous()?);
        }
        Ok(())
    }

    /// The embedding matrix, for weight tying.
    pub fn weight(&self) -> Option<&Tensor> {
        self.weight.as_ref()
    }

    pub fn verify_loaded(&self, prefix: &str, out: &mut Vec<String>) {
        missing(&self.weight, prefix, "weight", out);
    }
}

impl Default for Embedding {
    fn default() -> Self {
        Self::new()
    }
}

/// RMS normalization: `x / rms(x) * weight`.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    weight: Option<Tensor>,
    eps: f64,
}

impl RmsNorm {
    pub fn new(eps: f64) -> Self {
        Self { weight: None, eps }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let weight = loaded(&self.weight, "rms norm weight")?;
        let variance = x.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = x.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        Ok(normed.broadcast_mul(weight)?)
    }

    pub fn load_state_dict(&mut self, sd: &StateDict) -> Result<()> {
        if let Some(w) = sd.get("weight") {
            self.weight = Some(w.clone());
        }
        Ok(())
    }

    pub fn verify_loaded(&self, prefix: &str, out: &mut Vec<String>) {
        missing(&self.weight, prefix, "weight", out);
    }
}

/// Layer normalization with optional bias.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Option<Tensor>,
    bias: Option<Tensor>,
    has_bias: bool,
    eps: f64,
}

impl LayerNorm {
    pub fn new(has_bias: bool, eps: f64) -> Self {
        Self {
            weight: None,
            bias: None,
            has_bias,
            eps,
        }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let weight = loaded(&self.weight, "layer norm weight")?;
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        let mut y = normed.broadcast_mul(weight)?;
        if let Some(bias) = &self.bias {
            y = y.broadcast_add(bias)?;
        }
        Ok(y)
    }

    pub fn load_state_dict(&mut self, sd: &StateDict) -> Result<()> {
        if let Some(w) = sd.get("weight") {
            self.weight = Some(w.clone());
        }
        if self.has_bias {
            if let Some(b) = sd.get("bias") {
                self.bias = Some(b.clone());
            }
        }
        Ok(())
    }

    pub fn verify_loaded(&self, prefix: &str, out: &mut Vec<String>) {
        missing(&self.weight, prefix, "weight", out);
        if self.has_bias {
            missing(&self.bias, prefix, "bias", out);
        }
    }
}

/// Norm flavor used by a model family.
#[derive(Debug, Clone)]
pub enum Norm {
    Rms(RmsNorm),
    Layer(LayerNorm),
}

impl Norm {
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Rms(n) => n.forward(x),
            Self::Layer(n) => n.forward(x),
        }
    }

    pub fn load_state_dict(&mut self, sd: &StateDict) -> Result<()> {
        match self {
            Self::Rms(n) => n.load_state_dict(sd),
            Self::Layer(n) => n.load_state_dict(sd),
        }
    }

    pub fn verify_loaded(&self, prefix: &str, out: &mut Vec<String>) {
        match self {
            Self::Rms(n) => n.verify_loaded(prefix, out),
            Self::Layer(n) => n.verify_loaded(prefix, out),
        }
    }
}

/// SwiGLU feed-forward: `down(silu(gate(x)) * up(x))`.
///
/// Gate and up are column-parallel, down is row-parallel, so the gating
/// happens entirely within each rank's shard of the intermediate dimension.
#[derive(Debug, Clone)]
pub struct SwiGluMlp {
    gate_proj: ColumnParallelLinear,
    up_proj: ColumnParallelLinear,
    down_proj: RowParallelLinear,
}

impl SwiGluMlp {
    pub fn new(has_bias: bool, parallel: ParallelArgs) -> Self {
        Self {
            gate_proj: ColumnParallelLinear::new(has_bias, parallel.clone()),
            up_proj: ColumnParallelLinear::new(has_bias, parallel.clone()),
            down_proj: RowParallelLinear::new(has_bias, parallel),
        }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        self.down_proj.forward(&gate.mul(&up)?)
    }

    pub fn load_state_dict(&mut self, sd: &StateDict, names: &MlpNames) -> Result<()> {
        self.gate_proj.load_state_dict(&sd.select(names.gate))?;
        self.up_proj.load_state_dict(&sd.select(names.up))?;
        self.down_proj.load_state_dict(&sd.select(names.down))?;
        Ok(())
    }

    pub fn verify_loaded(&self, prefix: &str, names: &MlpNames, out: &mut Vec<String>) {
        self.gate_proj
            .verify_loaded(&format!("{prefix}{}", names.gate), out);
        self.up_proj
            .verify_loaded(&format!("{prefix}{}", names.up), out);
        self.down_proj
            .verify_loaded(&format!("{prefix}{}", names.down), out);
    }
}

/// Two-projection feed-forward with GELU: `fc_out(gelu(fc_in(x)))`.
#[derive(Debug, Clone)]
pub struct GeluMlp {
    fc_in: ColumnParallelLinear,
    fc_out: RowParallelLinear,
    transpose_weights: bool,
}

impl GeluMlp {
    pub fn new(has_bias: bool, transpose_weights: bool, parallel: ParallelArgs) -> Self {
        Self {
            fc_in: ColumnParallelLinear::new(has_bias, parallel.clone()),
            fc_out: RowParallelLinear::new(has_bias, parallel),
            transpose_weights,
        }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = self.fc_in.forward(x)?.gelu()?;
        self.fc_out.forward(&hidden)
    }

    pub fn load_state_dict(&mut self, sd: &StateDict, names: &MlpNames) -> Result<()> {
        let transform: Box<dyn Fn(&Tensor) -> Result<Tensor>> = if self.transpose_weights {
            Box::new(|w: &Tensor| Ok(w.t()?.contiguous()?))
        } else {
            Box::new(|w: &Tensor| Ok(w.clone()))
        };
        self.fc_in
            .load_state_dict_with(&sd.select(names.up), &transform)?;
        self.fc_out
            .load_state_dict_with(&sd.select(names.down), &transform)?;
        Ok(())
    }

    pub fn verify_loaded(&self, prefix: &str, names: &MlpNames, out: &mut Vec<String>) {
        self.fc_in
            .verify_loaded(&format!("{prefix}{}", names.up), out);
        self.fc_out
            .verify_loaded(&format!("{prefix}{}", names.down), out);
    }
}

/// Parameter-name suffixes for a family's feed-forward projections.
/// `gate` is unused by [`GeluMlp`].
#[derive(Debug, Clone, Copy)]
pub struct MlpNames {
    pub gate: &'static str,
    pub up: &'static str,
    pub down: &'static str,
}

/// Feed-forward flavor used by a model family.
#[derive(Debug, Clone)]
pub enum Mlp {
    SwiGlu(SwiGluMlp),
    Gelu(GeluMlp),
}

impl Mlp {
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::SwiGlu(mlp) => mlp.forward(x),
            Self::Gelu(mlp) => mlp.forward(x),
        }
    }

    pub fn load_state_dict(&mut self, sd: &StateDict, names: &MlpNames) -> Result<()> {
        match self {
            Self::SwiGlu(mlp) => mlp.load_state_dict(sd, names),
            Self::Gelu(mlp) => mlp.load_state_dict(sd, names),
        }
    }

    pub fn verify_loaded(&self, prefix: &str, names: &MlpNames, out: &mut Vec<String>) {
        match self {
            Self::SwiGlu(mlp) => mlp.verify_loaded(prefix, names, out),
            Self::Gelu(mlp) => mlp.verify_loaded(prefix, names, out),
        }
    }
}

/// Expand grouped KV heads to match the query head count.
///
/// `x [t, n_kv_heads, head_dim] -> [t, n_heads, head_dim]`.
pub fn repeat_kv(x: &Tensor, n_heads: usize, n_kv_heads: usize) -> Result<Tensor> {
    if n_heads == n_kv_heads {
        return Ok(x.clone());
    }
    let groups = n_heads / n_kv_heads;
    let (t, kv_heads, head_dim) = x.dims3()?;
    let expanded = x
        .unsqueeze(2)?
        .expand((t, kv_heads, groups, head_dim))?
        .contiguous()?
        .reshape((t, kv_heads * groups, head_dim))?;
    Ok(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use std::collections::HashMap;

    fn sd_with(name: &str, t: Tensor) -> StateDict {
        let mut map = HashMap::new();
        map.insert(name.to_string(), t);
        StateDict::from_tensors(map)
    }

    #[test]
    fn test_linear_requires_weights() {
        let device = Device::Cpu;
        let layer = Linear::new(false);
        let x = Tensor::zeros((1, 4), DType::F32, &device).unwrap();
        assert!(layer.forward(&x).is_err());

        let mut out = Vec::new();
        layer.verify_loaded("lm_head.", &mut out);
        assert_eq!(out, vec!["lm_head.weight"]);
    }

    #[test]
    fn test_column_parallel_shards_output_dim() {
        let device = Device::Cpu;
        let parallel = ParallelArgs::new(1, 2, Some(crate::parallel::LocalProcessGroup::create(2).remove(1)))
            .unwrap();
        let mut layer = ColumnParallelLinear::new(false, parallel);
        let w = Tensor::arange(0f32, 8f32, &device)
            .unwrap()
            .reshape((4, 2))
            .unwrap();
        layer.load_state_dict(&sd_with("weight", w)).unwrap();

        let x = Tensor::ones((1, 2), DType::F32, &device).unwrap();
        let y = layer.forward(&x).unwrap();
        // Rank 1 holds rows 2..4: [4+5, 6+7].
        let v: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(v, vec![9.0, 13.0]);
    }

    #[test]
    fn test_rms_norm_unit_scale() {
        let device = Device::Cpu;
        let mut norm = RmsNorm::new(1e-6);
        norm.load_state_dict(&sd_with("weight", Tensor::ones(4, DType::F32, &device).unwrap()))
            .unwrap();
        let x = Tensor::new(&[[2.0f32, 2.0, 2.0, 2.0]], &device).unwrap();
        let y = norm.forward(&x).unwrap();
        let v: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        for val in v {
            assert!((val - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_repeat_kv_expands_groups() {
        let device = Device::Cpu;
        let x = Tensor::arange(0f32, 8f32, &device)
            .unwrap()
            .reshape((2, 2, 2))
            .unwrap();
        let y = repeat_kv(&x, 4, 2).unwrap();
        assert_eq!(y.dims(), &[2, 4, 2]);
        let v: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        // Each kv head duplicated for its group.
        assert_eq!(v[0..4], [0.0, 1.0, 0.0, 1.0]);
    }
}
