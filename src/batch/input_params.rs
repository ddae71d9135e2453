//! Per-step parameter bundles exchanged between the packer and workers.
//!
//! [`InputParameters`] carries everything a paged-attention forward pass
//! needs to tell prefill tokens from decode tokens inside one flat batch:
//! `cu_seq_lens`/`max_seq_len` drive the prefill path, while
//! `block_tables`/`context_lens`/`max_context_len` drive the decode path.
//! All tensors live on the packing device until a worker moves them to its
//! own with [`InputParameters::to_device`].

use candle_core::{Device, Tensor};

use crate::error::Result;

/// Packed tensor inputs for one forward pass.
#[derive(Debug, Clone)]
pub struct InputParameters {
    /// Total number of tokens contributed by prefill sequences.
    pub num_prompt_tokens: usize,

    /// Exclusive prefix sum of prefill prompt lengths, `[num_prefill + 1]`.
    /// For prompt lengths `[2, 3, 4]` this is `[0, 2, 5, 9]`.
    pub cu_seq_lens: Tensor,

    /// Largest prefill prompt length in the batch (0 if none).
    pub max_seq_len: usize,

    /// Cache slot for each token in the packed input, `[num_tokens]`.
    /// Addresses where that token's computed K/V is written.
    pub slot_ids: Tensor,

    /// Block ids per decode sequence, right-padded to
    /// `[num_decode, max_blocks]`. Padding entries are never dereferenced
    /// because reads are bounded by `context_lens`.
    pub block_tables: Tensor,

    /// Total KV length (including the new input token) per decode sequence,
    /// `[num_decode]`.
    pub context_lens: Tensor,

    /// Largest decode context length in the batch (0 if none).
    pub max_context_len: usize,

    /// Index into the packed token vector of the token whose logits feed
    /// sampling, one per sequence in packed order, `[num_seqs]`.
    pub last_token_indicies: Tensor,

    /// Full token history per sequence, right-padded to
    /// `[num_seqs, max_tokens_len]`. Consumed by frequency-based penalties.
    pub token_ids: Tensor,

    /// Total tokens per sequence in packed order, `[num_seqs]`.
    pub seq_lens: Tensor,
}

impl InputParameters {
    /// Copy every tensor to `device`, leaving scalar fields untouched.
    ///
    /// # Errors
    ///
    /// Fails if a tensor transfer fails.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            num_prompt_tokens: self.num_prompt_tokens,
            max_seq_len: self.max_seq_len,
            max_context_len: self.max_context_len,
            cu_seq_lens: self.cu_seq_lens.to_device(device)?,
            slot_ids: self.slot_ids.to_device(device)?,
            block_tables: self.block_tables.to_device(device)?,
            context_lens: self.context_lens.to_device(device)?,
            last_token_indicies: self.last_token_indicies.to_device(device)?,
            token_ids: self.token_ids.to_device(device)?,
            seq_lens: self.seq_lens.to_device(device)?,
        })
    }
}

/// Per-sequence sampling options in packed batch order, plus the step seed.
///
/// The seed is drawn once per step by the engine and broadcast to every
/// worker, so stochastic sampling produces identical tokens on all ranks.
#[derive(Debug, Clone, Default)]
pub struct SamplingParameters {
    pub temperatures: Vec<f32>,
    pub top_ks: Vec<usize>,
    pub top_ps: Vec<f32>,
    pub repetition_penalties: Vec<f32>,
    pub frequency_penalties: Vec<f32>,
    pub presence_penalties: Vec<f32>,
    /// Shared RNG seed for this step.
    pub seed: u64,
}

/// Per-step output: one sampled token per sequence.
#[derive(Debug, Clone)]
pub struct OutputParameters {
    /// Sampled token ids, initially in packed batch order.
    pub next_tokens: Vec<u32>,
}

impl OutputParameters {
    /// Restore caller order using the packer's permutation.
    ///
    /// `seq_indices[i]` is the packed position of the caller's `i`-th
    /// sequence; after this call `next_tokens[i]` corresponds to it.
    pub fn index_select(&mut self, seq_indices: &[usize]) {
        let reordered = seq_indices
            .iter()
            .map(|&packed| self.next_tokens[packed])
            .collect();
        self.next_tokens = reordered;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_reorder() {
        let mut out = OutputParameters {
            next_tokens: vec![10, 20, 30],
        };
        // Caller order [a, b, c] packed as [b, c, a].
        out.index_select(&[2, 0, 1]);
        assert_eq!(out.next_tokens, vec![30, 10, 20]);
    }
}
