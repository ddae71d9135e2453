//! Per-request sequence state.
//!
//! A sequence tracks the tokens of one inference request, the cache blocks it
//! owns, and where it is in the prefill/decode lifecycle.

use crate::core::block::BlockTable;
use crate::error::{Error, Result};

/// Unique identifier for a sequence.
pub type SequenceId = u64;

/// Lifecycle phase of a sequence. Transitions are monotonic:
/// `Prefill -> Decode -> Finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequencePhase {
    /// Prompt KV entries have not been written yet.
    Prefill,
    /// One new input token per step beyond the cached prefix.
    Decode,
    /// Generation complete; blocks may be reclaimed.
    Finished,
}

impl SequencePhase {
    /// Get the phase name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prefill => "Prefill",
            Self::Decode => "Decode",
            Self::Finished => "Finished",
        }
    }
}

/// Reason a sequence finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// A stop token (EOS or user-supplied) was sampled.
    Stop,
    /// The max-new-tokens budget was exhausted.
    MaxTokens,
    /// Cancelled externally; takes effect at the next step boundary.
    Cancelled,
    /// Preempted under memory pressure; re-enters the wait queue.
    Preempted,
}

/// Per-request sampling options.
#[derive(Debug, Clone)]
pub struct SamplingParams {
    /// Temperature for sampling (0 selects greedy decoding).
    pub temperature: f32,
    /// Top-k sampling (0 = disabled).
    pub top_k: usize,
    /// Top-p (nucleus) sampling (1.0 = disabled).
    pub top_p: f32,
    /// Multiplicative penalty on already-seen tokens (1.0 = disabled).
    pub repetition_penalty: f32,
    /// Penalty proportional to a token's occurrence count (0.0 = disabled).
    pub frequency_penalty: f32,
    /// Flat penalty on any already-seen token (0.0 = disabled).
    pub presence_penalty: f32,
    /// Maximum tokens to generate.
    pub max_new_tokens: usize,
    /// Token ids that end generation when sampled, in addition to EOS.
    pub stop_token_ids: Vec<u32>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            repetition_penalty: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            max_new_tokens: 256,
            stop_token_ids: Vec::new(),
        }
    }
}

/// A single inference request.
///
/// Tracks prompt and generated tokens, the owned cache blocks, and the
/// prefill/decode lifecycle. The invariant
/// `block_table.num_slots() >= total_tokens()` holds whenever the sequence is
/// scheduled into a step; the block manager enforces it before packing.
///
/// # Example
///
/// ```
/// use pagedserve::core::sequence::{SamplingParams, Sequence, SequencePhase};
///
/// let mut seq = Sequence::new(1, vec![1, 2, 3, 4], SamplingParams::default());
/// assert_eq!(seq.phase(), SequencePhase::Prefill);
///
/// seq.append_token(5).unwrap();
/// assert_eq!(seq.phase(), SequencePhase::Decode);
/// assert_eq!(seq.total_tokens(), 5);
/// ```
#[derive(Debug, Clone)]
pub struct Sequence {
    seq_id: SequenceId,
    /// Prompt token ids, immutable once admitted.
    prompt_token_ids: Vec<u32>,
    /// Sampled token ids, one per decode step.
    output_token_ids: Vec<u32>,
    /// Cache blocks owned by this sequence.
    block_table: BlockTable,
    phase: SequencePhase,
    sampling_params: SamplingParams,
    finish_reason: Option<FinishReason>,
}

impl Sequence {
    /// Admit a new sequence in phase `Prefill` with an empty block table.
    pub fn new(seq_id: SequenceId, prompt_token_ids: Vec<u32>, params: SamplingParams) -> Self {
        Self {
            seq_id,
            prompt_token_ids,
            output_token_ids: Vec::new(),
            block_table: BlockTable::default(),
            phase: SequencePhase::Prefill,
            sampling_params: params,
            finish_reason: None,
        }
    }

    /// Get the sequence id.
    pub fn seq_id(&self) -> SequenceId {
        self.seq_id
    }

    /// Get the prompt token ids.
    pub fn prompt_token_ids(&self) -> &[u32] {
        &self.prompt_token_ids
    }

    /// Get the generated token ids.
    pub fn output_token_ids(&self) -> &[u32] {
        &self.output_token_ids
    }

    /// Get all token ids (prompt + generated).
    pub fn all_token_ids(&self) -> Vec<u32> {
        let mut tokens = self.prompt_token_ids.clone();
        tokens.extend(&self.output_token_ids);
        tokens
    }

    /// Get the block table.
    pub fn block_table(&self) -> &BlockTable {
        &self.block_table
    }

    /// Get mutable access to the block table.
    pub fn block_table_mut(&mut self) -> &mut BlockTable {
        &mut self.block_table
    }

    /// Get the current phase.
    pub fn phase(&self) -> SequencePhase {
        self.phase
    }

    /// Get the sampling parameters.
    pub fn sampling_params(&self) -> &SamplingParams {
        &self.sampling_params
    }

    /// Get the finish reason, if finished.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    /// Prompt length.
    pub fn prompt_len(&self) -> usize {
        self.prompt_token_ids.len()
    }

    /// Number of generated tokens.
    pub fn output_len(&self) -> usize {
        self.output_token_ids.len()
    }

    /// Total tokens (prompt + generated): the KV-cache extent.
    pub fn total_tokens(&self) -> usize {
        self.prompt_len() + self.output_len()
    }

    /// Last token id: the newest generated token, or the final prompt token
    /// before the first decode step.
    pub fn last_token_id(&self) -> u32 {
        self.output_token_ids
            .last()
            .or_else(|| self.prompt_token_ids.last())
            .copied()
            .unwrap_or_default()
    }

    /// Check whether the sequence is finished.
    pub fn is_finished(&self) -> bool {
        self.phase == SequencePhase::Finished
    }

    /// Append one sampled token, transitioning `Prefill -> Decode` on the
    /// first call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPhase`] when the sequence is already finished.
    pub fn append_token(&mut self, token_id: u32) -> Result<()> {
        if self.phase == SequencePhase::Finished {
            return Err(Error::InvalidPhase {
                from: "Finished",
                to: "Decode",
            });
        }
        self.output_token_ids.push(token_id);
        self.phase = SequencePhase::Decode;
        Ok(())
    }

    /// Mark the sequence finished.
    pub fn finish(&mut self, reason: FinishReason) {
        self.phase = SequencePhase::Finished;
        self.finish_reason = Some(reason);
    }

    /// Check `token_id` and the generation budget against the finish rules.
    ///
    /// Returns the finish reason that applies, if any: the token is the
    /// model's EOS or one of the request's stop tokens, or the max-new-tokens
    /// budget is spent.
    pub fn finish_reason_for(&self, token_id: u32, eos_token_id: u32) -> Option<FinishReason> {
        if token_id == eos_token_id || self.sampling_params.stop_token_ids.contains(&token_id) {
            return Some(FinishReason::Stop);
        }
        if self.output_len() >= self.sampling_params.max_new_tokens {
            return Some(FinishReason::MaxTokens);
        }
        None
    }

    /// Reset a preempted sequence for a fresh prefill.
    ///
    /// Generated tokens fold into the prompt so the re-run recomputes the
    /// whole KV history. The block table must already have been released.
    pub fn restart(&mut self) {
        debug_assert!(self.block_table.is_empty());
        self.prompt_token_ids.extend(self.output_token_ids.drain(..));
        self.phase = SequencePhase::Prefill;
        self.finish_reason = None;
    }
}

impl PartialEq for Sequence {
    fn eq(&self, other: &Self) -> bool {
        self.seq_id == other.seq_id
    }
}

impl Eq for Sequence {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions() {
        let mut seq = Sequence::new(1, vec![1, 2, 3], SamplingParams::default());
        assert_eq!(seq.phase(), SequencePhase::Prefill);
        assert_eq!(seq.last_token_id(), 3);

        seq.append_token(10).unwrap();
        assert_eq!(seq.phase(), SequencePhase::Decode);
        assert_eq!(seq.output_len(), 1);
        assert_eq!(seq.last_token_id(), 10);

        seq.finish(FinishReason::Stop);
        assert!(seq.is_finished());
        assert!(seq.append_token(11).is_err());
    }

    #[test]
    fn test_finish_rules() {
        let params = SamplingParams {
            max_new_tokens: 2,
            stop_token_ids: vec![99],
            ..Default::default()
        };
        let mut seq = Sequence::new(1, vec![1, 2], params);

        seq.append_token(5).unwrap();
        assert_eq!(seq.finish_reason_for(5, 0), None);
        assert_eq!(seq.finish_reason_for(0, 0), Some(FinishReason::Stop));
        assert_eq!(seq.finish_reason_for(99, 0), Some(FinishReason::Stop));

        seq.append_token(6).unwrap();
        assert_eq!(seq.finish_reason_for(6, 0), Some(FinishReason::MaxTokens));
    }

    #[test]
    fn test_restart_folds_outputs() {
        let mut seq = Sequence::new(1, vec![1, 2], SamplingParams::default());
        seq.append_token(3).unwrap();
        seq.append_token(4).unwrap();

        seq.restart();
        assert_eq!(seq.phase(), SequencePhase::Prefill);
        assert_eq!(seq.prompt_token_ids(), &[1, 2, 3, 4]);
        assert_eq!(seq.output_len(), 0);
    }
}
