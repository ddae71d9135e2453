//! Batch packing: turns a set of sequences into the flat tensors one
//! forward pass consumes.
//!
//! A paged-attention kernel handles prefill (causal attention over the whole
//! prompt, no prior cache) and decode (single-token attention over a cached
//! context) through different paths, but both can share one launch if
//! prefill tokens precede decode tokens and both address the same block
//! space. The packer therefore places prefill sequences first, decode
//! sequences second, and records a permutation (`seq_indices`) the engine
//! uses to restore caller order on the way out.
//!
//! Before any tensor is emitted the packer asks the block manager to cover
//! each sequence's total token count. A sequence that cannot be covered is
//! ejected from this step and reported back so the scheduler can defer it or
//! preempt a victim.

use candle_core::{Device, Tensor};

use crate::batch::input_params::{InputParameters, SamplingParameters};
use crate::core::block_manager::BlockManager;
use crate::core::sequence::{Sequence, SequenceId, SequencePhase};
use crate::error::{Error, Result};

/// Everything one engine step needs: model inputs, attention metadata,
/// sampling options, the reorder permutation, and the ejected sequences.
#[derive(Debug)]
pub struct PackedBatch {
    /// Model input tokens: full prompts for prefill sequences followed by
    /// the single new input token of each decode sequence, `[num_tokens]`.
    pub token_ids: Tensor,
    /// Absolute position of each input token, `[num_tokens]`.
    pub positions: Tensor,
    /// Attention and addressing metadata.
    pub input_params: InputParameters,
    /// Per-sequence sampling options in packed order.
    pub sampling_params: SamplingParameters,
    /// For the caller's `i`-th surviving sequence, its packed position.
    pub seq_indices: Vec<usize>,
    /// Sequences dropped from this step because block allocation failed.
    pub ejected: Vec<SequenceId>,
    /// Number of sequences actually packed.
    pub num_seqs: usize,
}

/// Pack `sequences` into the tensor inputs for one forward pass.
///
/// Sequences keep their relative caller order within the prefill and decode
/// groups. Block allocation happens here: every packed sequence is
/// guaranteed to have its full token extent covered by its block table.
///
/// # Errors
///
/// Propagates tensor construction failures. Allocation shortfalls are not
/// errors; the affected sequences are returned in [`PackedBatch::ejected`].
pub fn prepare_inputs(
    sequences: &mut [Sequence],
    block_manager: &mut BlockManager,
    seed: u64,
    device: &Device,
) -> Result<PackedBatch> {
    let block_size = block_manager.block_size();

    // Classify and allocate. Failed allocations eject the sequence from
    // this step only; its existing blocks stay assigned.
    let mut prefill_idx: Vec<usize> = Vec::new();
    let mut decode_idx: Vec<usize> = Vec::new();
    let mut ejected: Vec<SequenceId> = Vec::new();
    for (i, seq) in sequences.iter_mut().enumerate() {
        debug_assert!(!seq.is_finished(), "finished sequence in step batch");
        let needed = seq.total_tokens();
        match block_manager.allocate_for(seq, needed) {
            Ok(()) => match seq.phase() {
                SequencePhase::Prefill => prefill_idx.push(i),
                SequencePhase::Decode => decode_idx.push(i),
                SequencePhase::Finished => ejected.push(seq.seq_id()),
            },
            Err(Error::OutOfBlocks) => ejected.push(seq.seq_id()),
            Err(e) => return Err(e),
        }
    }

    let num_prefill = prefill_idx.len();
    let num_decode = decode_idx.len();
    let num_seqs = num_prefill + num_decode;

    // Caller rank -> packed position, skipping ejected sequences.
    let mut packed_pos = vec![usize::MAX; sequences.len()];
    for (pos, &i) in prefill_idx.iter().chain(decode_idx.iter()).enumerate() {
        packed_pos[i] = pos;
    }
    let seq_indices: Vec<usize> = (0..sequences.len())
        .filter(|&i| packed_pos[i] != usize::MAX)
        .map(|i| packed_pos[i])
        .collect();

    let mut token_ids: Vec<u32> = Vec::new();
    let mut positions: Vec<u32> = Vec::new();
    let mut slot_ids: Vec<u32> = Vec::new();
    let mut last_token_indicies: Vec<u32> = Vec::with_capacity(num_seqs);

    // Prefill segment: whole prompts, positions from zero.
    let mut cu_seq_lens: Vec<u32> = Vec::with_capacity(num_prefill + 1);
    cu_seq_lens.push(0);
    let mut max_seq_len = 0usize;
    for &i in &prefill_idx {
        let seq = &sequences[i];
        let len = seq.prompt_len();
        token_ids.extend_from_slice(seq.prompt_token_ids());
        positions.extend((0..len).map(|p| p as u32));
        slot_ids.extend(
            seq.block_table()
                .slot_ids(0, len, block_size)
                .into_iter()
                .map(|s| s as u32),
        );
        last_token_indicies.push((token_ids.len() - 1) as u32);
        cu_seq_lens.push(*cu_seq_lens.last().unwrap_or(&0) + len as u32);
        max_seq_len = max_seq_len.max(len);
    }
    let num_prompt_tokens = token_ids.len();

    // Decode segment: one new input token per sequence, the previously
    // sampled one, at absolute position total - 1.
    let mut context_lens: Vec<u32> = Vec::with_capacity(num_decode);
    let mut max_context_len = 0usize;
    let mut max_blocks = 0usize;
    for &i in &decode_idx {
        let seq = &sequences[i];
        let total = seq.total_tokens();
        let pos = total - 1;
        token_ids.push(seq.last_token_id());
        positions.push(pos as u32);
        let slot = seq
            .block_table()
            .slot_id(pos, block_size)
            .ok_or(Error::OutOfBlocks)?;
        slot_ids.push(slot as u32);
        last_token_indicies.push((token_ids.len() - 1) as u32);
        context_lens.push(total as u32);
        max_context_len = max_context_len.max(total);
        max_blocks = max_blocks.max(seq.block_table().num_blocks());
    }

    // Block tables right-padded to a rectangle. Pad value 0 is safe: reads
    // are bounded by context_lens.
    let mut block_tables: Vec<u32> = Vec::with_capacity(num_decode * max_blocks);
    for &i in &decode_idx {
        let ids = sequences[i].block_table().block_ids();
        block_tables.extend(ids.iter().map(|&id| id as u32));
        block_tables.extend(std::iter::repeat(0).take(max_blocks - ids.len()));
    }

    // Per-sequence token history for frequency-based penalties.
    let packed_order: Vec<usize> = prefill_idx.iter().chain(decode_idx.iter()).copied().collect();
    let max_tokens_len = packed_order
        .iter()
        .map(|&i| sequences[i].total_tokens())
        .max()
        .unwrap_or(0);
    let mut history: Vec<u32> = Vec::with_capacity(num_seqs * max_tokens_len);
    let mut seq_lens: Vec<u32> = Vec::with_capacity(num_seqs);
    let mut sampling_params = SamplingParameters {
        seed,
        ..Default::default()
    };
    for &i in &packed_order {
        let seq = &sequences[i];
        let all = seq.all_token_ids();
        seq_lens.push(all.len() as u32);
        history.extend_from_slice(&all);
        history.extend(std::iter::repeat(0).take(max_tokens_len - all.len()));

        let p = seq.sampling_params();
        sampling_params.temperatures.push(p.temperature);
        sampling_params.top_ks.push(p.top_k);
        sampling_params.top_ps.push(p.top_p);
        sampling_params.repetition_penalties.push(p.repetition_penalty);
        sampling_params.frequency_penalties.push(p.frequency_penalty);
        sampling_params.presence_penalties.push(p.presence_penalty);
    }

    let num_tokens = token_ids.len();
    let input_params = InputParameters {
        num_prompt_tokens,
        cu_seq_lens: Tensor::from_vec(cu_seq_lens, num_prefill + 1, device)?,
        max_seq_len,
        slot_ids: Tensor::from_vec(slot_ids, num_tokens, device)?,
        block_tables: Tensor::from_vec(block_tables, (num_decode, max_blocks), device)?,
        context_lens: Tensor::from_vec(context_lens, num_decode, device)?,
        max_context_len,
        last_token_indicies: Tensor::from_vec(last_token_indicies, num_seqs, device)?,
        token_ids: Tensor::from_vec(history, (num_seqs, max_tokens_len), device)?,
        seq_lens: Tensor::from_vec(seq_lens, num_seqs, device)?,
    };

    Ok(PackedBatch {
        token_ids: Tensor::from_vec(token_ids, num_tokens, device)?,
        positions: Tensor::from_vec(positions, num_tokens, device)?,
        input_params,
        sampling_params,
        seq_indices,
        ejected,
        num_seqs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sequence::SamplingParams;

    fn prefill_seq(id: u64, prompt: Vec<u32>) -> Sequence {
        Sequence::new(id, prompt, SamplingParams::default())
    }

    fn decode_seq(id: u64, prompt_len: usize, generated: &[u32]) -> Sequence {
        let mut seq = prefill_seq(id, (0..prompt_len as u32).collect());
        for &t in generated {
            seq.append_token(t).unwrap();
        }
        seq
    }

    #[test]
    fn test_mixed_batch_layout() {
        // One prefill of length 5 and one decode at context 10, block size 8.
        let mut manager = BlockManager::new(16, 8);
        let mut seqs = vec![decode_seq(2, 9, &[77]), prefill_seq(1, vec![1, 2, 3, 4, 5])];
        let batch =
            prepare_inputs(&mut seqs, &mut manager, 0, &Device::Cpu).unwrap();

        assert_eq!(batch.num_seqs, 2);
        assert!(batch.ejected.is_empty());
        // Prefill packs first even though the caller put it second.
        assert_eq!(batch.seq_indices, vec![1, 0]);
        assert_eq!(batch.input_params.num_prompt_tokens, 5);
        assert_eq!(batch.input_params.max_seq_len, 5);
        assert_eq!(batch.input_params.max_context_len, 10);

        let cu: Vec<u32> = batch.input_params.cu_seq_lens.to_vec1().unwrap();
        assert_eq!(cu, vec![0, 5]);
        let ctx: Vec<u32> = batch.input_params.context_lens.to_vec1().unwrap();
        assert_eq!(ctx, vec![10]);
        let last: Vec<u32> = batch.input_params.last_token_indicies.to_vec1().unwrap();
        assert_eq!(last, vec![4, 5]);

        let tokens: Vec<u32> = batch.token_ids.to_vec1().unwrap();
        assert_eq!(tokens, vec![1, 2, 3, 4, 5, 77]);
        let positions: Vec<u32> = batch.positions.to_vec1().unwrap();
        assert_eq!(positions, vec![0, 1, 2, 3, 4, 9]);
    }

    #[test]
    fn test_slot_formula() {
        let mut manager = BlockManager::new(8, 4);
        let mut seqs = vec![prefill_seq(1, vec![9, 8, 7, 6, 5, 4])];
        let batch = prepare_inputs(&mut seqs, &mut manager, 0, &Device::Cpu).unwrap();

        let table = seqs[0].block_table().block_ids().to_vec();
        assert_eq!(table.len(), 2);
        let slots: Vec<u32> = batch.input_params.slot_ids.to_vec1().unwrap();
        for (pos, &slot) in slots.iter().enumerate() {
            assert_eq!(slot as usize / 4, table[pos / 4]);
            assert_eq!(slot as usize % 4, pos % 4);
        }
    }

    #[test]
    fn test_ejection_on_out_of_blocks() {
        // Room for the first prompt only.
        let mut manager = BlockManager::new(2, 4);
        let mut seqs = vec![prefill_seq(1, vec![1; 8]), prefill_seq(2, vec![2; 4])];
        let batch = prepare_inputs(&mut seqs, &mut manager, 0, &Device::Cpu).unwrap();

        assert_eq!(batch.num_seqs, 1);
        assert_eq!(batch.ejected, vec![2]);
        // The ejected sequence kept nothing allocated.
        assert!(seqs[1].block_table().is_empty());
        assert_eq!(batch.seq_indices, vec![0]);
    }
}
