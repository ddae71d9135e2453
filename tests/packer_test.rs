//! Integration tests for the batch packer.

use candle_core::Device;
use pagedserve::batch::packer::prepare_inputs;
use pagedserve::core::block_manager::BlockManager;
use pagedserve::core::sequence::{SamplingParams, Sequence};

fn prefill(id: u64, prompt: Vec<u32>) -> Sequence {
    Sequence::new(id, prompt, SamplingParams::default())
}

fn decode(id: u64, prompt_len: usize, generated: &[u32]) -> Sequence {
    let mut seq = prefill(id, (100..100 + prompt_len as u32).collect());
    for &t in generated {
        seq.append_token(t).unwrap();
    }
    seq
}

#[test]
fn test_prefill_before_decode_with_permutation() {
    // Caller order: decode, prefill, decode, prefill. Packed order must be
    // [prefill, prefill, decode, decode] and seq_indices must map back.
    let mut manager = BlockManager::new(64, 8);
    let mut seqs = vec![
        decode(0, 4, &[1]),
        prefill(1, vec![1, 2, 3]),
        decode(2, 9, &[5, 6]),
        prefill(3, vec![7, 8, 9, 10, 11]),
    ];
    let batch = prepare_inputs(&mut seqs, &mut manager, 0, &Device::Cpu).unwrap();

    assert_eq!(batch.num_seqs, 4);
    // Caller index 0 (decode) packed at 2, index 1 (prefill) at 0, etc.
    assert_eq!(batch.seq_indices, vec![2, 0, 3, 1]);

    // Round-trip: permuting packed outputs by seq_indices restores caller
    // order.
    let packed_tokens: Vec<u32> = vec![10, 11, 12, 13]; // one per packed seq
    let restored: Vec<u32> = batch.seq_indices.iter().map(|&p| packed_tokens[p]).collect();
    assert_eq!(restored, vec![12, 10, 13, 11]);
}

#[test]
fn test_cu_seq_lens_prefix_sum_laws() {
    let lens = [2usize, 3, 4];
    let mut manager = BlockManager::new(64, 8);
    let mut seqs: Vec<Sequence> = lens
        .iter()
        .enumerate()
        .map(|(i, &l)| prefill(i as u64, (0..l as u32).collect()))
        .collect();
    let batch = prepare_inputs(&mut seqs, &mut manager, 0, &Device::Cpu).unwrap();

    let cu: Vec<u32> = batch.input_params.cu_seq_lens.to_vec1().unwrap();
    assert_eq!(cu, vec![0, 2, 5, 9]);
    assert_eq!(cu[0], 0);
    for (i, &l) in lens.iter().enumerate() {
        assert_eq!(cu[i + 1] - cu[i], l as u32);
    }
    assert_eq!(*cu.last().unwrap() as usize, lens.iter().sum::<usize>());
    assert_eq!(batch.input_params.num_prompt_tokens, 9);
    assert_eq!(batch.input_params.max_seq_len, 4);
}

#[test]
fn test_mixed_batch_metadata() {
    // B=8, one prefill of length 5 and one decode with context 10.
    let mut manager = BlockManager::new(16, 8);
    let mut seqs = vec![prefill(1, vec![1, 2, 3, 4, 5]), decode(2, 9, &[42])];
    let batch = prepare_inputs(&mut seqs, &mut manager, 0, &Device::Cpu).unwrap();

    let cu: Vec<u32> = batch.input_params.cu_seq_lens.to_vec1().unwrap();
    assert_eq!(cu, vec![0, 5]);
    assert_eq!(batch.input_params.max_seq_len, 5);

    let ctx: Vec<u32> = batch.input_params.context_lens.to_vec1().unwrap();
    assert_eq!(ctx, vec![10]);
    assert_eq!(batch.input_params.max_context_len, 10);

    let last: Vec<u32> = batch.input_params.last_token_indicies.to_vec1().unwrap();
    assert_eq!(last, vec![4, 5]);

    // The decode input token is the previously sampled one, at position 9.
    let tokens: Vec<u32> = batch.token_ids.to_vec1().unwrap();
    assert_eq!(tokens[5], 42);
    let positions: Vec<u32> = batch.positions.to_vec1().unwrap();
    assert_eq!(positions[5], 9);
}

#[test]
fn test_slot_ids_are_disjoint_across_the_batch() {
    let mut manager = BlockManager::new(64, 4);
    let mut seqs = vec![
        prefill(0, (0..7).collect()),
        prefill(1, (0..9).collect()),
        decode(2, 6, &[1, 2]),
        decode(3, 3, &[4]),
    ];
    let batch = prepare_inputs(&mut seqs, &mut manager, 0, &Device::Cpu).unwrap();

    let slots: Vec<u32> = batch.input_params.slot_ids.to_vec1().unwrap();
    let unique: std::collections::HashSet<u32> = slots.iter().copied().collect();
    assert_eq!(unique.len(), slots.len(), "duplicate slot in step batch");

    // Slot formula holds for every packed token.
    for (pos, &slot) in slots.iter().take(7).enumerate() {
        let table = seqs[0].block_table().block_ids();
        assert_eq!(slot as usize / 4, table[pos / 4]);
        assert_eq!(slot as usize % 4, pos % 4);
    }
}

#[test]
fn test_history_matrix_padding() {
    let mut manager = BlockManager::new(64, 8);
    let mut seqs = vec![prefill(0, vec![1, 2]), decode(1, 3, &[7, 8])];
    let batch = prepare_inputs(&mut seqs, &mut manager, 0, &Device::Cpu).unwrap();

    // max_tokens_len is 5 (decode history); the shorter row is padded.
    let history: Vec<Vec<u32>> = batch.input_params.token_ids.to_vec2().unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0], vec![1, 2, 0, 0, 0]);
    assert_eq!(history[1], vec![100, 101, 102, 7, 8]);

    let seq_lens: Vec<u32> = batch.input_params.seq_lens.to_vec1().unwrap();
    assert_eq!(seq_lens, vec![2, 5]);
}

#[test]
fn test_ejected_sequences_reported_not_packed() {
    // Pool with room for one 2-block prompt only.
    let mut manager = BlockManager::new(2, 4);
    let mut seqs = vec![
        prefill(10, (0..8).collect()),
        prefill(11, (0..4).collect()),
        prefill(12, (0..4).collect()),
    ];
    let batch = prepare_inputs(&mut seqs, &mut manager, 0, &Device::Cpu).unwrap();

    assert_eq!(batch.num_seqs, 1);
    assert_eq!(batch.ejected, vec![11, 12]);
    assert_eq!(batch.seq_indices, vec![0]);
    assert_eq!(manager.num_free_blocks(), 0);
}

#[test]
fn test_sampling_params_follow_packed_order() {
    let mut manager = BlockManager::new(64, 8);
    let mut cold = Sequence::new(
        1,
        vec![1, 2],
        SamplingParams {
            temperature: 0.5,
            ..Default::default()
        },
    );
    cold.append_token(3).unwrap();
    let hot = Sequence::new(
        0,
        vec![1, 2],
        SamplingParams {
            temperature: 2.0,
            ..Default::default()
        },
    );

    // Caller order: decode first; packed order: prefill first.
    let mut seqs = vec![cold, hot];
    let batch = prepare_inputs(&mut seqs, &mut manager, 99, &Device::Cpu).unwrap();
    assert_eq!(batch.sampling_params.temperatures, vec![2.0, 0.5]);
    assert_eq!(batch.sampling_params.seed, 99);
}
