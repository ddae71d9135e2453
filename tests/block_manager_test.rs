//! Integration tests for the block manager.

use pagedserve::core::block::blocks_needed;
use pagedserve::core::block_manager::BlockManager;
use pagedserve::core::sequence::{SamplingParams, Sequence};
use pagedserve::Error;

fn seq(id: u64, prompt_len: usize) -> Sequence {
    Sequence::new(id, (0..prompt_len as u32).collect(), SamplingParams::default())
}

#[test]
fn test_creation() {
    let manager = BlockManager::new(100, 16);
    assert_eq!(manager.num_blocks(), 100);
    assert_eq!(manager.block_size(), 16);
    assert_eq!(manager.num_free_blocks(), 100);
}

#[test]
fn test_prompt_of_six_tokens_takes_two_blocks() {
    // B=4, N=8: a 6-token prompt covers two blocks, slots are contiguous
    // within each block.
    let mut manager = BlockManager::new(8, 4);
    let mut s = seq(1, 6);
    manager.allocate_for(&mut s, 6).unwrap();

    assert_eq!(s.block_table().num_blocks(), 2);
    assert_eq!(manager.num_free_blocks(), 6);

    let ids = s.block_table().block_ids().to_vec();
    let slots = s.block_table().slot_ids(0, 6, 4);
    let expected: Vec<usize> = (0..4)
        .map(|o| ids[0] * 4 + o)
        .chain((0..2).map(|o| ids[1] * 4 + o))
        .collect();
    assert_eq!(slots, expected);
}

#[test]
fn test_pool_exhaustion() {
    // B=16, N=2: two 10-token prompts fit, a third admission fails.
    let mut manager = BlockManager::new(2, 16);
    let mut a = seq(1, 10);
    let mut b = seq(2, 10);
    let mut c = seq(3, 1);

    manager.allocate_for(&mut a, 10).unwrap();
    manager.allocate_for(&mut b, 10).unwrap();
    assert!(matches!(
        manager.allocate_for(&mut c, 1),
        Err(Error::OutOfBlocks)
    ));
    assert!(c.block_table().is_empty());
}

#[test]
fn test_release_returns_blocks() {
    // Releasing a 3-block sequence frees 3 blocks and the same span can be
    // re-allocated.
    let mut manager = BlockManager::new(4, 4);
    let mut s = seq(1, 12);
    manager.allocate_for(&mut s, 12).unwrap();
    assert_eq!(s.block_table().num_blocks(), 3);
    let free_before = manager.num_free_blocks();

    manager.release(&mut s);
    assert_eq!(manager.num_free_blocks(), free_before + 3);
    assert!(s.block_table().is_empty());

    let mut again = seq(2, 12);
    manager.allocate_for(&mut again, 12).unwrap();
    assert_eq!(again.block_table().num_blocks(), 3);
}

#[test]
fn test_conservation_over_random_history() {
    // free_blocks + sum(allocated) == N after any allocate/release history.
    let mut manager = BlockManager::new(32, 8);
    let mut seqs: Vec<Sequence> = (0..6).map(|i| seq(i, 5 + (i as usize * 13) % 40)).collect();

    let mut state = 0x9e3779b9u64;
    for round in 0..50 {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(round);
        let i = (state >> 33) as usize % seqs.len();
        if state % 3 == 0 {
            manager.release(&mut seqs[i]);
        } else {
            let grow = seqs[i].total_tokens() + (state % 17) as usize;
            let _ = manager.allocate_for(&mut seqs[i], grow);
        }

        let allocated: usize = seqs.iter().map(|s| s.block_table().num_blocks()).sum();
        assert_eq!(manager.num_free_blocks() + allocated, 32);

        // No block id owned twice.
        let mut seen = std::collections::HashSet::new();
        for s in &seqs {
            for &id in s.block_table().block_ids() {
                assert!(seen.insert(id), "block {id} owned by two sequences");
            }
        }
    }
}

#[test]
fn test_block_table_growth_matches_token_count() {
    // After k decode steps from a prompt of length L, the table holds
    // ceil((L + k) / B) blocks.
    let (l, b) = (11usize, 4usize);
    let mut manager = BlockManager::new(64, b);
    let mut s = seq(1, l);
    manager.allocate_for(&mut s, l).unwrap();

    for k in 1..=30usize {
        s.append_token(7).unwrap();
        let total = s.total_tokens();
        manager.allocate_for(&mut s, total).unwrap();
        assert_eq!(s.total_tokens(), l + k);
        assert_eq!(s.block_table().num_blocks(), blocks_needed(l + k, b));
    }
}
