//! Block manager for the paged KV cache.
//!
//! The manager owns the pool of free block ids and hands them out to
//! sequences. It never over-commits: an allocation either fully covers the
//! requested token count or fails with [`Error::OutOfBlocks`] leaving all
//! state untouched, so the scheduler can defer or preempt and retry.
//!
//! Allocation pops from the tail of the free list (LIFO), which keeps the
//! id sequence deterministic for a given history.

use crate::core::block::blocks_needed;
use crate::core::sequence::Sequence;
use crate::error::{Error, Result};

/// Manages allocation and release of KV cache blocks.
#[derive(Debug)]
pub struct BlockManager {
    /// Free block ids; allocation pops from the back.
    free_list: Vec<usize>,
    /// Number of tokens per block.
    block_size: usize,
    /// Total number of blocks.
    num_blocks: usize,
}

impl BlockManager {
    /// Create a block manager over `num_blocks` blocks of `block_size` slots.
    ///
    /// # Example
    ///
    /// ```
    /// use pagedserve::core::block_manager::BlockManager;
    ///
    /// let manager = BlockManager::new(1024, 16);
    /// assert_eq!(manager.num_free_blocks(), 1024);
    /// ```
    pub fn new(num_blocks: usize, block_size: usize) -> Self {
        // Reversed so the first pop yields block 0.
        let free_list: Vec<usize> = (0..num_blocks).rev().collect();
        Self {
            free_list,
            block_size,
            num_blocks,
        }
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Get the total number of blocks.
    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// Get the number of free blocks.
    pub fn num_free_blocks(&self) -> usize {
        self.free_list.len()
    }

    /// Check whether `count` more blocks can be allocated.
    pub fn can_allocate(&self, count: usize) -> bool {
        self.free_list.len() >= count
    }

    /// Ensure `sequence` owns enough blocks to cover `needed_tokens` slots.
    ///
    /// Appends exactly `ceil(needed_tokens / block_size) - owned` fresh block
    /// ids to the sequence's table (possibly zero). Atomic: on failure the
    /// free list and the sequence's table are unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBlocks`] if the free list cannot cover the gap.
    pub fn allocate_for(&mut self, sequence: &mut Sequence, needed_tokens: usize) -> Result<()> {
        let needed = blocks_needed(needed_tokens, self.block_size);
        let owned = sequence.block_table().num_blocks();
        if needed <= owned {
            return Ok(());
        }

        let grow = needed - owned;
        if !self.can_allocate(grow) {
            return Err(Error::OutOfBlocks);
        }
        for _ in 0..grow {
            // can_allocate above guarantees the pop succeeds
            let block_id = self.free_list.pop().ok_or(Error::OutOfBlocks)?;
            sequence.block_table_mut().append_block(block_id);
        }
        Ok(())
    }

    /// Return every block owned by `sequence` to the free list and clear its
    /// table. Idempotent: releasing a sequence with an empty table is a no-op.
    pub fn release(&mut self, sequence: &mut Sequence) {
        let blocks = sequence.block_table_mut().take_blocks();
        self.free_list.extend(blocks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sequence::{SamplingParams, Sequence};

    fn seq(id: u64, prompt_len: usize) -> Sequence {
        Sequence::new(id, (0..prompt_len as u32).collect(), SamplingParams::default())
    }

    #[test]
    fn test_allocate_covers_tokens() {
        let mut manager = BlockManager::new(8, 4);
        let mut s = seq(1, 6);

        manager.allocate_for(&mut s, 6).unwrap();
        assert_eq!(s.block_table().num_blocks(), 2);
        assert_eq!(manager.num_free_blocks(), 6);

        // Growing within the covered range allocates nothing.
        manager.allocate_for(&mut s, 8).unwrap();
        assert_eq!(s.block_table().num_blocks(), 2);

        manager.allocate_for(&mut s, 9).unwrap();
        assert_eq!(s.block_table().num_blocks(), 3);
        assert_eq!(manager.num_free_blocks(), 5);
    }

    #[test]
    fn test_allocation_failure_is_atomic() {
        let mut manager = BlockManager::new(2, 4);
        let mut a = seq(1, 8);
        manager.allocate_for(&mut a, 8).unwrap();
        assert_eq!(manager.num_free_blocks(), 0);

        let mut b = seq(2, 5);
        let err = manager.allocate_for(&mut b, 5).unwrap_err();
        assert!(matches!(err, Error::OutOfBlocks));
        assert!(b.block_table().is_empty());
        assert_eq!(manager.num_free_blocks(), 0);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut manager = BlockManager::new(4, 4);
        let mut s = seq(1, 10);
        manager.allocate_for(&mut s, 10).unwrap();
        assert_eq!(manager.num_free_blocks(), 1);

        manager.release(&mut s);
        assert_eq!(manager.num_free_blocks(), 4);
        assert!(s.block_table().is_empty());

        manager.release(&mut s);
        assert_eq!(manager.num_free_blocks(), 4);
    }

    #[test]
    fn test_conservation_invariant() {
        let mut manager = BlockManager::new(16, 8);
        let mut seqs: Vec<Sequence> = (0..4).map(|i| seq(i, 8 + i as usize * 7)).collect();

        for s in &mut seqs {
            let total = s.total_tokens();
            manager.allocate_for(s, total).unwrap();
        }
        let allocated: usize = seqs.iter().map(|s| s.block_table().num_blocks()).sum();
        assert_eq!(manager.num_free_blocks() + allocated, 16);

        for s in &mut seqs {
            manager.release(s);
        }
        assert_eq!(manager.num_free_blocks(), 16);
    }
}
