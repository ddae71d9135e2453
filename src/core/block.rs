//! Block and slot addressing for the paged KV cache.
//!
//! The cache is carved into fixed-size blocks of `block_size` token slots.
//! A sequence owns an ordered list of block ids (its block table); the token
//! at sequence position `p` lives in slot
//! `block_table[p / block_size] * block_size + (p % block_size)`.

/// Default number of token slots per block.
pub const DEFAULT_BLOCK_SIZE: usize = 16;

/// Maps a sequence's logical positions to physical block ids.
///
/// Works like a page table: logical block index `p / block_size` resolves to
/// a physical block id in the global pool. The block size is a process-wide
/// constant owned by the block manager, so the slot helpers take it as an
/// argument rather than duplicating it per table.
///
/// # Example
///
/// ```
/// use pagedserve::core::block::BlockTable;
///
/// let mut table = BlockTable::default();
/// table.append_block(5);   // tokens 0-15
/// table.append_block(12);  // tokens 16-31
///
/// assert_eq!(table.slot_id(20, 16), Some(12 * 16 + 4));
/// ```
#[derive(Debug, Clone, Default)]
pub struct BlockTable {
    /// Physical block ids in logical order.
    block_ids: Vec<usize>,
}

impl BlockTable {
    /// Add a physical block at the end of the table.
    pub fn append_block(&mut self, block_id: usize) {
        self.block_ids.push(block_id);
    }

    /// Number of blocks assigned to this sequence.
    pub fn num_blocks(&self) -> usize {
        self.block_ids.len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.block_ids.is_empty()
    }

    /// All physical block ids in logical order.
    pub fn block_ids(&self) -> &[usize] {
        &self.block_ids
    }

    /// Total number of token slots the table covers.
    pub fn num_slots(&self, block_size: usize) -> usize {
        self.block_ids.len() * block_size
    }

    /// Global slot id for the token at sequence position `pos`, or `None` if
    /// the covering block has not been allocated.
    pub fn slot_id(&self, pos: usize, block_size: usize) -> Option<usize> {
        let logical_block = pos / block_size;
        self.block_ids
            .get(logical_block)
            .map(|&physical| physical * block_size + pos % block_size)
    }

    /// Global slot ids for the token positions `[start, end)`.
    ///
    /// Positions beyond the allocated blocks are silently dropped; callers
    /// allocate before packing, so a shortfall indicates a packing bug that
    /// surfaces as a length mismatch downstream.
    pub fn slot_ids(&self, start: usize, end: usize, block_size: usize) -> Vec<usize> {
        (start..end)
            .filter_map(|pos| self.slot_id(pos, block_size))
            .collect()
    }

    /// Remove all blocks from the table, returning the ids.
    pub fn take_blocks(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.block_ids)
    }
}

/// Number of blocks needed to hold `num_tokens` tokens.
///
/// # Example
///
/// ```
/// use pagedserve::core::block::blocks_needed;
///
/// assert_eq!(blocks_needed(35, 16), 3);
/// assert_eq!(blocks_needed(32, 16), 2);
/// assert_eq!(blocks_needed(0, 16), 0);
/// ```
pub fn blocks_needed(num_tokens: usize, block_size: usize) -> usize {
    num_tokens.div_ceil(block_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_mapping() {
        let mut table = BlockTable::default();
        table.append_block(7);
        table.append_block(2);

        assert_eq!(table.slot_id(0, 4), Some(28));
        assert_eq!(table.slot_id(3, 4), Some(31));
        assert_eq!(table.slot_id(4, 4), Some(8));
        assert_eq!(table.slot_id(8, 4), None);

        assert_eq!(table.slot_ids(0, 6, 4), vec![28, 29, 30, 31, 8, 9]);
    }

    #[test]
    fn test_take_blocks() {
        let mut table = BlockTable::default();
        table.append_block(1);
        table.append_block(4);

        assert_eq!(table.take_blocks(), vec![1, 4]);
        assert!(table.is_empty());
    }
}
