//! Core bookkeeping: blocks, the block manager, sequences, and KV storage.

pub mod block;
pub mod block_manager;
pub mod kv_cache;
pub mod sequence;

pub use block::{blocks_needed, BlockTable, DEFAULT_BLOCK_SIZE};
pub use block_manager::BlockManager;
pub use kv_cache::{KvCache, KvCacheShape};
pub use sequence::{FinishReason, SamplingParams, Sequence, SequenceId, SequencePhase};
