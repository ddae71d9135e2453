//! Paged KV cache storage for one worker shard.
//!
//! Each layer owns a key tensor and a value tensor indexed by block id.
//! Block ids are identical across all tensor-parallel workers; only the
//! `n_local_kv_heads` dimension differs between shards.
//!
//! ## Memory layout
//!
//! ```text
//! Key:   [num_blocks, n_local_kv_heads, head_dim / x, block_size, x]
//! Value: [num_blocks, n_local_kv_heads, head_dim, block_size]
//! ```
//!
//! where `x = 16 / dtype_size_bytes` packs contiguous key reads into 16-byte
//! vector loads on accelerator hardware.

use candle_core::{DType, Device, Tensor};

use crate::error::{Error, Result};

/// Shape parameters for one shard's per-layer cache tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvCacheShape {
    /// Number of blocks carved out of the cache budget.
    pub num_blocks: usize,
    /// Token slots per block.
    pub block_size: usize,
    /// KV heads held by this shard.
    pub n_local_kv_heads: usize,
    /// Dimension per head.
    pub head_dim: usize,
    /// Key packing factor, `16 / dtype_size_bytes`.
    pub x: usize,
}

impl KvCacheShape {
    /// Derive the shard cache shape for the given geometry and dtype.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `head_dim` is not divisible by the
    /// packing factor.
    pub fn new(
        num_blocks: usize,
        block_size: usize,
        n_local_kv_heads: usize,
        head_dim: usize,
        dtype: DType,
    ) -> Result<Self> {
        let x = 16 / dtype.size_in_bytes();
        if head_dim % x == 0 {
            Ok(Self {
                num_blocks,
                block_size,
                n_local_kv_heads,
                head_dim,
                x,
            })
        } else {
            Err(Error::Config(format!(
                "head_dim {head_dim} not divisible by key packing factor {x}"
            )))
        }
    }

    /// Key tensor dimensions: `[num_blocks, kv_heads, head_dim/x, block_size, x]`.
    pub fn key_shape(&self) -> Vec<usize> {
        vec![
            self.num_blocks,
            self.n_local_kv_heads,
            self.head_dim / self.x,
            self.block_size,
            self.x,
        ]
    }

    /// Value tensor dimensions: `[num_blocks, kv_heads, head_dim, block_size]`.
    pub fn value_shape(&self) -> Vec<usize> {
        vec![
            self.num_blocks,
            self.n_local_kv_heads,
            self.head_dim,
            self.block_size,
        ]
    }
}

/// Bytes one block occupies across all layers of a shard (key + value).
pub fn block_size_in_bytes(
    block_size: usize,
    n_local_kv_heads: usize,
    head_dim: usize,
    n_layers: usize,
    dtype: DType,
) -> usize {
    2 * block_size * n_local_kv_heads * head_dim * n_layers * dtype.size_in_bytes()
}

/// KV cache tensors for a single transformer layer of one shard.
#[derive(Debug, Clone)]
pub struct KvCache {
    key: Tensor,
    value: Tensor,
    shape: KvCacheShape,
}

impl KvCache {
    /// Allocate zeroed cache tensors on `device`.
    pub fn new(shape: KvCacheShape, dtype: DType, device: &Device) -> Result<Self> {
        let key = Tensor::zeros(shape.key_shape(), dtype, device)?;
        let value = Tensor::zeros(shape.value_shape(), dtype, device)?;
        Ok(Self { key, value, shape })
    }

    /// Get the shape parameters.
    pub fn shape(&self) -> &KvCacheShape {
        &self.shape
    }

    /// Get the key cache tensor.
    pub fn key(&self) -> &Tensor {
        &self.key
    }

    /// Get the value cache tensor.
    pub fn value(&self) -> &Tensor {
        &self.value
    }

    /// Write one token's key/value states at a global slot id.
    ///
    /// `k` and `v` have shape `[n_local_kv_heads, head_dim]`.
    ///
    /// # Errors
    ///
    /// Fails if the slot id addresses a block beyond the cache.
    pub fn write_slot(&mut self, slot_id: usize, k: &Tensor, v: &Tensor) -> Result<()> {
        let block_id = slot_id / self.shape.block_size;
        let offset = slot_id % self.shape.block_size;
        if block_id >= self.shape.num_blocks {
            return Err(Error::Config(format!(
                "slot {slot_id} addresses block {block_id} beyond cache of {} blocks",
                self.shape.num_blocks
            )));
        }

        let (kv_heads, head_dim, x) = (
            self.shape.n_local_kv_heads,
            self.shape.head_dim,
            self.shape.x,
        );

        // Key: [kv_heads, head_dim] -> [1, kv_heads, head_dim/x, 1, x]
        let k = k.reshape((1, kv_heads, head_dim / x, 1, x))?;
        let row = self.key.narrow(0, block_id, 1)?;
        let row = row.slice_scatter(&k, 3, offset)?;
        self.key = self.key.slice_scatter(&row, 0, block_id)?;

        // Value: [kv_heads, head_dim] -> [1, kv_heads, head_dim, 1]
        let v = v.reshape((1, kv_heads, head_dim, 1))?;
        let row = self.value.narrow(0, block_id, 1)?;
        let row = row.slice_scatter(&v, 3, offset)?;
        self.value = self.value.slice_scatter(&row, 0, block_id)?;

        Ok(())
    }

    /// Gather the first `context_len` cached keys and values of a sequence.
    ///
    /// `block_ids` is the sequence's block table. Returns `(keys, values)` in
    /// token order, each of shape `[context_len, n_local_kv_heads, head_dim]`.
    ///
    /// # Errors
    ///
    /// Fails if the block table does not cover `context_len` tokens.
    pub fn gather(&self, block_ids: &[usize], context_len: usize) -> Result<(Tensor, Tensor)> {
        let block_size = self.shape.block_size;
        if block_ids.len() * block_size < context_len {
            return Err(Error::Config(format!(
                "block table of {} blocks cannot cover context of {context_len} tokens",
                block_ids.len()
            )));
        }

        let ids: Vec<u32> = block_ids.iter().map(|&id| id as u32).collect();
        let ids = Tensor::from_vec(ids, block_ids.len(), self.key.device())?;
        let num_blocks = block_ids.len();
        let (kv_heads, head_dim) = (self.shape.n_local_kv_heads, self.shape.head_dim);

        // [nblk, kvh, hd/x, B, x] -> [nblk, B, kvh, hd/x, x] -> [nblk*B, kvh, hd]
        let keys = self
            .key
            .index_select(&ids, 0)?
            .permute((0, 3, 1, 2, 4))?
            .contiguous()?
            .reshape((num_blocks * block_size, kv_heads, head_dim))?
            .narrow(0, 0, context_len)?;

        // [nblk, kvh, hd, B] -> [nblk, B, kvh, hd] -> [nblk*B, kvh, hd]
        let values = self
            .value
            .index_select(&ids, 0)?
            .permute((0, 3, 1, 2))?
            .contiguous()?
            .reshape((num_blocks * block_size, kv_heads, head_dim))?
            .narrow(0, 0, context_len)?;

        Ok((keys, values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_shape() -> KvCacheShape {
        KvCacheShape::new(8, 4, 2, 16, DType::F32).unwrap()
    }

    #[test]
    fn test_shapes() {
        let shape = test_shape();
        assert_eq!(shape.x, 4);
        assert_eq!(shape.key_shape(), vec![8, 2, 4, 4, 4]);
        assert_eq!(shape.value_shape(), vec![8, 2, 16, 4]);
    }

    #[test]
    fn test_block_size_in_bytes() {
        // 2 * 16 * 8 * 64 * 2 layers * 2 bytes
        assert_eq!(block_size_in_bytes(16, 8, 64, 2, DType::F16), 131072);
    }

    #[test]
    fn test_write_then_gather_roundtrip() {
        let shape = test_shape();
        let device = Device::Cpu;
        let mut cache = KvCache::new(shape, DType::F32, &device).unwrap();

        // Sequence owns blocks [5, 2]; write 6 tokens.
        let block_ids = [5usize, 2];
        let block_size = shape.block_size;
        for pos in 0..6 {
            let slot = block_ids[pos / block_size] * block_size + pos % block_size;
            let k = Tensor::full(pos as f32 + 1.0, (2, 16), &device).unwrap();
            let v = Tensor::full(-(pos as f32 + 1.0), (2, 16), &device).unwrap();
            cache.write_slot(slot, &k, &v).unwrap();
        }

        let (keys, values) = cache.gather(&block_ids, 6).unwrap();
        assert_eq!(keys.dims(), &[6, 2, 16]);
        assert_eq!(values.dims(), &[6, 2, 16]);

        let k_flat: Vec<f32> = keys.flatten_all().unwrap().to_vec1().unwrap();
        let v_flat: Vec<f32> = values.flatten_all().unwrap().to_vec1().unwrap();
        for pos in 0..6 {
            assert_eq!(k_flat[pos * 32], pos as f32 + 1.0);
            assert_eq!(v_flat[pos * 32], -(pos as f32 + 1.0));
        }
    }

    #[test]
    fn test_out_of_range_slot() {
        let shape = test_shape();
        let device = Device::Cpu;
        let mut cache = KvCache::new(shape, DType::F32, &device).unwrap();
        let k = Tensor::zeros((2, 16), DType::F32, &device).unwrap();
        let v = k.clone();
        assert!(cache.write_slot(8 * 4, &k, &v).is_err());
    }
}
