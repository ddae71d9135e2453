//! Tensor-parallel plumbing: rank/world-size descriptors, the collective
//! seam the model layers reduce through, and an in-process group for
//! single-host worker threads.
//!
//! Block ids and packed batches are identical on every rank; shards differ
//! only in the per-head slices of their weights and KV tensors. Row-parallel
//! layers all-reduce their partial activations through [`ProcessGroup`], and
//! the engine broadcasts the per-step sampling seed through the same seam so
//! every rank samples the same token.

use std::sync::{Arc, Condvar, Mutex};

use candle_core::{Device, Tensor};

use crate::error::{Error, Result};

/// Collective operations shared by all workers of one tensor-parallel group.
///
/// A production deployment backs this with NCCL; [`LocalProcessGroup`]
/// provides an in-process implementation for CPU workers and tests.
pub trait ProcessGroup: Send + Sync + std::fmt::Debug {
    /// This member's rank.
    fn rank(&self) -> usize;

    /// Number of members in the group.
    fn world_size(&self) -> usize;

    /// Element-wise sum of `tensor` across all ranks. Every rank receives
    /// the full sum on its own device.
    fn all_reduce_sum(&self, tensor: &Tensor) -> Result<Tensor>;

    /// Broadcast a scalar from `root` to all ranks.
    fn broadcast_u64(&self, value: u64, root: usize) -> Result<u64>;
}

/// Rank, world size, and the collective handle (present iff world size > 1).
#[derive(Debug, Clone)]
pub struct ParallelArgs {
    rank: usize,
    world_size: usize,
    process_group: Option<Arc<dyn ProcessGroup>>,
}

impl ParallelArgs {
    /// Describe one rank of a tensor-parallel group.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the group handle is missing for a world
    /// size above one, or the rank is out of range.
    pub fn new(
        rank: usize,
        world_size: usize,
        process_group: Option<Arc<dyn ProcessGroup>>,
    ) -> Result<Self> {
        if rank >= world_size {
            return Err(Error::Config(format!(
                "rank {rank} out of range for world size {world_size}"
            )));
        }
        if world_size > 1 && process_group.is_none() {
            return Err(Error::Config(
                "world size > 1 requires a process group".to_string(),
            ));
        }
        Ok(Self {
            rank,
            world_size,
            process_group,
        })
    }

    /// A single-rank configuration with no collectives.
    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            process_group: None,
        }
    }

    /// Get the rank.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Get the world size.
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Get the collective handle, if any.
    pub fn process_group(&self) -> Option<&Arc<dyn ProcessGroup>> {
        self.process_group.as_ref()
    }

    /// Sum `tensor` across ranks; identity when running single-rank.
    pub fn all_reduce_sum(&self, tensor: &Tensor) -> Result<Tensor> {
        match &self.process_group {
            Some(group) => group.all_reduce_sum(tensor),
            None => Ok(tensor.clone()),
        }
    }
}

/// Slice `tensor` along `dim` into `world_size` equal shards and return the
/// one owned by `rank`.
///
/// # Errors
///
/// Returns [`Error::Config`] if the dimension does not divide evenly.
pub fn shard(tensor: &Tensor, dim: usize, rank: usize, world_size: usize) -> Result<Tensor> {
    if world_size == 1 {
        return Ok(tensor.clone());
    }
    let size = tensor.dim(dim)?;
    if size % world_size != 0 {
        return Err(Error::Config(format!(
            "cannot shard dimension of size {size} across {world_size} ranks"
        )));
    }
    let chunk = size / world_size;
    Ok(tensor.narrow(dim, rank * chunk, chunk)?)
}

// One rendezvous round: members deposit, the last arrival combines, everyone
// drains the result, the last reader resets for the next round.
struct Round {
    deposits: Vec<Option<Vec<f32>>>,
    arrived: usize,
    result: Option<Vec<f32>>,
    taken: usize,
}

#[derive(Debug)]
struct GroupShared {
    state: Mutex<Round>,
    cond: Condvar,
    world_size: usize,
}

impl std::fmt::Debug for Round {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Round")
            .field("arrived", &self.arrived)
            .field("taken", &self.taken)
            .finish()
    }
}

impl GroupShared {
    fn rendezvous<F>(&self, rank: usize, value: Option<Vec<f32>>, combine: F) -> Vec<f32>
    where
        F: Fn(&mut [Option<Vec<f32>>]) -> Vec<f32>,
    {
        let mut state = self.state.lock().expect("process group lock poisoned");

        // Wait out the previous round's drain before depositing.
        while state.result.is_some() {
            state = self.cond.wait(state).expect("process group lock poisoned");
        }

        state.deposits[rank] = value;
        state.arrived += 1;
        if state.arrived == self.world_size {
            let combined = combine(&mut state.deposits);
            state.result = Some(combined);
            state.arrived = 0;
            self.cond.notify_all();
        } else {
            while state.result.is_none() {
                state = self.cond.wait(state).expect("process group lock poisoned");
            }
        }

        let out = state
            .result
            .clone()
            .expect("rendezvous result present after wait");
        state.taken += 1;
        if state.taken == self.world_size {
            state.result = None;
            state.taken = 0;
            state.deposits.iter_mut().for_each(|d| *d = None);
            self.cond.notify_all();
        }
        out
    }
}

/// In-process collective group for worker threads sharing one address space.
///
/// Values cross the group as f32 host buffers, which is exact for the token
/// ids and seeds it carries and for f32 CPU activations. Exercises the same
/// seams an NCCL-backed group would.
#[derive(Debug)]
pub struct LocalProcessGroup {
    rank: usize,
    shared: Arc<GroupShared>,
}

impl LocalProcessGroup {
    /// Build a group of `world_size` members, one handle per rank.
    pub fn create(world_size: usize) -> Vec<Arc<dyn ProcessGroup>> {
        let shared = Arc::new(GroupShared {
            state: Mutex::new(Round {
                deposits: vec![None; world_size],
                arrived: 0,
                result: None,
                taken: 0,
            }),
            cond: Condvar::new(),
            world_size,
        });
        (0..world_size)
            .map(|rank| {
                Arc::new(Self {
                    rank,
                    shared: Arc::clone(&shared),
                }) as Arc<dyn ProcessGroup>
            })
            .collect()
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn all_reduce_sum(&self, tensor: &Tensor) -> Result<Tensor> {
        let dtype = tensor.dtype();
        let dims = tensor.dims().to_vec();
        let host: Vec<f32> = tensor
            .to_device(&Device::Cpu)?
            .to_dtype(candle_core::DType::F32)?
            .flatten_all()?
            .to_vec1()?;

        let sum = self.shared.rendezvous(self.rank, Some(host), |deposits| {
            let mut acc: Option<Vec<f32>> = None;
            for d in deposits.iter_mut() {
                match (&mut acc, d.take()) {
                    (None, Some(v)) => acc = Some(v),
                    (Some(acc), Some(v)) => {
                        for (a, b) in acc.iter_mut().zip(v) {
                            *a += b;
                        }
                    }
                    _ => {}
                }
            }
            acc.unwrap_or_default()
        });

        let out = Tensor::from_vec(sum, dims, &Device::Cpu)?
            .to_dtype(dtype)?
            .to_device(tensor.device())?;
        Ok(out)
    }

    fn broadcast_u64(&self, value: u64, root: usize) -> Result<u64> {
        let deposit = (self.rank == root).then(|| {
            // u64 split into two f32-exact 16-bit limbs per half.
            vec![
                (value & 0xffff) as f32,
                ((value >> 16) & 0xffff) as f32,
                ((value >> 32) & 0xffff) as f32,
                ((value >> 48) & 0xffff) as f32,
            ]
        });
        let out = self.shared.rendezvous(self.rank, deposit, |deposits| {
            deposits
                .iter_mut()
                .find_map(|d| d.take())
                .unwrap_or_default()
        });
        if out.len() != 4 {
            return Err(Error::Worker("broadcast root deposited nothing".to_string()));
        }
        let limbs: Vec<u64> = out.iter().map(|&f| f as u64).collect();
        Ok(limbs[0] | limbs[1] << 16 | limbs[2] << 32 | limbs[3] << 48)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_all_reduce_sum() {
        let group = LocalProcessGroup::create(3);
        let handles: Vec<_> = group
            .into_iter()
            .enumerate()
            .map(|(rank, g)| {
                thread::spawn(move || {
                    let t = Tensor::full(rank as f32 + 1.0, (2, 2), &Device::Cpu).unwrap();
                    let sum = g.all_reduce_sum(&t).unwrap();
                    let v: Vec<f32> = sum.flatten_all().unwrap().to_vec1().unwrap();
                    assert_eq!(v, vec![6.0; 4]);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_broadcast_seed() {
        let group = LocalProcessGroup::create(2);
        let seed = 0xdead_beef_cafe_f00d_u64;
        let handles: Vec<_> = group
            .into_iter()
            .enumerate()
            .map(|(rank, g)| {
                thread::spawn(move || {
                    let local = if rank == 0 { seed } else { 0 };
                    g.broadcast_u64(local, 0).unwrap()
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), seed);
        }
    }

    #[test]
    fn test_group_is_reusable() {
        let group = LocalProcessGroup::create(2);
        let handles: Vec<_> = group
            .into_iter()
            .map(|g| {
                thread::spawn(move || {
                    for round in 0..10u64 {
                        let got = g.broadcast_u64(round * 7, 0).unwrap();
                        assert_eq!(got, round * 7);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_shard_splits_evenly() {
        let t = Tensor::arange(0f32, 8f32, &Device::Cpu).unwrap();
        let s = shard(&t, 0, 1, 2).unwrap();
        let v: Vec<f32> = s.to_vec1().unwrap();
        assert_eq!(v, vec![4.0, 5.0, 6.0, 7.0]);
        assert!(shard(&t, 0, 0, 3).is_err());
    }
}
