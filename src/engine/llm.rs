//! The engine: initialization protocol and per-step dispatch.
//!
//! The engine owns one worker per device, the block manager, and the model
//! metadata. Initialization runs in a fixed order: build workers (with a
//! process group when there is more than one device), resolve the dtype,
//! initialize and load the model on every worker in parallel, size the KV
//! cache from measured memory, then allocate cache tensors everywhere.
//!
//! A step packs the batch, fans the same prepared tensors out to all
//! workers, takes rank 0's output (identical everywhere: logits are reduced
//! inside the model and the sampling seed is broadcast), and applies the
//! inverse packing permutation so the caller gets tokens in its own order.

use candle_core::{DType, Device};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokenizers::Tokenizer;
use tracing::{info, warn};

use crate::batch::input_params::OutputParameters;
use crate::batch::packer::prepare_inputs;
use crate::config::{parse_dtype, EngineOptions};
use crate::core::block_manager::BlockManager;
use crate::core::kv_cache::{block_size_in_bytes, KvCacheShape};
use crate::core::sequence::{Sequence, SequenceId};
use crate::engine::memory;
use crate::error::{Error, Result};
use crate::model::args::{ModelArgs, QuantArgs};
use crate::model::loader::ModelLoader;
use crate::model::registry::ModelRegistry;
use crate::parallel::{LocalProcessGroup, ParallelArgs};
use crate::worker::Worker;

/// Result of one engine step.
#[derive(Debug, Default)]
pub struct StepOutput {
    /// One sampled token per surviving sequence, in the caller's order.
    pub next_tokens: Vec<u32>,
    /// Sequences dropped from this step because block allocation failed.
    pub ejected: Vec<SequenceId>,
}

/// Coordinates workers, the block manager, and model metadata.
pub struct Engine {
    workers: Vec<Worker>,
    devices: Vec<Device>,
    options: EngineOptions,
    registry: ModelRegistry,
    dtype: DType,
    args: Option<ModelArgs>,
    quant_args: QuantArgs,
    tokenizer: Option<Tokenizer>,
    block_manager: Option<BlockManager>,
    step_rng: StdRng,
}

impl Engine {
    /// Build one worker per device. More than one device constructs an
    /// in-process collective group and hands each worker its rank.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an empty device list or invalid
    /// options.
    pub fn new(devices: Vec<Device>, options: EngineOptions, registry: ModelRegistry) -> Result<Self> {
        if devices.is_empty() {
            return Err(Error::Config("at least one device is required".to_string()));
        }
        options.validate()?;
        if options.disable_custom_kernels {
            warn!("custom kernels are disabled, using generic kernels");
        }

        let world_size = devices.len();
        let mut groups = if world_size > 1 {
            LocalProcessGroup::create(world_size)
        } else {
            Vec::new()
        };

        let mut workers = Vec::with_capacity(world_size);
        for (rank, device) in devices.iter().enumerate() {
            let group = if world_size > 1 {
                Some(groups.remove(0))
            } else {
                None
            };
            let parallel = ParallelArgs::new(rank, world_size, group)?;
            workers.push(Worker::new(parallel, device.clone()));
        }

        Ok(Self {
            workers,
            devices,
            options,
            registry,
            dtype: DType::F32,
            args: None,
            quant_args: QuantArgs::default(),
            tokenizer: None,
            block_manager: None,
            step_rng: StdRng::from_entropy(),
        })
    }

    /// Run the full initialization protocol: model, weights, cache.
    ///
    /// # Errors
    ///
    /// Init errors are fatal and surface unchanged.
    pub fn init(&mut self, loader: &ModelLoader) -> Result<()> {
        self.init_model(loader)?;
        self.init_kv_cache()
    }

    fn init_model(&mut self, loader: &ModelLoader) -> Result<()> {
        let entry = self.registry.lookup(loader.model_type())?.clone();
        let args = (entry.args_loader)(loader.config())?;
        let quant_args = (entry.quant_args_loader)(loader.config())?;
        self.dtype = parse_dtype(&args.dtype, &self.devices[0])?;
        info!(
            model_type = %args.model_type,
            dtype = ?self.dtype,
            n_layers = args.n_layers,
            "initializing model"
        );

        if let Some(tokenizer) = loader.tokenizer() {
            let vocab = tokenizer.get_vocab_size(true);
            if vocab != args.vocab_size {
                warn!(
                    tokenizer_vocab = vocab,
                    model_vocab = args.vocab_size,
                    "vocab size mismatch between tokenizer and model"
                );
            }
            self.tokenizer = Some(tokenizer.clone());
        }

        if self.workers.len() == 1 {
            let worker = &self.workers[0];
            worker.init_model(self.dtype, args.clone(), quant_args.clone(), entry.factory)?;
            for i in 0..loader.num_shards() {
                let shard = loader.shard(i, &Device::Cpu)?;
                worker.load_state_dict(shard)?;
            }
            worker.verify_loaded_weights()?;
        } else {
            let futures: Vec<_> = self
                .workers
                .iter()
                .map(|w| {
                    w.init_model_async(self.dtype, args.clone(), quant_args.clone(), entry.factory)
                })
                .collect();
            for future in futures {
                future.wait()?;
            }

            for i in 0..loader.num_shards() {
                let shard = loader.shard(i, &Device::Cpu)?;
                let futures: Vec<_> = self
                    .workers
                    .iter()
                    .map(|w| w.load_state_dict_async(shard.clone()))
                    .collect();
                for future in futures {
                    future.wait()?;
                }
            }

            let futures: Vec<_> = self
                .workers
                .iter()
                .map(Worker::verify_loaded_weights_async)
                .collect();
            for future in futures {
                future.wait()?;
            }
        }

        self.quant_args = quant_args;
        self.args = Some(args);
        Ok(())
    }

    fn init_kv_cache(&mut self) -> Result<()> {
        let args = self
            .args
            .as_ref()
            .ok_or_else(|| Error::Config("init_kv_cache before init_model".to_string()))?;
        let world_size = self.workers.len();
        let n_kv_heads = args.n_kv_heads();
        if n_kv_heads % world_size != 0 {
            return Err(Error::Config(format!(
                "{n_kv_heads} kv heads not divisible across {world_size} ranks"
            )));
        }
        let n_local_kv_heads = n_kv_heads / world_size;
        let head_dim = args.head_dim();
        let block_size = self.options.block_size;
        let block_bytes = block_size_in_bytes(
            block_size,
            n_local_kv_heads,
            head_dim,
            args.n_layers,
            self.dtype,
        );
        info!(
            block_size,
            block_bytes,
            n_local_kv_heads,
            head_dim,
            "sizing kv cache"
        );

        let device = &self.devices[0];
        let max_cache_size = if device.is_cpu() {
            self.options.max_cache_size
        } else {
            device.synchronize()?;
            let (allocated, total) = memory::device_memory(device)?;
            info!(allocated, total, "device memory profile");
            let budget = (total as f64 * self.options.memory_utilization) as i64
                - allocated as i64;
            if budget <= 0 {
                return Err(Error::OutOfMemory);
            }
            (budget as usize).min(self.options.max_cache_size)
        };

        let num_blocks = max_cache_size / block_bytes;
        if num_blocks == 0 {
            return Err(Error::OutOfMemory);
        }
        let shape = KvCacheShape::new(num_blocks, block_size, n_local_kv_heads, head_dim, self.dtype)?;
        info!(
            num_blocks,
            key_shape = ?shape.key_shape(),
            value_shape = ?shape.value_shape(),
            "initializing kv cache"
        );

        self.block_manager = Some(BlockManager::new(num_blocks, block_size));

        if self.workers.len() == 1 {
            self.workers[0].init_kv_cache(shape)?;
        } else {
            let futures: Vec<_> = self
                .workers
                .iter()
                .map(|w| w.init_kv_cache_async(shape))
                .collect();
            for future in futures {
                future.wait()?;
            }
        }
        Ok(())
    }

    /// Run one forward-and-sample step over `batch`.
    ///
    /// Sequences that cannot get blocks are ejected (not an error); the
    /// returned tokens line up with the surviving sequences in the caller's
    /// order.
    ///
    /// # Errors
    ///
    /// Worker failures are fatal and surface unchanged.
    pub fn execute_model(&mut self, batch: &mut [Sequence]) -> Result<StepOutput> {
        if batch.is_empty() {
            return Ok(StepOutput::default());
        }
        let block_manager = self
            .block_manager
            .as_mut()
            .ok_or_else(|| Error::Config("execute_model before init".to_string()))?;

        let seed: u64 = self.step_rng.gen();
        let packed = prepare_inputs(batch, block_manager, seed, &Device::Cpu)?;
        if packed.num_seqs == 0 {
            return Ok(StepOutput {
                next_tokens: Vec::new(),
                ejected: packed.ejected,
            });
        }

        let mut output = if self.workers.len() == 1 {
            self.workers[0].execute_model(
                packed.token_ids,
                packed.positions,
                packed.input_params,
                packed.sampling_params,
            )?
        } else {
            let futures: Vec<_> = self
                .workers
                .iter()
                .map(|w| {
                    w.execute_model_async(
                        packed.token_ids.clone(),
                        packed.positions.clone(),
                        packed.input_params.clone(),
                        packed.sampling_params.clone(),
                    )
                })
                .collect();
            let mut outputs: Vec<OutputParameters> = Vec::with_capacity(futures.len());
            for future in futures {
                outputs.push(future.wait()?);
            }
            // Every rank sampled from the same reduced logits with the same
            // seed; rank 0's output is the canonical one.
            outputs.swap_remove(0)
        };

        output.index_select(&packed.seq_indices);
        Ok(StepOutput {
            next_tokens: output.next_tokens,
            ejected: packed.ejected,
        })
    }

    /// The resolved model arguments (after init).
    pub fn model_args(&self) -> Option<&ModelArgs> {
        self.args.as_ref()
    }

    /// The resolved quantization arguments (after init).
    pub fn quant_args(&self) -> &QuantArgs {
        &self.quant_args
    }

    /// The model's EOS token id (after init).
    pub fn eos_token_id(&self) -> u32 {
        self.args.as_ref().map_or(0, |a| a.eos_token_id)
    }

    /// The tokenizer, if the checkpoint shipped one.
    pub fn tokenizer(&self) -> Option<&Tokenizer> {
        self.tokenizer.as_ref()
    }

    /// The compute dtype (after init).
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Number of workers.
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// The block manager (after init).
    pub fn block_manager(&self) -> Option<&BlockManager> {
        self.block_manager.as_ref()
    }

    /// Mutable access to the block manager (after init).
    pub fn block_manager_mut(&mut self) -> Option<&mut BlockManager> {
        self.block_manager.as_mut()
    }

    /// Encode `text` with the checkpoint's tokenizer.
    ///
    /// # Errors
    ///
    /// Fails if no tokenizer is available or encoding fails.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let tokenizer = self
            .tokenizer
            .as_ref()
            .ok_or_else(|| Error::Tokenization("no tokenizer loaded".to_string()))?;
        let encoding = tokenizer
            .encode(text, false)
            .map_err(|e| Error::Tokenization(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Decode token ids with the checkpoint's tokenizer.
    ///
    /// # Errors
    ///
    /// Fails if no tokenizer is available or decoding fails.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        let tokenizer = self
            .tokenizer
            .as_ref()
            .ok_or_else(|| Error::Tokenization("no tokenizer loaded".to_string()))?;
        tokenizer
            .decode(ids, true)
            .map_err(|e| Error::Tokenization(e.to_string()))
    }
}
