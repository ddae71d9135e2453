//! Device workers: one executor thread per accelerator, holding that
//! shard's model weights and KV cache.
//!
//! Every operation has a blocking variant and an async variant returning a
//! [`WorkerFuture`]; the blocking form is the single-worker specialization
//! that resolves the same future immediately. Operations are posted to the
//! executor thread as closures and run in submission order, so within one
//! worker there is never concurrency over the model or cache.
//!
//! Step failures are fatal: a forward error leaves the KV cache in an
//! unknown state, so the worker surfaces the error and the engine tears
//! down rather than retrying.

use std::sync::mpsc;
use std::thread;

use candle_core::{DType, Device, Tensor};
use tracing::debug;

use crate::batch::input_params::{InputParameters, OutputParameters, SamplingParameters};
use crate::core::kv_cache::{KvCache, KvCacheShape};
use crate::engine::sampler;
use crate::error::{Error, Result};
use crate::model::args::{ModelArgs, QuantArgs};
use crate::model::causal_lm::CausalLM;
use crate::model::registry::ModelFactory;
use crate::model::state_dict::StateDict;
use crate::parallel::ParallelArgs;

type Job = Box<dyn FnOnce(&mut WorkerState) + Send>;

/// Handle to a pending worker operation.
#[derive(Debug)]
pub struct WorkerFuture<T> {
    rx: mpsc::Receiver<Result<T>>,
}

impl<T> WorkerFuture<T> {
    /// Block until the operation completes.
    ///
    /// # Errors
    ///
    /// Returns the operation's error, or [`Error::Worker`] if the executor
    /// thread exited before replying.
    pub fn wait(self) -> Result<T> {
        self.rx
            .recv()
            .map_err(|_| Error::Worker("worker executor exited".to_string()))?
    }
}

// Everything the executor thread owns.
struct WorkerState {
    device: Device,
    parallel: ParallelArgs,
    dtype: DType,
    model: Option<CausalLM>,
    kv_caches: Vec<KvCache>,
    n_layers: usize,
}

impl WorkerState {
    fn model(&self) -> Result<&CausalLM> {
        self.model
            .as_ref()
            .ok_or_else(|| Error::Worker("model not initialized".to_string()))
    }
}

/// One worker bound to one device.
pub struct Worker {
    sender: Option<mpsc::Sender<Job>>,
    handle: Option<thread::JoinHandle<()>>,
    device: Device,
    rank: usize,
}

impl Worker {
    /// Spawn the executor thread for `device`.
    pub fn new(parallel: ParallelArgs, device: Device) -> Self {
        let rank = parallel.rank();
        let (tx, rx) = mpsc::channel::<Job>();
        let thread_device = device.clone();
        let handle = thread::Builder::new()
            .name(format!("worker-{rank}"))
            .spawn(move || {
                let mut state = WorkerState {
                    device: thread_device,
                    parallel,
                    dtype: DType::F32,
                    model: None,
                    kv_caches: Vec::new(),
                    n_layers: 0,
                };
                while let Ok(job) = rx.recv() {
                    job(&mut state);
                }
                debug!(rank, "worker executor exiting");
            })
            .expect("failed to spawn worker thread");
        Self {
            sender: Some(tx),
            handle: Some(handle),
            device,
            rank,
        }
    }

    /// The device this worker is bound to.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The worker's tensor-parallel rank.
    pub fn rank(&self) -> usize {
        self.rank
    }

    fn submit<T, F>(&self, op: F) -> WorkerFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut WorkerState) -> Result<T> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let job: Job = Box::new(move |state| {
            // The future may have been dropped; losing the reply is fine.
            let _ = tx.send(op(state));
        });
        if let Some(sender) = &self.sender {
            if sender.send(job).is_err() {
                // Executor gone; wait() will report it.
            }
        }
        WorkerFuture { rx }
    }

    /// Build the model graph on the device.
    pub fn init_model_async(
        &self,
        dtype: DType,
        args: ModelArgs,
        quant_args: QuantArgs,
        factory: ModelFactory,
    ) -> WorkerFuture<()> {
        self.submit(move |state| {
            state.dtype = dtype;
            state.n_layers = args.n_layers;
            let model = factory(&args, &quant_args, &state.parallel, dtype, &state.device)?;
            state.model = Some(model);
            debug!(rank = state.parallel.rank(), "model initialized");
            Ok(())
        })
    }

    /// Blocking variant of [`Worker::init_model_async`].
    pub fn init_model(
        &self,
        dtype: DType,
        args: ModelArgs,
        quant_args: QuantArgs,
        factory: ModelFactory,
    ) -> Result<()> {
        self.init_model_async(dtype, args, quant_args, factory).wait()
    }

    /// Stream one checkpoint shard into the model. May be called multiple
    /// times for multi-file checkpoints.
    pub fn load_state_dict_async(&self, state_dict: StateDict) -> WorkerFuture<()> {
        self.submit(move |state| {
            let prepared = state_dict.prepare(&state.device, state.dtype)?;
            state
                .model
                .as_mut()
                .ok_or_else(|| Error::Worker("model not initialized".to_string()))?
                .load_state_dict(&prepared)
        })
    }

    /// Blocking variant of [`Worker::load_state_dict_async`].
    pub fn load_state_dict(&self, state_dict: StateDict) -> Result<()> {
        self.load_state_dict_async(state_dict).wait()
    }

    /// Fail with the names of any parameters still unwritten.
    pub fn verify_loaded_weights_async(&self) -> WorkerFuture<()> {
        self.submit(|state| state.model()?.verify_loaded_weights())
    }

    /// Blocking variant of [`Worker::verify_loaded_weights_async`].
    pub fn verify_loaded_weights(&self) -> Result<()> {
        self.verify_loaded_weights_async().wait()
    }

    /// Allocate this shard's KV tensors, one pair per layer.
    pub fn init_kv_cache_async(&self, shape: KvCacheShape) -> WorkerFuture<()> {
        self.submit(move |state| {
            let mut caches = Vec::with_capacity(state.n_layers);
            for _ in 0..state.n_layers {
                caches.push(KvCache::new(shape, state.dtype, &state.device)?);
            }
            state.kv_caches = caches;
            debug!(
                rank = state.parallel.rank(),
                num_blocks = shape.num_blocks,
                "kv cache initialized"
            );
            Ok(())
        })
    }

    /// Blocking variant of [`Worker::init_kv_cache_async`].
    pub fn init_kv_cache(&self, shape: KvCacheShape) -> Result<()> {
        self.init_kv_cache_async(shape).wait()
    }

    /// One forward pass followed by sampling.
    ///
    /// The step seed travels through the process group from rank 0, so
    /// every rank's sampler draws identically.
    pub fn execute_model_async(
        &self,
        token_ids: Tensor,
        positions: Tensor,
        input_params: InputParameters,
        sampling_params: SamplingParameters,
    ) -> WorkerFuture<OutputParameters> {
        self.submit(move |state| {
            let token_ids = token_ids.to_device(&state.device)?;
            let positions = positions.to_device(&state.device)?;
            let input_params = input_params.to_device(&state.device)?;

            let mut sampling_params = sampling_params;
            if let Some(group) = state.parallel.process_group() {
                sampling_params.seed = group.broadcast_u64(sampling_params.seed, 0)?;
            }

            let model = state
                .model
                .as_ref()
                .ok_or_else(|| Error::Worker("model not initialized".to_string()))?;
            if state.kv_caches.is_empty() {
                return Err(Error::Worker("kv cache not initialized".to_string()));
            }
            let logits =
                model.forward(&token_ids, &positions, &mut state.kv_caches, &input_params)?;
            let next_tokens = sampler::sample(&logits, &sampling_params, &input_params)?;
            Ok(OutputParameters { next_tokens })
        })
    }

    /// Blocking variant of [`Worker::execute_model_async`].
    pub fn execute_model(
        &self,
        token_ids: Tensor,
        positions: Tensor,
        input_params: InputParameters,
        sampling_params: SamplingParameters,
    ) -> Result<OutputParameters> {
        self.execute_model_async(token_ids, positions, input_params, sampling_params)
            .wait()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // Closing the channel stops the executor loop.
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
