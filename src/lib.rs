//! pagedserve: the serving core of a batched, paged-attention LLM
//! inference engine.
//!
//! The crate divides a bounded pool of device memory into fixed-size KV
//! cache blocks, assigns blocks to in-flight sequences, packs heterogeneous
//! prefill and decode sequences into a single forward pass, fans that pass
//! across tensor-parallel workers, and gathers sampled tokens back in
//! request order.
//!
//! Component map, leaves first:
//! - [`core`]: block manager, sequence state, KV cache tensors
//! - [`batch`]: the batch packer and its tensor bundles
//! - [`model`]: the family registry and the shared decoder stack
//! - [`parallel`]: rank descriptors and the collective seam
//! - [`worker`]: one executor thread per device
//! - [`engine`]: initialization protocol and step dispatch
//! - [`scheduler`]: continuous batching over the step loop

pub mod batch;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod model;
pub mod parallel;
pub mod scheduler;
pub mod worker;

pub use batch::{InputParameters, OutputParameters, SamplingParameters};
pub use config::EngineOptions;
pub use crate::core::{
    BlockManager, FinishReason, SamplingParams, Sequence, SequenceId, SequencePhase,
};
pub use engine::{Engine, StepOutput};
pub use error::{Error, Result};
pub use model::{CausalLM, ModelLoader, ModelRegistry};
pub use scheduler::{FinishedOutput, Scheduler, SchedulerConfig};
pub use worker::Worker;
