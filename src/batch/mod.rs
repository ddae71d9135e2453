//! Batch packing for heterogeneous prefill/decode forward passes.

pub mod input_params;
pub mod packer;

pub use input_params::{InputParameters, OutputParameters, SamplingParameters};
pub use packer::{prepare_inputs, PackedBatch};
