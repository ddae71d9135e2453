//! Engine coordination: initialization, per-step dispatch, sampling.

pub mod llm;
pub mod memory;
pub mod sampler;

pub use llm::{Engine, StepOutput};
