//! Model families, their layers, and checkpoint plumbing.

pub mod args;
pub mod attention;
pub mod causal_lm;
pub mod decoder;
pub mod layers;
pub mod loader;
pub mod registry;
pub mod state_dict;

pub use args::{ModelArgs, QuantArgs};
pub use attention::{PagedAttention, PosEncoding, QkvLayout, RotaryEmbedding};
pub use causal_lm::CausalLM;
pub use loader::ModelLoader;
pub use registry::{ModelEntry, ModelFactory, ModelRegistry};
pub use state_dict::StateDict;
