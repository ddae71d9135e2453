//! Checkpoint shards as name-to-tensor maps.
//!
//! A checkpoint arrives as one or more shards; each shard maps parameter
//! names to tensors. Layers pull their weights out of a shard by name,
//! possibly through a prefix-scoped view, and may be fed several shards
//! before every parameter is written.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};

use crate::error::Result;

/// One checkpoint shard: a mapping from parameter name to tensor.
#[derive(Debug, Clone, Default)]
pub struct StateDict {
    tensors: HashMap<String, Tensor>,
}

impl StateDict {
    /// Load a shard from a safetensors file.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or parsed.
    pub fn from_safetensors(path: &Path, device: &Device) -> Result<Self> {
        let tensors = candle_core::safetensors::load(path, device)?;
        Ok(Self { tensors })
    }

    /// Build a shard from an in-memory tensor map.
    pub fn from_tensors(tensors: HashMap<String, Tensor>) -> Self {
        Self { tensors }
    }

    /// View the entries under `prefix`, with the prefix stripped.
    ///
    /// Tensor clones are shallow, so this is cheap.
    pub fn select(&self, prefix: &str) -> StateDict {
        let tensors = self
            .tensors
            .iter()
            .filter_map(|(name, tensor)| {
                name.strip_prefix(prefix)
                    .map(|rest| (rest.to_string(), tensor.clone()))
            })
            .collect();
        Self { tensors }
    }

    /// Look up a tensor by name.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Number of entries in the shard.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Check if the shard is empty.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Iterate over parameter names.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.tensors.keys()
    }

    /// Move every tensor to `device`, converting floating-point entries to
    /// `dtype`. Integer tensors keep their dtype.
    ///
    /// # Errors
    ///
    /// Fails if a transfer or conversion fails.
    pub fn prepare(&self, device: &Device, dtype: candle_core::DType) -> Result<StateDict> {
        let mut tensors = HashMap::with_capacity(self.tensors.len());
        for (name, tensor) in &self.tensors {
            let tensor = tensor.to_device(device)?;
            let tensor = match tensor.dtype() {
                candle_core::DType::F16 | candle_core::DType::BF16 | candle_core::DType::F32
                | candle_core::DType::F64 => tensor.to_dtype(dtype)?,
                _ => tensor,
            };
            tensors.insert(name.clone(), tensor);
        }
        Ok(StateDict { tensors })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn test_select_strips_prefix() {
        let device = Device::Cpu;
        let mut map = HashMap::new();
        map.insert(
            "model.layers.0.q_proj.weight".to_string(),
            Tensor::zeros((2, 2), DType::F32, &device).unwrap(),
        );
        map.insert(
            "model.norm.weight".to_string(),
            Tensor::zeros(2, DType::F32, &device).unwrap(),
        );
        let sd = StateDict::from_tensors(map);

        let layer = sd.select("model.layers.0.");
        assert_eq!(layer.len(), 1);
        assert!(layer.get("q_proj.weight").is_some());
        assert!(sd.select("model.layers.1.").is_empty());
    }
}
