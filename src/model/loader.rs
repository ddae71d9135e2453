//! Checkpoint discovery: config, tokenizer, and weight shards.
//!
//! A model directory is expected to hold a `config.json` with a
//! `model_type`, optionally a `tokenizer.json`, and one or more
//! `*.safetensors` shards. Shards are loaded lazily so a multi-file
//! checkpoint streams through memory one shard at a time.

use std::path::{Path, PathBuf};

use candle_core::Device;
use serde_json::Value;
use tokenizers::Tokenizer;

use crate::error::{Error, Result};
use crate::model::state_dict::StateDict;

/// Locates and loads the pieces of a checkpoint directory.
pub struct ModelLoader {
    model_type: String,
    config: Value,
    tokenizer: Option<Tokenizer>,
    shard_paths: Vec<PathBuf>,
    preloaded: Vec<StateDict>,
}

impl ModelLoader {
    /// Scan `dir` for `config.json`, `tokenizer.json`, and weight shards.
    ///
    /// # Errors
    ///
    /// Fails if the config is missing or carries no `model_type`, or if no
    /// weight shard is present.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let config_path = dir.join("config.json");
        let config: Value = serde_json::from_str(&std::fs::read_to_string(&config_path)?)?;
        let model_type = config
            .get("model_type")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::Config(format!("no model_type in {}", config_path.display()))
            })?
            .to_string();

        let tokenizer_path = dir.join("tokenizer.json");
        let tokenizer = if tokenizer_path.exists() {
            Some(
                Tokenizer::from_file(&tokenizer_path)
                    .map_err(|e| Error::Tokenization(e.to_string()))?,
            )
        } else {
            None
        };

        let mut shard_paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "safetensors"))
            .collect();
        shard_paths.sort();
        if shard_paths.is_empty() {
            return Err(Error::Config(format!(
                "no safetensors shards in {}",
                dir.display()
            )));
        }

        Ok(Self {
            model_type,
            config,
            tokenizer,
            shard_paths,
            preloaded: Vec::new(),
        })
    }

    /// Build a loader from in-memory parts (no filesystem access).
    pub fn from_parts(config: Value, shards: Vec<StateDict>) -> Result<Self> {
        let model_type = config
            .get("model_type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Config("no model_type in config".to_string()))?
            .to_string();
        Ok(Self {
            model_type,
            config,
            tokenizer: None,
            shard_paths: Vec::new(),
            preloaded: shards,
        })
    }

    /// Attach a tokenizer (used with [`ModelLoader::from_parts`]).
    pub fn with_tokenizer(mut self, tokenizer: Tokenizer) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    /// The checkpoint's `model_type`.
    pub fn model_type(&self) -> &str {
        &self.model_type
    }

    /// The raw configuration object.
    pub fn config(&self) -> &Value {
        &self.config
    }

    /// The tokenizer, if the checkpoint ships one.
    pub fn tokenizer(&self) -> Option<&Tokenizer> {
        self.tokenizer.as_ref()
    }

    /// Number of weight shards.
    pub fn num_shards(&self) -> usize {
        if self.preloaded.is_empty() {
            self.shard_paths.len()
        } else {
            self.preloaded.len()
        }
    }

    /// Load shard `index` onto `device`.
    ///
    /// # Errors
    ///
    /// Fails if the index is out of range or the shard cannot be read.
    pub fn shard(&self, index: usize, device: &Device) -> Result<StateDict> {
        if !self.preloaded.is_empty() {
            return self
                .preloaded
                .get(index)
                .cloned()
                .ok_or_else(|| Error::Config(format!("shard index {index} out of range")));
        }
        let path = self
            .shard_paths
            .get(index)
            .ok_or_else(|| Error::Config(format!("shard index {index} out of range")))?;
        StateDict::from_safetensors(path, device)
    }
}
