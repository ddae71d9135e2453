//! Engine configuration and dtype resolution.

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const GIB: usize = 1024 * 1024 * 1024;

/// Block sizes the cache layout supports.
pub const SUPPORTED_BLOCK_SIZES: [usize; 3] = [8, 16, 32];

/// Process-wide engine options, set once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineOptions {
    /// Slots per cache block. Must be one of 8, 16, 32.
    pub block_size: usize,
    /// Hard byte cap on the KV cache.
    pub max_cache_size: usize,
    /// Fraction of device memory the cache may use.
    pub memory_utilization: f64,
    /// Fall back to generic kernels instead of fused ones.
    pub disable_custom_kernels: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            block_size: 16,
            max_cache_size: 5 * GIB,
            memory_utilization: 0.9,
            disable_custom_kernels: false,
        }
    }
}

impl EngineOptions {
    /// Validate the option set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a block size outside {8, 16, 32} or a
    /// memory utilization outside (0, 1].
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_BLOCK_SIZES.contains(&self.block_size) {
            return Err(Error::Config(format!(
                "block_size must be one of {SUPPORTED_BLOCK_SIZES:?}, got {}",
                self.block_size
            )));
        }
        if self.memory_utilization <= 0.0 || self.memory_utilization > 1.0 {
            return Err(Error::Config(format!(
                "memory_utilization must be in (0, 1], got {}",
                self.memory_utilization
            )));
        }
        Ok(())
    }
}

/// Resolve the compute dtype from the checkpoint's dtype hint.
///
/// Recognized strings (case-insensitive): `half`/`float16`, `bfloat16`,
/// `float`/`float32`, and empty/`auto` which defaults to f16. Anything else
/// fails initialization. CPU devices always compute in f32 regardless of the
/// hint.
///
/// # Errors
///
/// Returns [`Error::Config`] for an unrecognized dtype string.
pub fn parse_dtype(dtype_str: &str, device: &Device) -> Result<DType> {
    if device.is_cpu() {
        return Ok(DType::F32);
    }

    match dtype_str.to_ascii_lowercase().as_str() {
        "half" | "float16" => Ok(DType::F16),
        "bfloat16" => Ok(DType::BF16),
        "float" | "float32" => Ok(DType::F32),
        "" | "auto" => Ok(DType::F16),
        other => Err(Error::Config(format!(
            "unsupported dtype: {other} on device {device:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = EngineOptions::default();
        assert_eq!(options.block_size, 16);
        assert_eq!(options.max_cache_size, 5 * GIB);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_invalid_block_size() {
        let options = EngineOptions {
            block_size: 24,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_parse_dtype_cpu_forces_f32() {
        let device = Device::Cpu;
        assert_eq!(parse_dtype("bfloat16", &device).unwrap(), DType::F32);
        assert_eq!(parse_dtype("garbage", &device).unwrap(), DType::F32);
    }
}
