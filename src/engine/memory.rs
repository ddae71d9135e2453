//! Device memory measurement for cache sizing.

use candle_core::Device;

use crate::error::{Error, Result};

/// Measure `(allocated, total)` bytes on an accelerator device.
///
/// # Errors
///
/// Fails on CPU devices (the cache budget there is the configured cap) and
/// when built without accelerator support.
#[cfg(feature = "cuda")]
pub fn device_memory(device: &Device) -> Result<(usize, usize)> {
    use candle_core::cuda_backend::cudarc::driver::result::mem_get_info;

    match device {
        Device::Cuda(_) => {
            let (free, total) =
                mem_get_info().map_err(|e| Error::Worker(format!("mem_get_info: {e}")))?;
            Ok((total - free, total))
        }
        _ => Err(Error::Config(
            "device memory profiling is only available on accelerator devices".to_string(),
        )),
    }
}

/// Measure `(allocated, total)` bytes on an accelerator device.
///
/// # Errors
///
/// Always fails: this build has no accelerator backend.
#[cfg(not(feature = "cuda"))]
pub fn device_memory(_device: &Device) -> Result<(usize, usize)> {
    Err(Error::Config(
        "device memory profiling requires the cuda feature".to_string(),
    ))
}
