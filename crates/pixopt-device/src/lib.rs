#![doc = include_str!("../README.md")]

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use pixopt_core::context::{DeviceBackend, DeviceContext};
use pixopt_core::error::{OptimizerError, Result};

pub mod codec;
pub mod host;
pub mod kernels;
pub mod raster;

#[cfg(feature = "cuda-runtime")]
pub mod cuda;
#[cfg(not(feature = "cuda-runtime"))]
#[path = "cuda_stub.rs"]
pub mod cuda;

pub use host::HostDevice;
pub use kernels::Parallelism;

/// Whether this build links the CUDA driver backend.
pub const CUDA_RUNTIME_ENABLED: bool = cfg!(feature = "cuda-runtime");

/// Which device backend to open.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    /// CUDA when a device is present, host emulation otherwise.
    #[default]
    Auto,
    Host,
    Cuda,
}

impl fmt::Display for BackendPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendPreference::Auto => "auto",
            BackendPreference::Host => "host",
            BackendPreference::Cuda => "cuda",
        })
    }
}

impl FromStr for BackendPreference {
    type Err = OptimizerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendPreference::Auto),
            "host" | "cpu" => Ok(BackendPreference::Host),
            "cuda" | "gpu" => Ok(BackendPreference::Cuda),
            _ => Err(OptimizerError::InvalidParam(format!(
                "unknown device backend `{s}`"
            ))),
        }
    }
}

/// True when the CUDA backend is linked and reports at least one device.
pub fn cuda_available() -> bool {
    cuda::CudaBackend::device_count().unwrap_or(0) > 0
}

/// Backend for `preference` without initializing it.
pub fn create_backend(preference: BackendPreference) -> Result<Box<dyn DeviceBackend>> {
    match preference {
        BackendPreference::Host => Ok(Box::new(HostDevice::new())),
        BackendPreference::Cuda => Ok(Box::new(cuda::CudaBackend::new()?)),
        BackendPreference::Auto => {
            if cuda_available() {
                Ok(Box::new(cuda::CudaBackend::new()?))
            } else {
                Ok(Box::new(HostDevice::new()))
            }
        }
    }
}

/// Initialized context for `backend`, with `ordinal` selected.
pub fn open_context(backend: Box<dyn DeviceBackend>, ordinal: usize) -> Result<Arc<DeviceContext>> {
    let ctx = DeviceContext::new(backend);
    ctx.initialize()?;
    if ordinal != ctx.active_device() {
        if let Err(e) = ctx.select_device(ordinal) {
            ctx.shutdown();
            return Err(e);
        }
    }
    info!(backend = ctx.backend_name(), ordinal, "Device context ready");
    Ok(ctx)
}

/// Open the preferred backend; `Auto` falls back to host emulation when
/// the CUDA context cannot be brought up.
pub fn open_preferred(preference: BackendPreference, ordinal: usize) -> Result<Arc<DeviceContext>> {
    match open_context(create_backend(preference)?, ordinal) {
        Ok(ctx) => Ok(ctx),
        Err(e) if preference == BackendPreference::Auto => {
            warn!(error = %e, "CUDA backend unavailable, using host emulation");
            open_context(Box::new(HostDevice::new()), 0)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_context_opens_without_cuda() {
        let ctx = open_preferred(BackendPreference::Host, 0).unwrap();
        assert_eq!(ctx.backend_name(), host::BACKEND_NAME);
        assert_eq!(ctx.devices().unwrap().len(), 1);
        ctx.shutdown();
    }

    #[test]
    fn host_context_rejects_missing_ordinal() {
        let err = open_preferred(BackendPreference::Host, 4).unwrap_err();
        assert_eq!(
            err.code(),
            pixopt_core::error::ErrorCode::InvalidParam
        );
    }

    #[test]
    fn preference_parses_aliases() {
        assert_eq!("CPU".parse::<BackendPreference>().unwrap(), BackendPreference::Host);
        assert!("metal".parse::<BackendPreference>().is_err());
    }
}
