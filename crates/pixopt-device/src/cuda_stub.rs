//! CUDA backend stand-in for builds without `cuda-runtime`.

use pixopt_core::context::{
    AnalysisProgram, DeviceBackend, DeviceHandle, DeviceInfo, DeviceProgram, KernelOutput,
    Residency,
};
use pixopt_core::error::{OptimizerError, Result};

pub const BACKEND_NAME: &str = "cuda";

fn runtime_disabled_err() -> OptimizerError {
    OptimizerError::Device(
        "CUDA backend unavailable: built without the `cuda-runtime` feature".into(),
    )
}

pub struct CudaBackend;

impl CudaBackend {
    pub fn new() -> Result<Self> {
        Err(runtime_disabled_err())
    }

    pub fn device_count() -> Result<usize> {
        Ok(0)
    }
}

impl DeviceBackend for CudaBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn initialize(&self) -> Result<()> {
        Err(runtime_disabled_err())
    }

    fn shutdown(&self) {}

    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(Vec::new())
    }

    fn select_device(&self, _ordinal: usize) -> Result<()> {
        Err(runtime_disabled_err())
    }

    fn active_device(&self) -> usize {
        0
    }

    fn allocate(&self, _size: usize, _residency: Residency) -> Result<DeviceHandle> {
        Err(runtime_disabled_err())
    }

    fn free(&self, _handle: DeviceHandle) -> Result<()> {
        Err(runtime_disabled_err())
    }

    fn upload(&self, _dst: DeviceHandle, _src: &[u8]) -> Result<()> {
        Err(runtime_disabled_err())
    }

    fn download(&self, _src: DeviceHandle, _dst: &mut [u8]) -> Result<()> {
        Err(runtime_disabled_err())
    }

    fn execute(
        &self,
        _kernel: &'static str,
        _inputs: &[(DeviceHandle, usize)],
        _program: DeviceProgram<'_>,
    ) -> Result<KernelOutput> {
        Err(runtime_disabled_err())
    }

    fn analyze(
        &self,
        _kernel: &'static str,
        _input: (DeviceHandle, usize),
        _program: AnalysisProgram<'_>,
    ) -> Result<()> {
        Err(runtime_disabled_err())
    }
}
