//! Host-emulated device: buffers live in a process-local arena and device
//! programs run on the calling thread (pixel loops fan out over rayon).

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::debug;

use pixopt_core::context::{
    AnalysisProgram, DeviceBackend, DeviceHandle, DeviceInfo, DeviceProgram, KernelOutput,
    Residency,
};
use pixopt_core::error::{OptimizerError, Result};

pub const BACKEND_NAME: &str = "host";

struct Allocation {
    bytes: Vec<u8>,
    residency: Residency,
}

pub struct HostDevice {
    arena: Mutex<HashMap<u64, Allocation>>,
    next_handle: AtomicU64,
    running: AtomicBool,
}

impl HostDevice {
    pub fn new() -> Self {
        Self {
            arena: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            running: AtomicBool::new(false),
        }
    }

    fn info() -> DeviceInfo {
        let threads = std::thread::available_parallelism().map_or(1, |n| n.get());
        DeviceInfo {
            ordinal: 0,
            name: format!("Host emulated device ({threads} threads)"),
            compute_units: threads as u32,
            clock_mhz: 0,
            memory_bytes: 0,
            supports_fp16: false,
            supports_int8: true,
            vendor: "host".into(),
            driver_version: env!("CARGO_PKG_VERSION").into(),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(OptimizerError::Device("host device is not running".into()))
        }
    }

    fn insert(&self, bytes: Vec<u8>, residency: Residency) -> Result<DeviceHandle> {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.arena
            .lock()?
            .insert(id, Allocation { bytes, residency });
        Ok(DeviceHandle(id))
    }

    /// Number of live allocations in the arena.
    pub fn live_allocations(&self) -> usize {
        self.arena.lock().map_or(0, |a| a.len())
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn unknown(handle: DeviceHandle) -> OptimizerError {
    OptimizerError::InvalidParam(format!("unknown device handle {}", handle.0))
}

impl DeviceBackend for HostDevice {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn initialize(&self) -> Result<()> {
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        if let Ok(mut arena) = self.arena.lock() {
            if !arena.is_empty() {
                debug!(leaked = arena.len(), "Host arena released outstanding buffers");
            }
            arena.clear();
        }
    }

    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(vec![Self::info()])
    }

    fn select_device(&self, ordinal: usize) -> Result<()> {
        if ordinal == 0 {
            Ok(())
        } else {
            Err(OptimizerError::InvalidParam(format!(
                "host backend has a single device, got ordinal {ordinal}"
            )))
        }
    }

    fn active_device(&self) -> usize {
        0
    }

    fn allocate(&self, size: usize, residency: Residency) -> Result<DeviceHandle> {
        self.ensure_running()?;
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(size)
            .map_err(|e| OptimizerError::Memory {
                bytes: size,
                reason: e.to_string(),
            })?;
        bytes.resize(size, 0);
        self.insert(bytes, residency)
    }

    fn free(&self, handle: DeviceHandle) -> Result<()> {
        match self.arena.lock()?.remove(&handle.0) {
            Some(_) => Ok(()),
            // Shutdown already released the arena.
            None if !self.running.load(Ordering::Acquire) => Ok(()),
            None => Err(unknown(handle)),
        }
    }

    fn upload(&self, dst: DeviceHandle, src: &[u8]) -> Result<()> {
        self.ensure_running()?;
        let mut arena = self.arena.lock()?;
        let alloc = arena.get_mut(&dst.0).ok_or_else(|| unknown(dst))?;
        alloc.bytes[..src.len()].copy_from_slice(src);
        Ok(())
    }

    fn download(&self, src: DeviceHandle, dst: &mut [u8]) -> Result<()> {
        self.ensure_running()?;
        let arena = self.arena.lock()?;
        let alloc = arena.get(&src.0).ok_or_else(|| unknown(src))?;
        let len = dst.len();
        dst.copy_from_slice(&alloc.bytes[..len]);
        Ok(())
    }

    fn execute(
        &self,
        kernel: &'static str,
        inputs: &[(DeviceHandle, usize)],
        program: DeviceProgram<'_>,
    ) -> Result<KernelOutput> {
        self.ensure_running()?;
        let output = {
            let arena = self.arena.lock()?;
            let mut views = Vec::with_capacity(inputs.len());
            for (handle, size) in inputs {
                let alloc = arena.get(&handle.0).ok_or_else(|| unknown(*handle))?;
                views.push(&alloc.bytes[..*size]);
            }
            program(&views)?
        };
        if output.is_empty() {
            return Err(OptimizerError::kernel(kernel, "program produced no output"));
        }
        let size = output.len();
        let handle = self.insert(output, Residency::Device)?;
        debug!(kernel, size, "Host kernel complete");
        Ok(KernelOutput { handle, size })
    }

    fn analyze(
        &self,
        _kernel: &'static str,
        input: (DeviceHandle, usize),
        program: AnalysisProgram<'_>,
    ) -> Result<()> {
        self.ensure_running()?;
        let arena = self.arena.lock()?;
        let alloc = arena.get(&input.0.0).ok_or_else(|| unknown(input.0))?;
        program(&alloc.bytes[..input.1])
    }
}

impl HostDevice {
    /// Residency recorded for a live handle.
    pub fn residency_of(&self, handle: DeviceHandle) -> Option<Residency> {
        self.arena
            .lock()
            .ok()
            .and_then(|a| a.get(&handle.0).map(|alloc| alloc.residency))
    }
}
