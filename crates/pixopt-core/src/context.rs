//! Device context: backend ownership, RAII device buffers, device-memory
//! accounting, bounds-checked transfers, and timing of the last operation.
//!
//! # Ownership
//!
//! Every allocation goes through [`DeviceContext::allocate`] or
//! [`DeviceContext::execute`] and comes back as a [`DeviceBuffer`] that
//! frees itself on drop. Allocation and free counters let tests assert
//! that every path, including failures, returns what it took.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{OptimizerError, Result};
use crate::types::{ColorSpace, ImageGeometry};

// ─── Backend contract ───────────────────────────────────────────────────────

/// Where a buffer lives. Backends without a distinction treat all three
/// the same.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Residency {
    Host,
    #[default]
    Device,
    Unified,
}

/// Static description of one compute device.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub ordinal: usize,
    pub name: String,
    pub compute_units: u32,
    pub clock_mhz: u32,
    pub memory_bytes: u64,
    pub supports_fp16: bool,
    pub supports_int8: bool,
    pub vendor: String,
    pub driver_version: String,
}

/// Opaque backend-side buffer id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u64);

/// Buffer produced by a device program.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelOutput {
    pub handle: DeviceHandle,
    pub size: usize,
}

/// Device program: reads the input buffers, returns the output contents.
pub type DeviceProgram<'a> = &'a mut dyn FnMut(&[&[u8]]) -> Result<Vec<u8>>;

/// Read-only device program over one buffer; results stay with the caller.
pub type AnalysisProgram<'a> = &'a mut dyn FnMut(&[u8]) -> Result<()>;

/// Pixel operation a backend may run with a kernel of its own instead of
/// the host program.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NativeOp {
    /// Resample of `from` to `width`x`height`.
    Resize {
        from: ImageGeometry,
        width: u32,
        height: u32,
    },
    /// Interleaved layout conversion of `from` to `to`.
    ColorConvert { from: ImageGeometry, to: ColorSpace },
}

impl NativeOp {
    pub fn input(&self) -> ImageGeometry {
        match *self {
            NativeOp::Resize { from, .. } | NativeOp::ColorConvert { from, .. } => from,
        }
    }

    pub fn output(&self) -> ImageGeometry {
        match *self {
            NativeOp::Resize {
                from,
                width,
                height,
            } => from.with_size(width, height),
            NativeOp::ColorConvert { from, to } => from.with_colorspace(to),
        }
    }
}

/// Compute backend behind a [`DeviceContext`].
///
/// Handles are only valid on the backend that issued them. `upload` and
/// `download` receive ranges already checked against the buffer size.
pub trait DeviceBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn initialize(&self) -> Result<()>;
    fn shutdown(&self);
    fn devices(&self) -> Result<Vec<DeviceInfo>>;
    fn select_device(&self, ordinal: usize) -> Result<()>;
    fn active_device(&self) -> usize;
    fn allocate(&self, size: usize, residency: Residency) -> Result<DeviceHandle>;
    fn free(&self, handle: DeviceHandle) -> Result<()>;
    fn upload(&self, dst: DeviceHandle, src: &[u8]) -> Result<()>;
    fn download(&self, src: DeviceHandle, dst: &mut [u8]) -> Result<()>;
    /// Run `program` over `inputs` and store its result in a fresh buffer.
    fn execute(
        &self,
        kernel: &'static str,
        inputs: &[(DeviceHandle, usize)],
        program: DeviceProgram<'_>,
    ) -> Result<KernelOutput>;
    /// Run a read-only program over `input`. Allocates nothing.
    fn analyze(
        &self,
        kernel: &'static str,
        input: (DeviceHandle, usize),
        program: AnalysisProgram<'_>,
    ) -> Result<()>;
    /// Run `op` with a native kernel. `Ok(None)` means there is none and the
    /// caller falls back to the host program through [`execute`](Self::execute).
    fn launch(
        &self,
        kernel: &'static str,
        op: &NativeOp,
        input: (DeviceHandle, usize),
    ) -> Result<Option<KernelOutput>> {
        let _ = (kernel, op, input);
        Ok(None)
    }
}

// ─── Memory accounting ──────────────────────────────────────────────────────

/// Atomic byte and allocation counters. Lock-free reads.
struct MemoryAccounting {
    current: AtomicUsize,
    peak: AtomicUsize,
    allocations: AtomicU64,
    frees: AtomicU64,
}

impl MemoryAccounting {
    const fn new() -> Self {
        Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
        }
    }

    #[inline]
    fn on_alloc(&self, bytes: usize) {
        let prev = self.current.fetch_add(bytes, Ordering::Relaxed);
        self.peak.fetch_max(prev + bytes, Ordering::Relaxed);
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn on_free(&self, bytes: usize) {
        self.current.fetch_sub(bytes, Ordering::Relaxed);
        self.frees.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn snapshot(&self) -> (usize, usize) {
        (
            self.current.load(Ordering::Relaxed),
            self.peak.load(Ordering::Relaxed),
        )
    }
}

/// Allocation/free totals since the context was created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocationCounts {
    pub allocations: u64,
    pub frees: u64,
}

impl AllocationCounts {
    #[inline]
    pub fn live(&self) -> u64 {
        self.allocations.saturating_sub(self.frees)
    }
}

// ─── Timing ─────────────────────────────────────────────────────────────────

/// Timing counters for the most recent kernel and transfer.
struct PerfProfiler {
    last_kernel_us: AtomicU64,
    last_transfer_us: AtomicU64,
    total_kernel_us: AtomicU64,
    total_transfer_us: AtomicU64,
    kernel_count: AtomicU64,
    transfer_count: AtomicU64,
}

impl PerfProfiler {
    const fn new() -> Self {
        Self {
            last_kernel_us: AtomicU64::new(0),
            last_transfer_us: AtomicU64::new(0),
            total_kernel_us: AtomicU64::new(0),
            total_transfer_us: AtomicU64::new(0),
            kernel_count: AtomicU64::new(0),
            transfer_count: AtomicU64::new(0),
        }
    }

    #[inline]
    fn record_kernel(&self, elapsed_us: u64) {
        self.last_kernel_us.store(elapsed_us, Ordering::Relaxed);
        self.total_kernel_us.fetch_add(elapsed_us, Ordering::Relaxed);
        self.kernel_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_transfer(&self, elapsed_us: u64) {
        self.last_transfer_us.store(elapsed_us, Ordering::Relaxed);
        self.total_transfer_us
            .fetch_add(elapsed_us, Ordering::Relaxed);
        self.transfer_count.fetch_add(1, Ordering::Relaxed);
    }

    fn report(&self) {
        info!(
            kernels = self.kernel_count.load(Ordering::Relaxed),
            kernel_total_us = self.total_kernel_us.load(Ordering::Relaxed),
            transfers = self.transfer_count.load(Ordering::Relaxed),
            transfer_total_us = self.total_transfer_us.load(Ordering::Relaxed),
            "Device profiler report"
        );
    }
}

/// Performance of the last operation on a context.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct PerformanceSnapshot {
    pub kernel_time_ms: f64,
    pub memory_transfer_time_ms: f64,
    pub memory_used: usize,
    pub memory_peak: usize,
    /// Share of the last kernel+transfer time spent in the kernel.
    pub gpu_utilization: f32,
    /// Current usage relative to the active device's memory.
    pub memory_utilization: f32,
}

// ─── Device context ─────────────────────────────────────────────────────────

/// Long-lived context owning one device backend.
pub struct DeviceContext {
    backend: Box<dyn DeviceBackend>,
    initialized: AtomicBool,
    memory: MemoryAccounting,
    profiler: PerfProfiler,
    device_memory_bytes: AtomicU64,
    memory_limit: AtomicUsize,
    strict_memory_limit: AtomicBool,
}

impl DeviceContext {
    /// Wrap a backend. The context is not initialized yet.
    pub fn new(backend: Box<dyn DeviceBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            initialized: AtomicBool::new(false),
            memory: MemoryAccounting::new(),
            profiler: PerfProfiler::new(),
            device_memory_bytes: AtomicU64::new(0),
            memory_limit: AtomicUsize::new(0),
            strict_memory_limit: AtomicBool::new(false),
        })
    }

    /// Initialize the backend. Repeated calls are no-ops.
    pub fn initialize(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        self.backend.initialize()?;
        let devices = match self.backend.devices() {
            Ok(devices) => devices,
            Err(e) => {
                self.backend.shutdown();
                return Err(e);
            }
        };
        let active = self.backend.active_device();
        let memory = devices
            .iter()
            .find(|d| d.ordinal == active)
            .map_or(0, |d| d.memory_bytes);
        self.device_memory_bytes.store(memory, Ordering::Relaxed);
        self.initialized.store(true, Ordering::Release);
        info!(
            backend = self.backend.name(),
            devices = devices.len(),
            active,
            "Device context initialized"
        );
        Ok(())
    }

    /// Shut the backend down. Repeated calls are no-ops.
    pub fn shutdown(&self) {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return;
        }
        let counts = self.allocation_counts();
        if counts.live() > 0 {
            warn!(
                backend = self.backend.name(),
                live = counts.live(),
                "Device context shut down with live buffers"
            );
        }
        self.profiler.report();
        self.backend.shutdown();
        debug!(backend = self.backend.name(), "Device context shut down");
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(OptimizerError::NotInitialized)
        }
    }

    #[inline]
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn devices(&self) -> Result<Vec<DeviceInfo>> {
        self.ensure_initialized()?;
        self.backend.devices()
    }

    /// Make `ordinal` the active device for subsequent work.
    pub fn select_device(&self, ordinal: usize) -> Result<()> {
        let devices = self.devices()?;
        let Some(info) = devices.iter().find(|d| d.ordinal == ordinal) else {
            return Err(OptimizerError::InvalidParam(format!(
                "device ordinal {ordinal} out of range ({} devices)",
                devices.len()
            )));
        };
        self.backend.select_device(ordinal)?;
        self.device_memory_bytes
            .store(info.memory_bytes, Ordering::Relaxed);
        info!(ordinal, device = %info.name, "Active device selected");
        Ok(())
    }

    pub fn active_device(&self) -> usize {
        self.backend.active_device()
    }

    /// Allocate `size` bytes. Zero-sized requests are rejected.
    pub fn allocate(self: &Arc<Self>, size: usize, residency: Residency) -> Result<DeviceBuffer> {
        self.ensure_initialized()?;
        if size == 0 {
            return Err(OptimizerError::InvalidParam(
                "zero-sized device allocation".into(),
            ));
        }
        self.check_limit(size)?;
        let handle = self.backend.allocate(size, residency)?;
        self.memory.on_alloc(size);
        Ok(DeviceBuffer {
            handle: Some(handle),
            size,
            residency,
            ctx: Arc::clone(self),
        })
    }

    /// Copy `src` into the start of `dst`. Overruns fail without copying.
    pub fn upload(&self, dst: &mut DeviceBuffer, src: &[u8]) -> Result<()> {
        self.ensure_initialized()?;
        let handle = self.live_handle(dst)?;
        if src.len() > dst.size {
            return Err(OptimizerError::TransferOutOfBounds {
                requested: src.len(),
                capacity: dst.size,
            });
        }
        let start = Instant::now();
        self.backend.upload(handle, src)?;
        self.profiler
            .record_transfer(start.elapsed().as_micros() as u64);
        Ok(())
    }

    /// Copy the start of `src` into `dst`. Overruns fail without copying.
    pub fn download(&self, src: &DeviceBuffer, dst: &mut [u8]) -> Result<()> {
        self.ensure_initialized()?;
        let handle = self.live_handle(src)?;
        if dst.len() > src.size {
            return Err(OptimizerError::TransferOutOfBounds {
                requested: dst.len(),
                capacity: src.size,
            });
        }
        let start = Instant::now();
        self.backend.download(handle, dst)?;
        self.profiler
            .record_transfer(start.elapsed().as_micros() as u64);
        Ok(())
    }

    /// Download a whole buffer into fresh host memory.
    pub fn download_to_vec(&self, src: &DeviceBuffer) -> Result<Vec<u8>> {
        let mut host = Vec::new();
        host.try_reserve_exact(src.size)
            .map_err(|e| OptimizerError::Memory {
                bytes: src.size,
                reason: e.to_string(),
            })?;
        host.resize(src.size, 0);
        self.download(src, &mut host)?;
        Ok(host)
    }

    /// Run a device program over `inputs`; the output is a new buffer.
    pub fn execute(
        self: &Arc<Self>,
        kernel: &'static str,
        inputs: &[&DeviceBuffer],
        program: DeviceProgram<'_>,
    ) -> Result<DeviceBuffer> {
        self.ensure_initialized()?;
        let handles = inputs
            .iter()
            .map(|buf| self.live_handle(buf).map(|h| (h, buf.size)))
            .collect::<Result<Vec<_>>>()?;
        let start = Instant::now();
        let out = self.backend.execute(kernel, &handles, program)?;
        self.profiler
            .record_kernel(start.elapsed().as_micros() as u64);
        self.adopt(kernel, out)
    }

    /// Run `op` natively when the backend can, otherwise run `program` over
    /// `input` like [`execute`](Self::execute).
    pub fn execute_native(
        self: &Arc<Self>,
        kernel: &'static str,
        op: NativeOp,
        input: &DeviceBuffer,
        program: DeviceProgram<'_>,
    ) -> Result<DeviceBuffer> {
        self.ensure_initialized()?;
        let handle = self.live_handle(input)?;
        let start = Instant::now();
        let out = match self.backend.launch(kernel, &op, (handle, input.size))? {
            Some(out) => out,
            None => self
                .backend
                .execute(kernel, &[(handle, input.size)], program)?,
        };
        self.profiler
            .record_kernel(start.elapsed().as_micros() as u64);
        self.adopt(kernel, out)
    }

    /// Take ownership of a kernel output, subject to the memory limit.
    fn adopt(self: &Arc<Self>, kernel: &'static str, out: KernelOutput) -> Result<DeviceBuffer> {
        if let Err(e) = self.check_limit(out.size) {
            if let Err(free_err) = self.backend.free(out.handle) {
                warn!(kernel, error = %free_err, "Failed to free rejected kernel output");
            }
            return Err(e);
        }
        self.memory.on_alloc(out.size);
        Ok(DeviceBuffer {
            handle: Some(out.handle),
            size: out.size,
            residency: Residency::Device,
            ctx: Arc::clone(self),
        })
    }

    /// Run a read-only program over `input` (detection, statistics).
    pub fn analyze(
        &self,
        kernel: &'static str,
        input: &DeviceBuffer,
        program: AnalysisProgram<'_>,
    ) -> Result<()> {
        self.ensure_initialized()?;
        let handle = self.live_handle(input)?;
        let start = Instant::now();
        self.backend.analyze(kernel, (handle, input.size), program)?;
        self.profiler
            .record_kernel(start.elapsed().as_micros() as u64);
        Ok(())
    }

    fn live_handle(&self, buf: &DeviceBuffer) -> Result<DeviceHandle> {
        if !std::ptr::eq(Arc::as_ptr(&buf.ctx), self) {
            return Err(OptimizerError::InvalidParam(
                "buffer belongs to a different device context".into(),
            ));
        }
        buf.handle
            .ok_or_else(|| OptimizerError::InvalidParam("buffer was already freed".into()))
    }

    fn check_limit(&self, requested: usize) -> Result<()> {
        let (current, _) = self.memory.snapshot();
        let limit = match self.memory_limit.load(Ordering::Relaxed) {
            0 => None,
            limit => Some(limit),
        };
        let strict = self.strict_memory_limit.load(Ordering::Relaxed);
        if check_memory_limit(strict, limit, current, requested)? {
            warn!(
                current_bytes = current,
                requested_bytes = requested,
                limit_bytes = limit.unwrap_or(0),
                "Device memory would exceed configured limit; continuing because strict_memory_limit=false"
            );
        }
        Ok(())
    }

    fn release(&self, handle: DeviceHandle, size: usize) -> Result<()> {
        self.backend.free(handle)?;
        self.memory.on_free(size);
        Ok(())
    }

    // ─── Accounting ──

    /// Current and peak bytes held through this context.
    #[inline]
    pub fn memory_usage(&self) -> (usize, usize) {
        self.memory.snapshot()
    }

    pub fn allocation_counts(&self) -> AllocationCounts {
        AllocationCounts {
            allocations: self.memory.allocations.load(Ordering::Relaxed),
            frees: self.memory.frees.load(Ordering::Relaxed),
        }
    }

    /// Set a device memory cap in bytes. 0 = unlimited.
    pub fn set_memory_limit(&self, limit_bytes: usize) {
        self.memory_limit.store(limit_bytes, Ordering::Relaxed);
        info!(limit_mb = limit_bytes / (1024 * 1024), "Device memory limit set");
    }

    /// Fail allocations instead of warning when the limit would be exceeded.
    pub fn set_strict_memory_limit(&self, enabled: bool) {
        self.strict_memory_limit.store(enabled, Ordering::Relaxed);
    }

    pub fn performance(&self) -> PerformanceSnapshot {
        let kernel_us = self.profiler.last_kernel_us.load(Ordering::Relaxed);
        let transfer_us = self.profiler.last_transfer_us.load(Ordering::Relaxed);
        let (current, peak) = self.memory.snapshot();
        let busy = kernel_us + transfer_us;
        let device_bytes = self.device_memory_bytes.load(Ordering::Relaxed);
        PerformanceSnapshot {
            kernel_time_ms: kernel_us as f64 / 1000.0,
            memory_transfer_time_ms: transfer_us as f64 / 1000.0,
            memory_used: current,
            memory_peak: peak,
            gpu_utilization: if busy == 0 {
                0.0
            } else {
                kernel_us as f32 / busy as f32
            },
            memory_utilization: if device_bytes == 0 {
                0.0
            } else {
                (current as f64 / device_bytes as f64) as f32
            },
        }
    }
}

/// Returns `Ok(true)` when the limit would be exceeded in warn-only mode.
fn check_memory_limit(
    strict: bool,
    limit: Option<usize>,
    current: usize,
    requested: usize,
) -> Result<bool> {
    let Some(limit_bytes) = limit.filter(|limit| *limit > 0) else {
        return Ok(false);
    };

    let would_be = current.saturating_add(requested);
    if would_be <= limit_bytes {
        return Ok(false);
    }

    if strict {
        return Err(OptimizerError::MemoryLimitExceeded {
            limit_bytes,
            current_bytes: current,
            requested_bytes: requested,
            would_be_bytes: would_be,
        });
    }

    Ok(true)
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("backend", &self.backend_name())
            .field("device", &self.active_device())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

// ─── Device buffer ──────────────────────────────────────────────────────────

/// Exclusively owned device allocation. Freed on drop.
pub struct DeviceBuffer {
    handle: Option<DeviceHandle>,
    size: usize,
    residency: Residency,
    ctx: Arc<DeviceContext>,
}

impl DeviceBuffer {
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn residency(&self) -> Residency {
        self.residency
    }

    /// `None` once the buffer has been freed.
    #[inline]
    pub fn handle(&self) -> Option<DeviceHandle> {
        self.handle
    }

    #[inline]
    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    /// Release the allocation now. Later calls are no-ops.
    pub fn free(&mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => self.ctx.release(handle, self.size),
            None => Ok(()),
        }
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.free() {
            warn!(size = self.size, error = %e, "Device buffer free failed");
        }
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("residency", &self.residency)
            .field("backend", &self.ctx.backend_name())
            .finish()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct VecBackend {
        buffers: Mutex<HashMap<u64, Vec<u8>>>,
        next: AtomicU64,
        native: bool,
    }

    impl DeviceBackend for VecBackend {
        fn name(&self) -> &'static str {
            "vec"
        }
        fn initialize(&self) -> Result<()> {
            Ok(())
        }
        fn shutdown(&self) {}
        fn devices(&self) -> Result<Vec<DeviceInfo>> {
            Ok(vec![DeviceInfo {
                ordinal: 0,
                name: "vec".into(),
                compute_units: 1,
                clock_mhz: 0,
                memory_bytes: 1 << 20,
                supports_fp16: false,
                supports_int8: false,
                vendor: "test".into(),
                driver_version: "0".into(),
            }])
        }
        fn select_device(&self, _ordinal: usize) -> Result<()> {
            Ok(())
        }
        fn active_device(&self) -> usize {
            0
        }
        fn allocate(&self, size: usize, _residency: Residency) -> Result<DeviceHandle> {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            self.buffers.lock()?.insert(id, vec![0; size]);
            Ok(DeviceHandle(id))
        }
        fn free(&self, handle: DeviceHandle) -> Result<()> {
            self.buffers.lock()?.remove(&handle.0);
            Ok(())
        }
        fn upload(&self, dst: DeviceHandle, src: &[u8]) -> Result<()> {
            let mut map = self.buffers.lock()?;
            map.get_mut(&dst.0).unwrap()[..src.len()].copy_from_slice(src);
            Ok(())
        }
        fn download(&self, src: DeviceHandle, dst: &mut [u8]) -> Result<()> {
            let map = self.buffers.lock()?;
            let len = dst.len();
            dst.copy_from_slice(&map[&src.0][..len]);
            Ok(())
        }
        fn execute(
            &self,
            _kernel: &'static str,
            inputs: &[(DeviceHandle, usize)],
            program: DeviceProgram<'_>,
        ) -> Result<KernelOutput> {
            let mut map = self.buffers.lock()?;
            let out = {
                let slices: Vec<&[u8]> = inputs.iter().map(|(h, _)| map[&h.0].as_slice()).collect();
                program(&slices)?
            };
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            let size = out.len();
            map.insert(id, out);
            Ok(KernelOutput {
                handle: DeviceHandle(id),
                size,
            })
        }
        fn analyze(
            &self,
            _kernel: &'static str,
            input: (DeviceHandle, usize),
            program: AnalysisProgram<'_>,
        ) -> Result<()> {
            let map = self.buffers.lock()?;
            program(&map[&input.0.0][..input.1])
        }
        fn launch(
            &self,
            _kernel: &'static str,
            op: &NativeOp,
            _input: (DeviceHandle, usize),
        ) -> Result<Option<KernelOutput>> {
            if !self.native {
                return Ok(None);
            }
            let size = op.output().byte_size();
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            self.buffers.lock()?.insert(id, vec![0xAA; size]);
            Ok(Some(KernelOutput {
                handle: DeviceHandle(id),
                size,
            }))
        }
    }

    fn ctx() -> Arc<DeviceContext> {
        let ctx = DeviceContext::new(Box::new(VecBackend::default()));
        ctx.initialize().unwrap();
        ctx
    }

    #[test]
    fn uninitialized_context_rejects_allocation() {
        let ctx = DeviceContext::new(Box::new(VecBackend::default()));
        let err = ctx.allocate(16, Residency::Device).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParam);
    }

    #[test]
    fn debug_names_backend_and_device() {
        let ctx = ctx();
        let text = format!("{ctx:?}");
        assert!(text.contains("\"vec\""));
        assert!(text.contains("device: 0"));
        assert!(text.contains("initialized: true"));
    }

    #[test]
    fn drop_frees_and_counts_balance() {
        let ctx = ctx();
        {
            let _a = ctx.allocate(64, Residency::Device).unwrap();
            let _b = ctx.allocate(32, Residency::Host).unwrap();
            assert_eq!(ctx.memory_usage(), (96, 96));
        }
        let counts = ctx.allocation_counts();
        assert_eq!(counts.allocations, 2);
        assert_eq!(counts.live(), 0);
        assert_eq!(ctx.memory_usage().0, 0);
    }

    #[test]
    fn explicit_free_is_idempotent() {
        let ctx = ctx();
        let mut buf = ctx.allocate(8, Residency::Device).unwrap();
        buf.free().unwrap();
        assert!(buf.handle().is_none());
        buf.free().unwrap();
        drop(buf);
        assert_eq!(ctx.allocation_counts().frees, 1);
    }

    #[test]
    fn overrun_fails_without_partial_copy() {
        let ctx = ctx();
        let mut buf = ctx.allocate(4, Residency::Device).unwrap();
        ctx.upload(&mut buf, &[1, 2, 3, 4]).unwrap();
        let err = ctx.upload(&mut buf, &[9; 5]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParam);
        assert_eq!(ctx.download_to_vec(&buf).unwrap(), vec![1, 2, 3, 4]);

        let mut too_big = [0u8; 8];
        assert!(ctx.download(&buf, &mut too_big).is_err());
        assert_eq!(too_big, [0u8; 8]);
    }

    #[test]
    fn upload_to_freed_buffer_is_rejected() {
        let ctx = ctx();
        let mut buf = ctx.allocate(4, Residency::Device).unwrap();
        buf.free().unwrap();
        assert!(ctx.upload(&mut buf, &[1]).is_err());
    }

    #[test]
    fn execute_output_is_accounted() {
        let ctx = ctx();
        let mut input = ctx.allocate(3, Residency::Device).unwrap();
        ctx.upload(&mut input, &[1, 2, 3]).unwrap();
        let out = ctx
            .execute("double", &[&input], &mut |bufs| {
                Ok(bufs[0].iter().map(|v| v * 2).collect())
            })
            .unwrap();
        assert_eq!(ctx.download_to_vec(&out).unwrap(), vec![2, 4, 6]);
        assert_eq!(ctx.allocation_counts().live(), 2);
        drop(out);
        drop(input);
        assert_eq!(ctx.allocation_counts().live(), 0);
    }

    #[test]
    fn native_launch_falls_back_to_program() {
        let ctx = ctx();
        let mut input = ctx.allocate(3, Residency::Device).unwrap();
        ctx.upload(&mut input, &[10, 20, 30]).unwrap();
        let op = NativeOp::ColorConvert {
            from: ImageGeometry::new(1, 1, ColorSpace::Rgb),
            to: ColorSpace::Rgba,
        };
        let out = ctx
            .execute_native("color_convert", op, &input, &mut |bufs| {
                let mut px = bufs[0].to_vec();
                px.push(255);
                Ok(px)
            })
            .unwrap();
        assert_eq!(ctx.download_to_vec(&out).unwrap(), vec![10, 20, 30, 255]);
        assert_eq!(ctx.allocation_counts().live(), 2);
    }

    #[test]
    fn native_launch_skips_program() {
        let ctx = DeviceContext::new(Box::new(VecBackend {
            native: true,
            ..VecBackend::default()
        }));
        ctx.initialize().unwrap();
        let input = ctx.allocate(2 * 2 * 4, Residency::Device).unwrap();
        let op = NativeOp::Resize {
            from: ImageGeometry::new(2, 2, ColorSpace::Rgba),
            width: 3,
            height: 1,
        };
        assert_eq!(op.input().byte_size(), input.size());
        let out = ctx
            .execute_native("resize", op, &input, &mut |_| {
                panic!("program must not run when the backend has a kernel")
            })
            .unwrap();
        assert_eq!(out.size(), 12);
        assert_eq!(ctx.download_to_vec(&out).unwrap(), vec![0xAA; 12]);
        drop(out);
        drop(input);
        let counts = ctx.allocation_counts();
        assert_eq!(counts.allocations, counts.frees);
    }

    #[test]
    fn analyze_reads_without_allocating() {
        let ctx = ctx();
        let mut input = ctx.allocate(4, Residency::Device).unwrap();
        ctx.upload(&mut input, &[1, 2, 3, 4]).unwrap();
        let mut total = 0u32;
        ctx.analyze("sum", &input, &mut |bytes| {
            total = bytes.iter().map(|&b| u32::from(b)).sum();
            Ok(())
        })
        .unwrap();
        assert_eq!(total, 10);
        assert_eq!(ctx.allocation_counts().allocations, 1);
    }

    #[test]
    fn strict_limit_rejects_allocation() {
        let ctx = ctx();
        ctx.set_memory_limit(100);
        ctx.set_strict_memory_limit(true);
        let _held = ctx.allocate(80, Residency::Device).unwrap();
        let err = ctx.allocate(40, Residency::Device).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Memory);
        assert_eq!(ctx.allocation_counts().allocations, 1);
    }

    #[test]
    fn memory_limit_warn_only_mode_preserves_success() {
        assert!(check_memory_limit(false, Some(1_024), 900, 200).unwrap());
    }

    #[test]
    fn memory_limit_allows_exact_boundary() {
        assert!(!check_memory_limit(true, Some(1_024), 768, 256).unwrap());
    }

    #[test]
    fn select_device_rejects_unknown_ordinal() {
        let ctx = ctx();
        assert_eq!(
            ctx.select_device(3).unwrap_err().code(),
            ErrorCode::InvalidParam
        );
        ctx.select_device(0).unwrap();
    }
}
