//! CUDA driver backend.
//!
//! Buffers are real device allocations. Resize and colour conversion run
//! as NVRTC-compiled kernels on the device that owns the input. Decode,
//! encode and analysis programs run on the host: inputs are staged down,
//! the program runs, and the result is staged back up. Each staged program
//! is recorded by the host-copy audit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use cudarc::driver::sys::CUdevice_attribute;
use cudarc::driver::{
    CudaDevice, CudaFunction, CudaSlice, DevicePtr, DriverError, LaunchAsync, LaunchConfig,
};
use tracing::{debug, info, warn};

use pixopt_core::context::{
    AnalysisProgram, DeviceBackend, DeviceHandle, DeviceInfo, DeviceProgram, KernelOutput,
    NativeOp, Residency,
};
use pixopt_core::error::{OptimizerError, Result};
use pixopt_core::host_staging;
use pixopt_core::types::ColorSpace;

pub const BACKEND_NAME: &str = "cuda";

fn driver_err(op: &str, e: DriverError) -> OptimizerError {
    OptimizerError::Device(format!("{op}: {e}"))
}

// ─── Pixel kernels ──────────────────────────────────────────────────────────

/// Resize and layout conversion over interleaved 8-bit rasters.
///
/// Layout codes: 0 = RGB, 1 = RGBA, 2 = Gray, 3 = CMYK. Conversion goes
/// through RGBA with the same integer arithmetic as the host path, so both
/// backends produce identical bytes.
const PIXEL_CUDA_SRC: &str = r#"
__device__ __forceinline__ int layout_channels(int layout) {
    return layout == 0 ? 3 : (layout == 2 ? 1 : 4);
}

__device__ __forceinline__ void load_rgba(const unsigned char* px, int layout, unsigned int* o) {
    if (layout == 0) {
        o[0] = px[0]; o[1] = px[1]; o[2] = px[2]; o[3] = 255;
    } else if (layout == 1) {
        o[0] = px[0]; o[1] = px[1]; o[2] = px[2]; o[3] = px[3];
    } else if (layout == 2) {
        o[0] = px[0]; o[1] = px[0]; o[2] = px[0]; o[3] = 255;
    } else {
        unsigned int k = 255u - px[3];
        o[0] = (255u - px[0]) * k / 255u;
        o[1] = (255u - px[1]) * k / 255u;
        o[2] = (255u - px[2]) * k / 255u;
        o[3] = 255;
    }
}

__device__ __forceinline__ void store_rgba(const unsigned int* p, int layout, unsigned char* out) {
    if (layout == 0) {
        out[0] = p[0]; out[1] = p[1]; out[2] = p[2];
    } else if (layout == 1) {
        out[0] = p[0]; out[1] = p[1]; out[2] = p[2]; out[3] = p[3];
    } else if (layout == 2) {
        out[0] = (299u * p[0] + 587u * p[1] + 114u * p[2] + 500u) / 1000u;
    } else {
        unsigned int m = max(p[0], max(p[1], p[2]));
        if (m == 0u) {
            out[0] = 0; out[1] = 0; out[2] = 0; out[3] = 255;
            return;
        }
        out[0] = (m - p[0]) * 255u / m;
        out[1] = (m - p[1]) * 255u / m;
        out[2] = (m - p[2]) * 255u / m;
        out[3] = 255u - m;
    }
}

// One thread per destination pixel, half-pixel centres, edges clamped.
extern "C" __global__ void resize_bilinear_u8(
    const unsigned char* __restrict__ src,
    unsigned char* __restrict__ dst,
    int src_w, int src_h, int dst_w, int dst_h, int channels)
{
    int x = blockIdx.x * blockDim.x + threadIdx.x;
    int y = blockIdx.y * blockDim.y + threadIdx.y;
    if (x >= dst_w || y >= dst_h) return;

    float sx = ((float)x + 0.5f) * (float)src_w / (float)dst_w - 0.5f;
    float sy = ((float)y + 0.5f) * (float)src_h / (float)dst_h - 0.5f;
    sx = fminf(fmaxf(sx, 0.0f), (float)(src_w - 1));
    sy = fminf(fmaxf(sy, 0.0f), (float)(src_h - 1));
    int x0 = (int)sx;
    int y0 = (int)sy;
    int x1 = min(x0 + 1, src_w - 1);
    int y1 = min(y0 + 1, src_h - 1);
    float fx = sx - (float)x0;
    float fy = sy - (float)y0;

    const unsigned char* r0 = src + (size_t)y0 * src_w * channels;
    const unsigned char* r1 = src + (size_t)y1 * src_w * channels;
    unsigned char* out = dst + ((size_t)y * dst_w + x) * channels;
    for (int c = 0; c < channels; ++c) {
        float p00 = r0[x0 * channels + c];
        float p01 = r0[x1 * channels + c];
        float p10 = r1[x0 * channels + c];
        float p11 = r1[x1 * channels + c];
        float top = p00 + (p01 - p00) * fx;
        float bot = p10 + (p11 - p10) * fx;
        float v = top + (bot - top) * fy + 0.5f;
        out[c] = (unsigned char)fminf(fmaxf(v, 0.0f), 255.0f);
    }
}

extern "C" __global__ void color_convert_u8(
    const unsigned char* __restrict__ src,
    unsigned char* __restrict__ dst,
    int pixels, int from, int to)
{
    int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i >= pixels) return;

    int cin = layout_channels(from);
    int cout = layout_channels(to);
    const unsigned char* px = src + (size_t)i * cin;
    unsigned char* out = dst + (size_t)i * cout;
    if (from == to) {
        for (int c = 0; c < cin; ++c) out[c] = px[c];
        return;
    }
    unsigned int rgba[4];
    load_rgba(px, from, rgba);
    store_rgba(rgba, to, out);
}
"#;

const MODULE_NAME: &str = "pixopt_pixel";
const KERNEL_NAMES: &[&str] = &["resize_bilinear_u8", "color_convert_u8"];

/// Kernel handles loaded into one device's context.
#[derive(Clone)]
struct PixelKernels {
    resize_bilinear: CudaFunction,
    color_convert: CudaFunction,
}

impl PixelKernels {
    fn compile(device: &Arc<CudaDevice>) -> Result<Self> {
        let ptx = cudarc::nvrtc::compile_ptx_with_opts(
            PIXEL_CUDA_SRC,
            cudarc::nvrtc::CompileOptions {
                ftz: Some(true),
                prec_div: Some(false),
                prec_sqrt: Some(false),
                ..Default::default()
            },
        )
        .map_err(|e| OptimizerError::Initialization(format!("NVRTC compile failed: {e}")))?;

        device
            .load_ptx(ptx, MODULE_NAME, KERNEL_NAMES)
            .map_err(|e| driver_err("cuModuleLoadData", e))?;

        let get_fn = |name: &str| -> Result<CudaFunction> {
            device.get_func(MODULE_NAME, name).ok_or_else(|| {
                OptimizerError::Initialization(format!(
                    "kernel '{name}' not found in module '{MODULE_NAME}'"
                ))
            })
        };
        Ok(Self {
            resize_bilinear: get_fn("resize_bilinear_u8")?,
            color_convert: get_fn("color_convert_u8")?,
        })
    }
}

fn layout_code(colorspace: ColorSpace) -> i32 {
    match colorspace {
        ColorSpace::Rgb => 0,
        ColorSpace::Rgba => 1,
        ColorSpace::Gray => 2,
        ColorSpace::Cmyk => 3,
    }
}

/// 16x16 blocks covering a `width` x `height` grid.
fn launch_config_2d(width: u32, height: u32) -> (LaunchConfig, (u32, u32, u32)) {
    let block = (16u32, 16u32, 1u32);
    let grid = (width.div_ceil(block.0), height.div_ceil(block.1), 1u32);
    (
        LaunchConfig {
            grid_dim: grid,
            block_dim: block,
            shared_mem_bytes: 0,
        },
        block,
    )
}

/// 256 threads per block.
fn launch_config_1d(count: usize) -> LaunchConfig {
    let block = 256u32;
    let grid = ((count as u32).div_ceil(block), 1, 1);
    LaunchConfig {
        grid_dim: grid,
        block_dim: (block, 1, 1),
        shared_mem_bytes: 0,
    }
}

// ─── Backend ────────────────────────────────────────────────────────────────

struct CudaAllocation {
    slice: CudaSlice<u8>,
    device: Arc<CudaDevice>,
}

pub struct CudaBackend {
    devices: Mutex<Vec<Arc<CudaDevice>>>,
    active: AtomicUsize,
    buffers: Mutex<HashMap<u64, CudaAllocation>>,
    next_handle: AtomicU64,
    // Per ordinal; `None` records a failed compile so it is not retried.
    kernels: Mutex<HashMap<usize, Option<PixelKernels>>>,
}

// SAFETY: CUDA handles are only touched under the internal mutexes.
unsafe impl Send for CudaBackend {}
unsafe impl Sync for CudaBackend {}

impl CudaBackend {
    pub fn new() -> Result<Self> {
        Ok(Self {
            devices: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            buffers: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            kernels: Mutex::new(HashMap::new()),
        })
    }

    /// Devices visible to the driver. A missing driver library is an error,
    /// not a panic.
    pub fn device_count() -> Result<usize> {
        let count = std::panic::catch_unwind(CudaDevice::count).map_err(|_| {
            OptimizerError::Device("CUDA driver library could not be loaded".into())
        })?;
        let count = count.map_err(|e| driver_err("cuDeviceGetCount", e))?;
        Ok(count.max(0) as usize)
    }

    fn active(&self) -> Result<Arc<CudaDevice>> {
        let devices = self.devices.lock()?;
        devices
            .get(self.active.load(Ordering::Acquire))
            .cloned()
            .ok_or_else(|| OptimizerError::Device("CUDA backend is not initialized".into()))
    }

    fn describe(ordinal: usize, dev: &Arc<CudaDevice>) -> Result<DeviceInfo> {
        let attr = |a: CUdevice_attribute| {
            dev.attribute(a)
                .map_err(|e| driver_err("cuDeviceGetAttribute", e))
        };
        let major = attr(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)?;
        let minor = attr(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)?;
        let sms = attr(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT)?;
        let clock_khz = attr(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_CLOCK_RATE)?;
        // SAFETY: cu_device comes from a live CudaDevice.
        let memory = unsafe { cudarc::driver::result::device::total_mem(*dev.cu_device()) }
            .map_err(|e| driver_err("cuDeviceTotalMem", e))?;
        Ok(DeviceInfo {
            ordinal,
            name: dev.name().map_err(|e| driver_err("cuDeviceGetName", e))?,
            compute_units: sms.max(0) as u32,
            clock_mhz: (clock_khz.max(0) / 1000) as u32,
            memory_bytes: memory as u64,
            supports_fp16: major >= 6,
            supports_int8: major > 6 || (major == 6 && minor >= 1),
            vendor: "NVIDIA".into(),
            driver_version: format!("sm_{major}{minor}"),
        })
    }

    fn with_alloc<R>(
        &self,
        handle: DeviceHandle,
        f: impl FnOnce(&mut CudaAllocation) -> Result<R>,
    ) -> Result<R> {
        let mut buffers = self.buffers.lock()?;
        let alloc = buffers.get_mut(&handle.0).ok_or_else(|| {
            OptimizerError::InvalidParam(format!("unknown device handle {}", handle.0))
        })?;
        f(alloc)
    }

    /// Kernels for `device`, compiled on first use. `None` when NVRTC is
    /// unavailable, in which case callers fall back to host staging.
    fn kernels_for(&self, device: &Arc<CudaDevice>) -> Result<Option<PixelKernels>> {
        let mut kernels = self.kernels.lock()?;
        let ordinal = device.ordinal();
        if let Some(loaded) = kernels.get(&ordinal) {
            return Ok(loaded.clone());
        }
        let loaded = match PixelKernels::compile(device) {
            Ok(k) => {
                info!(ordinal, kernels = KERNEL_NAMES.len(), "CUDA pixel kernels loaded");
                Some(k)
            }
            Err(e) => {
                warn!(ordinal, error = %e, "CUDA pixel kernels unavailable; staging through host");
                None
            }
        };
        kernels.insert(ordinal, loaded.clone());
        Ok(loaded)
    }

    fn insert(&self, alloc: CudaAllocation) -> Result<DeviceHandle> {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.buffers.lock()?.insert(id, alloc);
        Ok(DeviceHandle(id))
    }
}

impl DeviceBackend for CudaBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn initialize(&self) -> Result<()> {
        let count = Self::device_count()?;
        if count == 0 {
            return Err(OptimizerError::Device("no CUDA devices present".into()));
        }
        let mut devices = self.devices.lock()?;
        devices.clear();
        for ordinal in 0..count {
            devices.push(CudaDevice::new(ordinal).map_err(|e| driver_err("cuCtxCreate", e))?);
        }
        info!(devices = count, "CUDA backend initialized");
        Ok(())
    }

    fn shutdown(&self) {
        if let Ok(mut buffers) = self.buffers.lock() {
            buffers.clear();
        }
        if let Ok(mut kernels) = self.kernels.lock() {
            kernels.clear();
        }
        if let Ok(mut devices) = self.devices.lock() {
            devices.clear();
        }
    }

    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        let devices = self.devices.lock()?;
        devices
            .iter()
            .enumerate()
            .map(|(i, dev)| Self::describe(i, dev))
            .collect()
    }

    fn select_device(&self, ordinal: usize) -> Result<()> {
        let count = self.devices.lock()?.len();
        if ordinal >= count {
            return Err(OptimizerError::InvalidParam(format!(
                "CUDA ordinal {ordinal} out of range ({count} devices)"
            )));
        }
        self.active.store(ordinal, Ordering::Release);
        Ok(())
    }

    fn active_device(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    fn allocate(&self, size: usize, residency: Residency) -> Result<DeviceHandle> {
        let device = self.active()?;
        let slice = device
            .alloc_zeros::<u8>(size)
            .map_err(|e| OptimizerError::Memory {
                bytes: size,
                reason: e.to_string(),
            })?;
        debug!(size, ?residency, "CUDA allocation");
        self.insert(CudaAllocation { slice, device })
    }

    fn free(&self, handle: DeviceHandle) -> Result<()> {
        // Dropping the slice returns it to the driver.
        self.buffers.lock()?.remove(&handle.0);
        Ok(())
    }

    fn upload(&self, dst: DeviceHandle, src: &[u8]) -> Result<()> {
        self.with_alloc(dst, |alloc| {
            let mut view = alloc.slice.slice_mut(0..src.len());
            alloc
                .device
                .htod_sync_copy_into(src, &mut view)
                .map_err(|e| driver_err("cuMemcpyHtoD", e))
        })
    }

    fn download(&self, src: DeviceHandle, dst: &mut [u8]) -> Result<()> {
        self.with_alloc(src, |alloc| {
            let view = alloc.slice.slice(0..dst.len());
            alloc
                .device
                .dtoh_sync_copy_into(&view, dst)
                .map_err(|e| driver_err("cuMemcpyDtoH", e))
        })
    }

    fn execute(
        &self,
        kernel: &'static str,
        inputs: &[(DeviceHandle, usize)],
        program: DeviceProgram<'_>,
    ) -> Result<KernelOutput> {
        host_staging!(kernel, "{} inputs staged through host", inputs.len());
        let mut staged = Vec::with_capacity(inputs.len());
        for (handle, size) in inputs {
            staged.push(self.with_alloc(*handle, |alloc| {
                alloc
                    .device
                    .dtoh_sync_copy(&alloc.slice.slice(0..*size))
                    .map_err(|e| driver_err("cuMemcpyDtoH", e))
            })?);
        }
        let views: Vec<&[u8]> = staged.iter().map(Vec::as_slice).collect();
        let output = program(&views)?;
        if output.is_empty() {
            return Err(OptimizerError::kernel(kernel, "program produced no output"));
        }
        let device = self.active()?;
        let slice = device
            .htod_sync_copy(&output)
            .map_err(|e| driver_err("cuMemcpyHtoD", e))?;
        let size = output.len();
        let handle = self.insert(CudaAllocation { slice, device })?;
        Ok(KernelOutput { handle, size })
    }

    fn analyze(
        &self,
        kernel: &'static str,
        input: (DeviceHandle, usize),
        program: AnalysisProgram<'_>,
    ) -> Result<()> {
        host_staging!(kernel, "analysis input staged through host");
        let (handle, size) = input;
        let staged = self.with_alloc(handle, |alloc| {
            alloc
                .device
                .dtoh_sync_copy(&alloc.slice.slice(0..size))
                .map_err(|e| driver_err("cuMemcpyDtoH", e))
        })?;
        program(&staged)
    }

    fn launch(
        &self,
        kernel: &'static str,
        op: &NativeOp,
        input: (DeviceHandle, usize),
    ) -> Result<Option<KernelOutput>> {
        let (handle, size) = input;
        let from = op.input();
        let target = op.output();
        if size < from.byte_size() || target.is_empty() {
            return Err(OptimizerError::kernel(
                kernel,
                format!("{size} input bytes cannot produce {target} from {from}"),
            ));
        }
        let (device, src_ptr) = self.with_alloc(handle, |alloc| {
            Ok((Arc::clone(&alloc.device), *alloc.slice.device_ptr()))
        })?;
        let Some(kernels) = self.kernels_for(&device)? else {
            return Ok(None);
        };

        let out_size = target.byte_size();
        let output = device
            .alloc_zeros::<u8>(out_size)
            .map_err(|e| OptimizerError::Memory {
                bytes: out_size,
                reason: e.to_string(),
            })?;
        let dst_ptr = *output.device_ptr();

        match *op {
            NativeOp::Resize {
                from,
                width,
                height,
            } => {
                let (config, _block) = launch_config_2d(width, height);
                // SAFETY:
                // - `src_ptr` belongs to a buffer the caller borrows for the
                //   whole call and holds `from.byte_size()` bytes (checked).
                // - `output` is live until inserted below and holds
                //   width * height * channels bytes.
                // - The grid covers [0..width) x [0..height); out-of-range
                //   threads return before touching memory.
                unsafe {
                    kernels.resize_bilinear.clone().launch(
                        config,
                        (
                            src_ptr,
                            dst_ptr,
                            from.width as i32,
                            from.height as i32,
                            width as i32,
                            height as i32,
                            from.colorspace.channels() as i32,
                        ),
                    )
                }
                .map_err(|e| driver_err("resize_bilinear_u8", e))?;
            }
            NativeOp::ColorConvert { from, to } => {
                let pixels = from.pixel_count();
                let config = launch_config_1d(pixels);
                // SAFETY:
                // - Reads pixels * channels(from) bytes from `src_ptr`, within
                //   the checked input size.
                // - Writes pixels * channels(to) bytes, exactly `out_size`.
                // - Threads with i >= pixels return immediately.
                unsafe {
                    kernels.color_convert.clone().launch(
                        config,
                        (
                            src_ptr,
                            dst_ptr,
                            pixels as i32,
                            layout_code(from.colorspace),
                            layout_code(to),
                        ),
                    )
                }
                .map_err(|e| driver_err("color_convert_u8", e))?;
            }
        }
        device
            .synchronize()
            .map_err(|e| driver_err("cuCtxSynchronize", e))?;

        debug!(kernel, bytes = out_size, "Native kernel complete");
        let handle = self.insert(CudaAllocation {
            slice: output,
            device,
        })?;
        Ok(Some(KernelOutput {
            handle,
            size: out_size,
        }))
    }
}
