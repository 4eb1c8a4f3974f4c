//! The orchestrator context object.
//!
//! `Optimizer` replaces process-wide state: it owns the device context,
//! the model registry, and the active format set, and serializes every
//! pipeline call on one mutex. Lifecycle:
//!
//! ```text
//! init:    formats -> device context -> host context -> model registry
//! cleanup: model registry -> host context -> device context
//! ```
//!
//! A failed init rolls back whatever it brought up, in reverse order.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, info, instrument, warn};

use pixopt_core::backend::{InferenceBackend, ModelEntry, ModelType};
use pixopt_core::callbacks::Callbacks;
use pixopt_core::context::{DeviceBackend, DeviceContext, DeviceInfo, PerformanceSnapshot};
use pixopt_core::error::{OptimizerError, Result};
use pixopt_core::formats::FormatRegistry;
use pixopt_core::types::{ImageFormat, ImageInfo, ProcessingOptions};
use pixopt_device::{BackendPreference, HostDevice, codec, create_backend, host, open_context};
use pixopt_inference::ModelRegistry;

use crate::config::OptimizerConfig;
use crate::info::version_string;
use crate::stages;

/// Builds the device backend opened at init.
pub type BackendFactory =
    Box<dyn Fn(BackendPreference) -> Result<Box<dyn DeviceBackend>> + Send + Sync>;

/// Subsystems a pipeline call works against. Guarded by the pipeline mutex.
pub(crate) struct Subsystems {
    /// Context for `use_gpu = true`.
    pub device: Arc<DeviceContext>,
    /// Host-emulated context for `use_gpu = false`. Shares `device` when the
    /// device backend already is the host.
    pub host: Arc<DeviceContext>,
    pub models: ModelRegistry,
}

impl Subsystems {
    fn shutdown(&mut self) {
        self.models.shutdown();
        if !Arc::ptr_eq(&self.host, &self.device) {
            self.host.shutdown();
        }
        self.device.shutdown();
    }
}

/// Everything that exists between `init` and `cleanup`.
struct ProcessState {
    formats: FormatRegistry,
    version: String,
    pipeline: Mutex<Subsystems>,
}

pub struct OptimizerBuilder {
    config: OptimizerConfig,
    device_factory: Option<BackendFactory>,
    inference_backends: Vec<Arc<dyn InferenceBackend>>,
}

impl OptimizerBuilder {
    /// Replace how the device backend is created (instrumented backends in
    /// tests, embedders with their own device).
    pub fn device_factory(mut self, factory: BackendFactory) -> Self {
        self.device_factory = Some(factory);
        self
    }

    /// Register an extra inference backend with the model registry at init.
    pub fn inference_backend(mut self, backend: Arc<dyn InferenceBackend>) -> Self {
        self.inference_backends.push(backend);
        self
    }

    pub fn build(self) -> Optimizer {
        Optimizer {
            config: self.config,
            device_factory: self
                .device_factory
                .unwrap_or_else(|| Box::new(create_backend) as BackendFactory),
            inference_backends: self.inference_backends,
            state: RwLock::new(None),
        }
    }
}

pub struct Optimizer {
    config: OptimizerConfig,
    device_factory: BackendFactory,
    inference_backends: Vec<Arc<dyn InferenceBackend>>,
    state: RwLock<Option<Arc<ProcessState>>>,
}

impl Optimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: OptimizerConfig) -> OptimizerBuilder {
        OptimizerBuilder {
            config,
            device_factory: None,
            inference_backends: Vec::new(),
        }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    // ─── Lifecycle ──

    /// Bring up every subsystem. Calling it again while initialized is a
    /// no-op success.
    #[instrument(skip_all, fields(backend = %self.config.backend, device = self.config.device))]
    pub fn init(&self) -> Result<()> {
        let mut state = self.state.write()?;
        if state.is_some() {
            debug!("Optimizer already initialized");
            return Ok(());
        }
        self.config.validate()?;
        let formats = self.config.format_registry();

        let device = self.open_device()?;
        let host = match self.open_host(&device) {
            Ok(host) => host,
            Err(e) => {
                device.shutdown();
                return Err(e);
            }
        };
        let mut subsystems = Subsystems {
            device,
            host,
            models: ModelRegistry::new(),
        };
        if let Err(e) = self.init_models(&mut subsystems.models) {
            warn!(error = %e, "Model registry init failed; rolling back");
            subsystems.shutdown();
            return Err(e);
        }

        info!(
            device = subsystems.device.backend_name(),
            formats = formats.len(),
            models = subsystems.models.loaded_types().len(),
            "Optimizer initialized"
        );
        *state = Some(Arc::new(ProcessState {
            formats,
            version: version_string(),
            pipeline: Mutex::new(subsystems),
        }));
        Ok(())
    }

    fn open_device(&self) -> Result<Arc<DeviceContext>> {
        let preference = self.config.backend;
        let ctx = match (self.device_factory)(preference)
            .and_then(|backend| open_context(backend, self.config.device))
        {
            Ok(ctx) => ctx,
            Err(e) if preference == BackendPreference::Auto => {
                warn!(error = %e, "Preferred device unavailable, using host emulation");
                open_context(Box::new(HostDevice::new()), 0)?
            }
            Err(e) => return Err(e),
        };
        self.apply_limits(&ctx);
        Ok(ctx)
    }

    fn open_host(&self, device: &Arc<DeviceContext>) -> Result<Arc<DeviceContext>> {
        if device.backend_name() == host::BACKEND_NAME {
            return Ok(Arc::clone(device));
        }
        let ctx = open_context(Box::new(HostDevice::new()), 0)?;
        self.apply_limits(&ctx);
        Ok(ctx)
    }

    fn apply_limits(&self, ctx: &DeviceContext) {
        if self.config.strict_memory_limit {
            ctx.set_strict_memory_limit(true);
        }
        if let Some(limit) = self.config.memory_limit_bytes() {
            ctx.set_memory_limit(limit);
        }
    }

    fn init_models(&self, models: &mut ModelRegistry) -> Result<()> {
        for backend in &self.inference_backends {
            models.register_backend(Arc::clone(backend));
        }
        models.initialize()?;
        for (&model_type, path) in &self.config.models {
            models.load(model_type, path)?;
        }
        Ok(())
    }

    /// Tear everything down. Waits for an in-flight pipeline call. A no-op
    /// when not initialized.
    #[instrument(skip_all)]
    pub fn cleanup(&self) -> Result<()> {
        let Some(state) = self.state.write()?.take() else {
            debug!("Optimizer not initialized; nothing to clean up");
            return Ok(());
        };
        // A panicking plugin may have poisoned the lock; the subsystems
        // still need their shutdown.
        state
            .pipeline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shutdown();
        info!("Optimizer shut down");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.state.read().map(|s| s.is_some()).unwrap_or(false)
    }

    fn state(&self) -> Result<Arc<ProcessState>> {
        self.state
            .read()?
            .as_ref()
            .map(Arc::clone)
            .ok_or(OptimizerError::NotInitialized)
    }

    /// Checks shared by both pipelines; nothing has been acquired yet.
    fn admit(&self, options: &ProcessingOptions) -> Result<Arc<ProcessState>> {
        let state = self.state()?;
        state.formats.check(options.output_format)?;
        options.validate()?;
        Ok(state)
    }

    // ─── Pipelines ──

    /// Buffer-to-buffer pipeline. Returns the encoded output bytes.
    #[instrument(skip_all, fields(bytes = input.len(), format = %options.output_format))]
    pub fn process_buffer(
        &self,
        input: &[u8],
        options: &ProcessingOptions,
        callbacks: &mut Callbacks<'_>,
    ) -> Result<Vec<u8>> {
        let state = self.admit(options)?;
        if input.is_empty() {
            return Err(OptimizerError::InvalidParam("input buffer is empty".into()));
        }
        let mut subsystems = state.pipeline.lock()?;
        self.run_locked(&mut subsystems, input, options, callbacks)
    }

    /// File-to-file pipeline: whole-file read, buffer pipeline, whole-file
    /// write.
    #[instrument(
        skip_all,
        fields(
            input = %input.display(),
            output = %output.display(),
            format = %options.output_format
        )
    )]
    pub fn process_file(
        &self,
        input: &Path,
        output: &Path,
        options: &ProcessingOptions,
        callbacks: &mut Callbacks<'_>,
    ) -> Result<()> {
        let state = self.admit(options)?;
        let mut subsystems = state.pipeline.lock()?;
        let bytes = read_whole(input)?;
        if bytes.is_empty() {
            return Err(OptimizerError::InvalidParam(format!(
                "{} is empty",
                input.display()
            )));
        }
        let encoded = self.run_locked(&mut subsystems, &bytes, options, callbacks)?;
        std::fs::write(output, &encoded).map_err(|e| OptimizerError::file_io(output, e))?;
        info!(
            in_bytes = bytes.len(),
            out_bytes = encoded.len(),
            "Wrote optimized image"
        );
        Ok(())
    }

    fn run_locked(
        &self,
        subsystems: &mut Subsystems,
        input: &[u8],
        options: &ProcessingOptions,
        callbacks: &mut Callbacks<'_>,
    ) -> Result<Vec<u8>> {
        #[cfg(feature = "audit-no-host-copies")]
        let _audit_guard =
            pixopt_core::host_copy_audit::push_strict_mode(self.config.strict_no_host_copies);
        stages::run(subsystems, input, options, callbacks)
    }

    // ─── Queries ──

    /// Caller-owned copy of the active output formats.
    pub fn supported_formats(&self) -> Result<Vec<ImageFormat>> {
        Ok(self.state()?.formats.to_vec())
    }

    pub fn is_format_supported(&self, format: ImageFormat) -> Result<bool> {
        Ok(self.state()?.formats.contains(format))
    }

    pub fn version(&self) -> Result<String> {
        Ok(self.state()?.version.clone())
    }

    /// Probe an image file without decoding its pixels.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn image_info(&self, path: &Path) -> Result<ImageInfo> {
        self.state()?;
        let bytes = read_whole(path)?;
        codec::probe(&bytes)
    }

    // ─── Devices ──

    pub fn devices(&self) -> Result<Vec<DeviceInfo>> {
        self.with_subsystems(|s| s.device.devices())
    }

    pub fn device_names(&self) -> Result<Vec<String>> {
        Ok(self.devices()?.into_iter().map(|d| d.name).collect())
    }

    /// Select the device used by later `use_gpu` pipeline calls.
    pub fn set_device(&self, ordinal: usize) -> Result<()> {
        self.with_subsystems(|s| s.device.select_device(ordinal))
    }

    pub fn active_device(&self) -> Result<usize> {
        self.with_subsystems(|s| Ok(s.device.active_device()))
    }

    /// Counters of the device context used by `use_gpu` calls.
    pub fn performance(&self) -> Result<PerformanceSnapshot> {
        self.with_subsystems(|s| Ok(s.device.performance()))
    }

    // ─── Models ──

    pub fn load_model(&self, model_type: ModelType, path: &Path) -> Result<ModelEntry> {
        self.with_subsystems(|s| s.models.load(model_type, path).cloned())
    }

    pub fn unload_model(&self, model_type: ModelType) -> Result<()> {
        self.with_subsystems(|s| s.models.unload(model_type))
    }

    pub fn model_info(&self, model_type: ModelType) -> Result<ModelEntry> {
        self.with_subsystems(|s| s.models.model_info(model_type).cloned())
    }

    pub fn loaded_models(&self) -> Result<Vec<ModelType>> {
        self.with_subsystems(|s| Ok(s.models.loaded_types()))
    }

    fn with_subsystems<R>(&self, f: impl FnOnce(&mut Subsystems) -> Result<R>) -> Result<R> {
        let state = self.state()?;
        let mut subsystems = state.pipeline.lock()?;
        f(&mut subsystems)
    }
}

impl Drop for Optimizer {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            warn!(error = %e, "Optimizer cleanup failed during drop");
        }
    }
}

/// Read a whole file. A length that changes under the read is reported as
/// a short read.
fn read_whole(path: &Path) -> Result<Vec<u8>> {
    let mut file = File::open(path).map_err(|e| OptimizerError::file_io(path, e))?;
    let expected = file
        .metadata()
        .map_err(|e| OptimizerError::file_io(path, e))?
        .len();
    let capacity = usize::try_from(expected).map_err(|_| OptimizerError::Memory {
        bytes: usize::MAX,
        reason: format!("{} is too large to buffer", path.display()),
    })?;
    let mut bytes = Vec::new();
    bytes
        .try_reserve_exact(capacity)
        .map_err(|_| OptimizerError::Memory {
            bytes: capacity,
            reason: format!("buffering {}", path.display()),
        })?;
    file.read_to_end(&mut bytes)
        .map_err(|e| OptimizerError::file_io(path, e))?;
    if bytes.len() as u64 != expected {
        return Err(OptimizerError::ShortRead {
            path: path.to_path_buf(),
            expected,
            actual: bytes.len() as u64,
        });
    }
    Ok(bytes)
}
