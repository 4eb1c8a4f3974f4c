//! Model registry: one loaded model per [`ModelType`], and the inference
//! operations that run against them.
//!
//! Every operation checks that its model is loaded before touching the
//! device, so a missing model fails fast and allocates nothing.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, instrument};

use pixopt_core::backend::{
    EnhanceOptions, InferenceBackend, InferenceOutput, InferenceRequest, ModelEntry,
    ModelSession, ModelType, StyleOptions,
};
use pixopt_core::callbacks::ProgressReporter;
use pixopt_core::context::DeviceBuffer;
use pixopt_core::detection::{DetectedFace, DetectedObject, Detections, SegmentationMask};
use pixopt_core::error::{OptimizerError, Result};
use pixopt_core::types::ImageGeometry;

use crate::manifest::load_manifest;
use crate::reference::ReferenceBackend;

struct LoadedModel {
    entry: ModelEntry,
    session: Box<dyn ModelSession>,
}

/// Enhanced raster returned by image-to-image operations.
#[derive(Debug)]
pub struct Enhanced {
    pub buffer: DeviceBuffer,
    pub geometry: ImageGeometry,
}

pub struct ModelRegistry {
    backends: HashMap<&'static str, Arc<dyn InferenceBackend>>,
    models: BTreeMap<ModelType, LoadedModel>,
    initialized: bool,
}

impl ModelRegistry {
    /// Registry with the reference backend registered. Not initialized.
    pub fn new() -> Self {
        let mut registry = Self {
            backends: HashMap::new(),
            models: BTreeMap::new(),
            initialized: false,
        };
        registry.register_backend(Arc::new(ReferenceBackend));
        registry
    }

    /// Register (or replace) a backend under its id.
    pub fn register_backend(&mut self, backend: Arc<dyn InferenceBackend>) {
        let id = backend.id();
        if self.backends.insert(id, backend).is_some() {
            debug!(backend = id, "Inference backend replaced");
        }
    }

    pub fn backend_ids(&self) -> Vec<&'static str> {
        let mut ids: Vec<_> = self.backends.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn initialize(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        self.initialized = true;
        info!(backends = ?self.backend_ids(), "Model registry initialized");
        Ok(())
    }

    /// Unload every model. Repeated calls are no-ops.
    pub fn shutdown(&mut self) {
        if !self.initialized {
            return;
        }
        let unloaded = self.models.len();
        self.models.clear();
        self.initialized = false;
        info!(unloaded, "Model registry shut down");
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(OptimizerError::NotInitialized)
        }
    }

    // ─── Loading ──

    /// Load the manifest at `path` into the `model_type` slot, replacing
    /// any model already there.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub fn load(&mut self, model_type: ModelType, path: &Path) -> Result<&ModelEntry> {
        self.ensure_initialized()?;
        let entry = load_manifest(path, model_type)?;
        self.load_entry(model_type, entry)
    }

    /// Load an already-parsed entry into the `model_type` slot.
    pub fn load_entry(&mut self, model_type: ModelType, entry: ModelEntry) -> Result<&ModelEntry> {
        self.ensure_initialized()?;
        entry.validate()?;
        let backend = self.backends.get(entry.backend.as_str()).ok_or_else(|| {
            OptimizerError::InvalidParam(format!(
                "model `{}` names unknown backend `{}` (registered: {})",
                entry.name,
                entry.backend,
                self.backend_ids().join(", ")
            ))
        })?;
        let session = backend.load(model_type, &entry)?;
        info!(
            %model_type,
            model = %entry.name,
            version = %entry.version,
            backend = %entry.backend,
            "Model loaded"
        );
        let slot = LoadedModel { entry, session };
        if let Some(previous) = self.models.insert(model_type, slot) {
            debug!(%model_type, replaced = %previous.entry.name, "Previous model released");
        }
        self.models
            .get(&model_type)
            .map(|m| &m.entry)
            .ok_or(OptimizerError::ModelNotLoaded(model_type))
    }

    /// Release the `model_type` slot. Unloading an empty slot succeeds.
    pub fn unload(&mut self, model_type: ModelType) -> Result<()> {
        self.ensure_initialized()?;
        if let Some(model) = self.models.remove(&model_type) {
            info!(%model_type, model = %model.entry.name, "Model unloaded");
        }
        Ok(())
    }

    pub fn is_loaded(&self, model_type: ModelType) -> bool {
        self.models.contains_key(&model_type)
    }

    pub fn model_info(&self, model_type: ModelType) -> Result<&ModelEntry> {
        self.ensure_initialized()?;
        self.models
            .get(&model_type)
            .map(|m| &m.entry)
            .ok_or(OptimizerError::ModelNotLoaded(model_type))
    }

    pub fn loaded_types(&self) -> Vec<ModelType> {
        self.models.keys().copied().collect()
    }

    // ─── Operations ──

    fn run(
        &mut self,
        model_type: ModelType,
        request: InferenceRequest<'_>,
        progress: Option<&mut dyn FnMut(f32)>,
    ) -> Result<InferenceOutput> {
        self.ensure_initialized()?;
        let geometry = request.geometry();
        let input = request.input();
        if input.handle().is_none() {
            return Err(OptimizerError::InvalidParam(format!(
                "{}: input buffer was already freed",
                request.kind()
            )));
        }
        if input.size() < geometry.byte_size() {
            return Err(OptimizerError::InvalidParam(format!(
                "{}: buffer of {} bytes cannot hold {geometry}",
                request.kind(),
                input.size()
            )));
        }
        let model = self
            .models
            .get_mut(&model_type)
            .ok_or(OptimizerError::ModelNotLoaded(model_type))?;
        let input_handle = input.handle();
        let kind = request.kind();
        let mut reporter = ProgressReporter::new(progress);
        let output = model.session.run(request, &mut reporter)?;
        if let InferenceOutput::Image { buffer, geometry } = &output {
            if buffer.handle() == input_handle {
                return Err(OptimizerError::Inference(format!(
                    "{kind} returned its input buffer"
                )));
            }
            if geometry.is_empty() || buffer.handle().is_none() {
                return Err(OptimizerError::Inference(format!(
                    "{kind} returned an empty image ({geometry})"
                )));
            }
            if buffer.size() < geometry.byte_size() {
                return Err(OptimizerError::Inference(format!(
                    "{kind} returned {} bytes for {geometry}, need {}",
                    buffer.size(),
                    geometry.byte_size()
                )));
            }
        }
        Ok(output)
    }

    fn run_image(
        &mut self,
        model_type: ModelType,
        request: InferenceRequest<'_>,
        progress: Option<&mut dyn FnMut(f32)>,
    ) -> Result<Enhanced> {
        let kind = request.kind();
        match self.run(model_type, request, progress)? {
            InferenceOutput::Image { buffer, geometry } => Ok(Enhanced { buffer, geometry }),
            _ => Err(OptimizerError::Inference(format!(
                "{kind} produced a non-image result"
            ))),
        }
    }

    fn check_threshold(threshold: f32) -> Result<()> {
        if (0.0..=1.0).contains(&threshold) {
            Ok(())
        } else {
            Err(OptimizerError::InvalidParam(format!(
                "confidence threshold must be within [0, 1], got {threshold}"
            )))
        }
    }

    /// Upscale by `scale`. The output is a new buffer.
    #[instrument(skip_all, fields(from = %geometry, scale = scale))]
    pub fn super_resolution(
        &mut self,
        input: &DeviceBuffer,
        geometry: ImageGeometry,
        scale: u32,
        progress: Option<&mut dyn FnMut(f32)>,
    ) -> Result<Enhanced> {
        if scale < 2 {
            return Err(OptimizerError::InvalidParam(format!(
                "super-resolution scale must be at least 2, got {scale}"
            )));
        }
        self.run_image(
            ModelType::SuperResolution,
            InferenceRequest::SuperResolution {
                input,
                geometry,
                scale,
            },
            progress,
        )
    }

    #[instrument(skip_all, fields(from = %geometry, strength = strength))]
    pub fn denoise(
        &mut self,
        input: &DeviceBuffer,
        geometry: ImageGeometry,
        strength: f32,
        progress: Option<&mut dyn FnMut(f32)>,
    ) -> Result<Enhanced> {
        if !(0.0..=1.0).contains(&strength) {
            return Err(OptimizerError::InvalidParam(format!(
                "denoise strength must be within [0, 1], got {strength}"
            )));
        }
        self.run_image(
            ModelType::Denoise,
            InferenceRequest::Denoise {
                input,
                geometry,
                strength,
            },
            progress,
        )
    }

    /// Detected objects with confidence at or above `threshold`.
    #[instrument(skip_all, fields(from = %geometry, threshold = threshold))]
    pub fn detect_objects(
        &mut self,
        input: &DeviceBuffer,
        geometry: ImageGeometry,
        threshold: f32,
        progress: Option<&mut dyn FnMut(f32)>,
    ) -> Result<Detections<DetectedObject>> {
        Self::check_threshold(threshold)?;
        match self.run(
            ModelType::ObjectDetection,
            InferenceRequest::DetectObjects { input, geometry },
            progress,
        )? {
            InferenceOutput::Objects(found) => Ok(Detections::filtered(found, threshold)),
            _ => Err(OptimizerError::Inference(
                "detect_objects produced a non-object result".into(),
            )),
        }
    }

    #[instrument(skip_all, fields(from = %geometry, threshold = threshold))]
    pub fn segment(
        &mut self,
        input: &DeviceBuffer,
        geometry: ImageGeometry,
        threshold: f32,
        progress: Option<&mut dyn FnMut(f32)>,
    ) -> Result<Detections<SegmentationMask>> {
        Self::check_threshold(threshold)?;
        match self.run(
            ModelType::Segmentation,
            InferenceRequest::Segment { input, geometry },
            progress,
        )? {
            InferenceOutput::Masks(found) => Ok(Detections::filtered(found, threshold)),
            _ => Err(OptimizerError::Inference(
                "segment produced a non-mask result".into(),
            )),
        }
    }

    /// Faces with confidence at or above `threshold`. Uses the
    /// [`ModelType::FaceEnhance`] slot.
    #[instrument(skip_all, fields(from = %geometry, threshold = threshold))]
    pub fn detect_faces(
        &mut self,
        input: &DeviceBuffer,
        geometry: ImageGeometry,
        threshold: f32,
        progress: Option<&mut dyn FnMut(f32)>,
    ) -> Result<Detections<DetectedFace>> {
        Self::check_threshold(threshold)?;
        match self.run(
            ModelType::FaceEnhance,
            InferenceRequest::DetectFaces { input, geometry },
            progress,
        )? {
            InferenceOutput::Faces(found) => Ok(Detections::filtered(found, threshold)),
            _ => Err(OptimizerError::Inference(
                "detect_faces produced a non-face result".into(),
            )),
        }
    }

    #[instrument(skip_all, fields(from = %geometry, faces = faces.len()))]
    pub fn enhance_faces(
        &mut self,
        input: &DeviceBuffer,
        geometry: ImageGeometry,
        faces: &[DetectedFace],
        options: &EnhanceOptions,
        progress: Option<&mut dyn FnMut(f32)>,
    ) -> Result<Enhanced> {
        options.validate()?;
        self.run_image(
            ModelType::FaceEnhance,
            InferenceRequest::EnhanceFaces {
                input,
                geometry,
                faces,
                options,
            },
            progress,
        )
    }

    #[instrument(skip_all, fields(from = %geometry, style = %options.style_name))]
    pub fn apply_style(
        &mut self,
        input: &DeviceBuffer,
        geometry: ImageGeometry,
        options: &StyleOptions,
        progress: Option<&mut dyn FnMut(f32)>,
    ) -> Result<Enhanced> {
        options.validate()?;
        self.run_image(
            ModelType::StyleTransfer,
            InferenceRequest::Style {
                input,
                geometry,
                options,
            },
            progress,
        )
    }

    #[instrument(skip_all, fields(from = %geometry))]
    pub fn enhance_color(
        &mut self,
        input: &DeviceBuffer,
        geometry: ImageGeometry,
        options: &EnhanceOptions,
        progress: Option<&mut dyn FnMut(f32)>,
    ) -> Result<Enhanced> {
        options.validate()?;
        self.run_image(
            ModelType::ColorEnhance,
            InferenceRequest::EnhanceColor {
                input,
                geometry,
                options,
            },
            progress,
        )
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
