//! Inference backend contract: model types, manifests, and the session
//! trait every AI backend implements.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::callbacks::ProgressReporter;
use crate::context::DeviceBuffer;
use crate::detection::{DetectedFace, DetectedObject, SegmentationMask};
use crate::error::{OptimizerError, Result};
use crate::types::{ImageGeometry, check_unit};

/// The seven model categories. At most one model per category is loaded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    SuperResolution,
    Denoise,
    FaceEnhance,
    ObjectDetection,
    Segmentation,
    StyleTransfer,
    ColorEnhance,
}

impl ModelType {
    pub const ALL: [ModelType; 7] = [
        ModelType::SuperResolution,
        ModelType::Denoise,
        ModelType::FaceEnhance,
        ModelType::ObjectDetection,
        ModelType::Segmentation,
        ModelType::StyleTransfer,
        ModelType::ColorEnhance,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            ModelType::SuperResolution => "super_resolution",
            ModelType::Denoise => "denoise",
            ModelType::FaceEnhance => "face_enhance",
            ModelType::ObjectDetection => "object_detection",
            ModelType::Segmentation => "segmentation",
            ModelType::StyleTransfer => "style_transfer",
            ModelType::ColorEnhance => "color_enhance",
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelType {
    type Err = OptimizerError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|ty| ty.name() == normalized)
            .ok_or_else(|| OptimizerError::InvalidParam(format!("unknown model type `{s}`")))
    }
}

/// Descriptive record for a loaded model, read from a JSON manifest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelEntry {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    /// Optional category check; a manifest loaded into another slot is rejected.
    #[serde(default)]
    pub model_type: Option<ModelType>,
    #[serde(default)]
    pub input_width: u32,
    #[serde(default)]
    pub input_height: u32,
    #[serde(default = "default_channels")]
    pub channels: u32,
    #[serde(default)]
    pub mean: Vec<f32>,
    #[serde(default)]
    pub std: Vec<f32>,
    /// Registered inference backend id.
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Bytes of device memory the model expects to need.
    #[serde(default)]
    pub memory_required: u64,
    /// Backend-specific tuning knobs.
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
    /// Manifest path the entry was loaded from.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

fn default_version() -> String {
    "1.0".into()
}

fn default_channels() -> u32 {
    3
}

fn default_backend() -> String {
    "reference".into()
}

impl ModelEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            model_type: None,
            input_width: 0,
            input_height: 0,
            channels: default_channels(),
            mean: Vec::new(),
            std: Vec::new(),
            backend: default_backend(),
            memory_required: 0,
            params: serde_json::Map::new(),
            source: None,
        }
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = backend.into();
        self
    }

    /// Numeric tuning parameter, if present.
    pub fn param_f32(&self, key: &str) -> Option<f32> {
        self.params.get(key).and_then(|v| v.as_f64()).map(|v| v as f32)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(OptimizerError::InvalidParam(
                "model manifest has an empty name".into(),
            ));
        }
        if !(1..=4).contains(&self.channels) {
            return Err(OptimizerError::InvalidParam(format!(
                "model `{}` declares {} channels (expected 1..=4)",
                self.name, self.channels
            )));
        }
        let channels = self.channels as usize;
        if !self.mean.is_empty() && self.mean.len() != channels {
            return Err(OptimizerError::InvalidParam(format!(
                "model `{}` has {} mean values for {channels} channels",
                self.name,
                self.mean.len()
            )));
        }
        if !self.std.is_empty() && self.std.len() != channels {
            return Err(OptimizerError::InvalidParam(format!(
                "model `{}` has {} std values for {channels} channels",
                self.name,
                self.std.len()
            )));
        }
        if self.std.iter().any(|s| *s == 0.0 || !s.is_finite()) {
            return Err(OptimizerError::InvalidParam(format!(
                "model `{}` has a zero or non-finite std value",
                self.name
            )));
        }
        Ok(())
    }
}

// ─── Operation options ──────────────────────────────────────────────────────

/// Tuning for face and colour enhancement. Strengths are in `[0, 1]`,
/// adjustments in `[-1, 1]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnhanceOptions {
    pub denoise_strength: f32,
    pub sharpen_strength: f32,
    pub color_enhance_strength: f32,
    pub exposure_adjust: f32,
    pub contrast_adjust: f32,
    pub fix_red_eye: bool,
    pub fix_skin_tone: bool,
}

impl Default for EnhanceOptions {
    fn default() -> Self {
        Self {
            denoise_strength: 0.3,
            sharpen_strength: 0.3,
            color_enhance_strength: 0.5,
            exposure_adjust: 0.0,
            contrast_adjust: 0.0,
            fix_red_eye: false,
            fix_skin_tone: false,
        }
    }
}

impl EnhanceOptions {
    pub fn validate(&self) -> Result<()> {
        check_unit("denoise_strength", self.denoise_strength)?;
        check_unit("sharpen_strength", self.sharpen_strength)?;
        check_unit("color_enhance_strength", self.color_enhance_strength)?;
        for (what, v) in [
            ("exposure_adjust", self.exposure_adjust),
            ("contrast_adjust", self.contrast_adjust),
        ] {
            if !(-1.0..=1.0).contains(&v) {
                return Err(OptimizerError::InvalidParam(format!(
                    "{what} must be within [-1, 1], got {v}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StyleOptions {
    pub style_name: String,
    pub strength: f32,
    pub preserve_color: bool,
    pub high_resolution: bool,
}

impl Default for StyleOptions {
    fn default() -> Self {
        Self {
            style_name: "warm".into(),
            strength: 0.75,
            preserve_color: false,
            high_resolution: false,
        }
    }
}

impl StyleOptions {
    pub fn validate(&self) -> Result<()> {
        if self.style_name.trim().is_empty() {
            return Err(OptimizerError::InvalidParam("style_name is empty".into()));
        }
        check_unit("style strength", self.strength)
    }
}

// ─── Backend contract ───────────────────────────────────────────────────────

/// One inference call against a loaded model. Inputs stay device-resident.
pub enum InferenceRequest<'a> {
    SuperResolution {
        input: &'a DeviceBuffer,
        geometry: ImageGeometry,
        scale: u32,
    },
    Denoise {
        input: &'a DeviceBuffer,
        geometry: ImageGeometry,
        strength: f32,
    },
    DetectObjects {
        input: &'a DeviceBuffer,
        geometry: ImageGeometry,
    },
    Segment {
        input: &'a DeviceBuffer,
        geometry: ImageGeometry,
    },
    DetectFaces {
        input: &'a DeviceBuffer,
        geometry: ImageGeometry,
    },
    EnhanceFaces {
        input: &'a DeviceBuffer,
        geometry: ImageGeometry,
        faces: &'a [DetectedFace],
        options: &'a EnhanceOptions,
    },
    Style {
        input: &'a DeviceBuffer,
        geometry: ImageGeometry,
        options: &'a StyleOptions,
    },
    EnhanceColor {
        input: &'a DeviceBuffer,
        geometry: ImageGeometry,
        options: &'a EnhanceOptions,
    },
}

impl InferenceRequest<'_> {
    pub fn input(&self) -> &DeviceBuffer {
        match self {
            InferenceRequest::SuperResolution { input, .. }
            | InferenceRequest::Denoise { input, .. }
            | InferenceRequest::DetectObjects { input, .. }
            | InferenceRequest::Segment { input, .. }
            | InferenceRequest::DetectFaces { input, .. }
            | InferenceRequest::EnhanceFaces { input, .. }
            | InferenceRequest::Style { input, .. }
            | InferenceRequest::EnhanceColor { input, .. } => input,
        }
    }

    pub fn geometry(&self) -> ImageGeometry {
        match self {
            InferenceRequest::SuperResolution { geometry, .. }
            | InferenceRequest::Denoise { geometry, .. }
            | InferenceRequest::DetectObjects { geometry, .. }
            | InferenceRequest::Segment { geometry, .. }
            | InferenceRequest::DetectFaces { geometry, .. }
            | InferenceRequest::EnhanceFaces { geometry, .. }
            | InferenceRequest::Style { geometry, .. }
            | InferenceRequest::EnhanceColor { geometry, .. } => *geometry,
        }
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            InferenceRequest::SuperResolution { .. } => "super_resolution",
            InferenceRequest::Denoise { .. } => "denoise",
            InferenceRequest::DetectObjects { .. } => "detect_objects",
            InferenceRequest::Segment { .. } => "segment",
            InferenceRequest::DetectFaces { .. } => "detect_faces",
            InferenceRequest::EnhanceFaces { .. } => "enhance_faces",
            InferenceRequest::Style { .. } => "apply_style",
            InferenceRequest::EnhanceColor { .. } => "enhance_color",
        }
    }
}

/// Result of a session run. Detection outputs are unfiltered proposals;
/// the registry applies the confidence threshold.
pub enum InferenceOutput {
    Image {
        buffer: DeviceBuffer,
        geometry: ImageGeometry,
    },
    Objects(Vec<DetectedObject>),
    Masks(Vec<SegmentationMask>),
    Faces(Vec<DetectedFace>),
}

/// A loaded model, owned by the registry slot for its [`ModelType`].
pub trait ModelSession: Send {
    fn run(
        &mut self,
        request: InferenceRequest<'_>,
        progress: &mut ProgressReporter<'_>,
    ) -> Result<InferenceOutput>;
}

/// Factory for model sessions, registered under a stable id that
/// manifests refer to.
pub trait InferenceBackend: Send + Sync {
    fn id(&self) -> &'static str;

    fn load(&self, model_type: ModelType, entry: &ModelEntry) -> Result<Box<dyn ModelSession>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_defaults_fill_missing_fields() {
        let entry: ModelEntry = serde_json::from_str(r#"{"name":"sr-x2"}"#).unwrap();
        assert_eq!(entry.backend, "reference");
        assert_eq!(entry.channels, 3);
        assert_eq!(entry.version, "1.0");
        entry.validate().unwrap();
    }

    #[test]
    fn manifest_rejects_mismatched_normalization() {
        let mut entry = ModelEntry::new("bad");
        entry.mean = vec![0.5, 0.5];
        assert!(entry.validate().is_err());
        entry.mean.clear();
        entry.std = vec![1.0, 0.0, 1.0];
        assert!(entry.validate().is_err());
    }

    #[test]
    fn model_type_parses_kebab_and_snake() {
        assert_eq!(
            "super-resolution".parse::<ModelType>().unwrap(),
            ModelType::SuperResolution
        );
        assert_eq!("denoise".parse::<ModelType>().unwrap(), ModelType::Denoise);
        assert!("upscale".parse::<ModelType>().is_err());
    }
}
