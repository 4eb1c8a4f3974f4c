//! Data model shared by every stage: formats, colorspaces, processing
//! options, and image descriptions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::backend::{EnhanceOptions, ModelType, StyleOptions};
use crate::error::{OptimizerError, Result};

// ─── Formats ────────────────────────────────────────────────────────────────

/// Output container formats known to the optimizer.
///
/// Knowing a format does not make it active; see
/// [`FormatRegistry`](crate::formats::FormatRegistry).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Png,
    Webp,
    Avif,
    Heic,
}

impl ImageFormat {
    pub const ALL: [ImageFormat; 5] = [
        ImageFormat::Jpeg,
        ImageFormat::Png,
        ImageFormat::Webp,
        ImageFormat::Avif,
        ImageFormat::Heic,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Png => "png",
            ImageFormat::Webp => "webp",
            ImageFormat::Avif => "avif",
            ImageFormat::Heic => "heic",
        }
    }

    /// File extension used for outputs written in this format.
    pub const fn extension(self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            other => other.name(),
        }
    }

    pub const fn mime_type(self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
            ImageFormat::Webp => "image/webp",
            ImageFormat::Avif => "image/avif",
            ImageFormat::Heic => "image/heic",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
            "png" => Some(ImageFormat::Png),
            "webp" => Some(ImageFormat::Webp),
            "avif" => Some(ImageFormat::Avif),
            "heic" | "heif" => Some(ImageFormat::Heic),
            _ => None,
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ImageFormat {
    type Err = OptimizerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_extension(s).ok_or_else(|| OptimizerError::UnsupportedFormat(s.to_string()))
    }
}

// ─── Colorspaces ────────────────────────────────────────────────────────────

/// Interleaved 8-bit pixel layouts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorSpace {
    Rgb,
    Rgba,
    Gray,
    Cmyk,
}

impl ColorSpace {
    pub const ALL: [ColorSpace; 4] = [
        ColorSpace::Rgb,
        ColorSpace::Rgba,
        ColorSpace::Gray,
        ColorSpace::Cmyk,
    ];

    #[inline]
    pub const fn channels(self) -> usize {
        match self {
            ColorSpace::Rgb => 3,
            ColorSpace::Rgba | ColorSpace::Cmyk => 4,
            ColorSpace::Gray => 1,
        }
    }

    #[inline]
    pub const fn bits_per_pixel(self) -> u32 {
        self.channels() as u32 * 8
    }

    pub const fn name(self) -> &'static str {
        match self {
            ColorSpace::Rgb => "rgb",
            ColorSpace::Rgba => "rgba",
            ColorSpace::Gray => "gray",
            ColorSpace::Cmyk => "cmyk",
        }
    }
}

impl fmt::Display for ColorSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ColorSpace {
    type Err = OptimizerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|cs| cs.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| OptimizerError::InvalidParam(format!("unknown colorspace `{s}`")))
    }
}

/// Encoder effort level. Ordering follows effort.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CompressionLevel {
    None = 0,
    Fast = 1,
    #[default]
    Balanced = 2,
    Max = 3,
}

impl CompressionLevel {
    pub const fn name(self) -> &'static str {
        match self {
            CompressionLevel::None => "none",
            CompressionLevel::Fast => "fast",
            CompressionLevel::Balanced => "balanced",
            CompressionLevel::Max => "max",
        }
    }
}

impl fmt::Display for CompressionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CompressionLevel {
    type Err = OptimizerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "0" => Ok(CompressionLevel::None),
            "fast" | "1" => Ok(CompressionLevel::Fast),
            "balanced" | "2" => Ok(CompressionLevel::Balanced),
            "max" | "3" => Ok(CompressionLevel::Max),
            _ => Err(OptimizerError::InvalidParam(format!(
                "unknown compression level `{s}`"
            ))),
        }
    }
}

// ─── Geometry ───────────────────────────────────────────────────────────────

/// Dimensions and pixel layout of a raster held in a device buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageGeometry {
    pub width: u32,
    pub height: u32,
    pub colorspace: ColorSpace,
}

impl ImageGeometry {
    pub const fn new(width: u32, height: u32, colorspace: ColorSpace) -> Self {
        Self {
            width,
            height,
            colorspace,
        }
    }

    #[inline]
    pub const fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Bytes of an interleaved raster with this geometry.
    #[inline]
    pub const fn byte_size(&self) -> usize {
        self.pixel_count() * self.colorspace.channels()
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub const fn with_size(self, width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            colorspace: self.colorspace,
        }
    }

    pub const fn with_colorspace(self, colorspace: ColorSpace) -> Self {
        Self {
            width: self.width,
            height: self.height,
            colorspace,
        }
    }

    /// Largest size with the same aspect ratio that fits the bounds.
    /// A bound of zero is unbounded. Never upscales and never returns a
    /// zero dimension for a non-empty source.
    pub fn fit_within(&self, max_width: u32, max_height: u32) -> (u32, u32) {
        let (w, h) = (self.width, self.height);
        if w == 0 || h == 0 {
            return (w, h);
        }
        let sx = if max_width > 0 && w > max_width {
            f64::from(max_width) / f64::from(w)
        } else {
            1.0
        };
        let sy = if max_height > 0 && h > max_height {
            f64::from(max_height) / f64::from(h)
        } else {
            1.0
        };
        let scale = sx.min(sy);
        if scale >= 1.0 {
            return (w, h);
        }
        let fit = |dim: u32, bound: u32| {
            let scaled = (f64::from(dim) * scale).round().max(1.0) as u32;
            if bound > 0 { scaled.min(bound) } else { scaled }
        };
        (fit(w, max_width), fit(h, max_height))
    }
}

impl fmt::Display for ImageGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.colorspace)
    }
}

// ─── Processing options ─────────────────────────────────────────────────────

/// AI stages applied between colour conversion and compression.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Enhancements {
    /// Upscale factor for the super-resolution stage.
    pub super_resolution: Option<u32>,
    /// Denoise strength in `[0, 1]`.
    pub denoise: Option<f32>,
    pub face_enhance: bool,
    pub color_enhance: bool,
    pub style: Option<StyleOptions>,
    /// Tuning shared by the face and colour enhancement stages.
    pub tuning: EnhanceOptions,
    /// Minimum face confidence considered by the face stage.
    pub face_confidence: Option<f32>,
}

impl Enhancements {
    pub const DEFAULT_FACE_CONFIDENCE: f32 = 0.5;

    pub fn is_empty(&self) -> bool {
        self.super_resolution.is_none()
            && self.denoise.is_none()
            && !self.face_enhance
            && !self.color_enhance
            && self.style.is_none()
    }

    /// Model types the enabled stages need, in execution order.
    pub fn required_models(&self) -> Vec<ModelType> {
        let mut models = Vec::new();
        if self.denoise.is_some() {
            models.push(ModelType::Denoise);
        }
        if self.super_resolution.is_some() {
            models.push(ModelType::SuperResolution);
        }
        if self.face_enhance {
            models.push(ModelType::FaceEnhance);
        }
        if self.color_enhance {
            models.push(ModelType::ColorEnhance);
        }
        if self.style.is_some() {
            models.push(ModelType::StyleTransfer);
        }
        models
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(scale) = self.super_resolution {
            if !(2..=8).contains(&scale) {
                return Err(OptimizerError::InvalidParam(format!(
                    "super-resolution scale must be within 2..=8, got {scale}"
                )));
            }
        }
        if let Some(strength) = self.denoise {
            check_unit("denoise strength", strength)?;
        }
        if let Some(conf) = self.face_confidence {
            check_unit("face confidence", conf)?;
        }
        if let Some(style) = &self.style {
            style.validate()?;
        }
        self.tuning.validate()
    }
}

pub(crate) fn check_unit(what: &str, value: f32) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(OptimizerError::InvalidParam(format!(
            "{what} must be within [0, 1], got {value}"
        )))
    }
}

/// Per-request processing options.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingOptions {
    pub output_format: ImageFormat,
    pub compression: CompressionLevel,
    pub colorspace: ColorSpace,
    /// Encoder quality, 1..=100.
    pub quality: u8,
    /// 0 = unbounded.
    pub max_width: u32,
    /// 0 = unbounded.
    pub max_height: u32,
    pub preserve_metadata: bool,
    pub use_gpu: bool,
    /// Worker threads for pixel kernels; 0 = automatic.
    pub thread_count: usize,
    pub enable_preview: bool,
    pub enhancements: Enhancements,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            output_format: ImageFormat::Webp,
            compression: CompressionLevel::Balanced,
            colorspace: ColorSpace::Rgb,
            quality: 85,
            max_width: 0,
            max_height: 0,
            preserve_metadata: true,
            use_gpu: true,
            thread_count: 0,
            enable_preview: false,
            enhancements: Enhancements::default(),
        }
    }
}

impl ProcessingOptions {
    pub const MAX_THREADS: usize = 256;

    pub fn validate(&self) -> Result<()> {
        if !(1..=100).contains(&self.quality) {
            return Err(OptimizerError::InvalidParam(format!(
                "quality must be within 1..=100, got {}",
                self.quality
            )));
        }
        if self.thread_count > Self::MAX_THREADS {
            return Err(OptimizerError::InvalidParam(format!(
                "thread_count {} exceeds {}",
                self.thread_count,
                Self::MAX_THREADS
            )));
        }
        self.enhancements.validate()
    }
}

// ─── Image description ──────────────────────────────────────────────────────

/// Metadata blobs carried by an image. XMP is never populated by the
/// bundled codecs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageMetadata {
    pub exif: Option<Vec<u8>>,
    pub icc: Option<Vec<u8>>,
    pub xmp: Option<Vec<u8>>,
}

impl ImageMetadata {
    pub fn is_empty(&self) -> bool {
        self.exif.is_none() && self.icc.is_none() && self.xmp.is_none()
    }
}

/// Result of probing an encoded image without decoding its pixels.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub colorspace: ColorSpace,
    pub bits_per_pixel: u32,
    pub file_size: u64,
    /// `None` when the container is readable but is not an output format
    /// (GIF, BMP, TIFF).
    pub format: Option<ImageFormat>,
    /// Container name as detected from the leading bytes.
    pub container: &'static str,
    pub metadata: ImageMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let opts = ProcessingOptions::default();
        assert_eq!(opts.output_format, ImageFormat::Webp);
        assert_eq!(opts.compression, CompressionLevel::Balanced);
        assert_eq!(opts.colorspace, ColorSpace::Rgb);
        assert_eq!(opts.quality, 85);
        assert!(opts.preserve_metadata && opts.use_gpu);
        assert!(!opts.enable_preview);
        assert!(opts.enhancements.is_empty());
        opts.validate().expect("defaults are valid");
    }

    #[test]
    fn quality_out_of_range_is_invalid_param() {
        let opts = ProcessingOptions {
            quality: 0,
            ..Default::default()
        };
        assert_eq!(
            opts.validate().unwrap_err().code(),
            crate::error::ErrorCode::InvalidParam
        );
    }

    #[test]
    fn fit_preserves_aspect_and_treats_zero_as_unbounded() {
        let g = ImageGeometry::new(4000, 3000, ColorSpace::Rgb);
        assert_eq!(g.fit_within(0, 0), (4000, 3000));
        assert_eq!(g.fit_within(2000, 0), (2000, 1500));
        assert_eq!(g.fit_within(0, 600), (800, 600));
        assert_eq!(g.fit_within(1000, 1000), (1000, 750));
        assert_eq!(g.fit_within(8000, 8000), (4000, 3000));
    }

    #[test]
    fn fit_never_collapses_to_zero() {
        let g = ImageGeometry::new(10_000, 1, ColorSpace::Gray);
        assert_eq!(g.fit_within(100, 0), (100, 1));
    }

    #[test]
    fn required_models_follow_stage_order() {
        let enh = Enhancements {
            super_resolution: Some(2),
            denoise: Some(0.3),
            color_enhance: true,
            ..Default::default()
        };
        assert_eq!(
            enh.required_models(),
            vec![
                ModelType::Denoise,
                ModelType::SuperResolution,
                ModelType::ColorEnhance
            ]
        );
    }

    #[test]
    fn options_deserialize_with_partial_fields() {
        let opts: ProcessingOptions =
            serde_json::from_str(r#"{"output_format":"png","quality":90}"#).unwrap();
        assert_eq!(opts.output_format, ImageFormat::Png);
        assert_eq!(opts.quality, 90);
        assert_eq!(opts.colorspace, ColorSpace::Rgb);
        assert!(serde_json::from_str::<ProcessingOptions>(r#"{"bogus":1}"#).is_err());
    }

    #[test]
    fn format_parsing_accepts_extension_aliases() {
        assert_eq!("JPG".parse::<ImageFormat>().unwrap(), ImageFormat::Jpeg);
        assert_eq!(ImageFormat::Jpeg.extension(), "jpg");
        assert!("gif".parse::<ImageFormat>().is_err());
    }
}
