//! Active output-format registry.
//!
//! Built once at init and read-only afterwards; every request is gated
//! on it before any file I/O or device allocation happens.

use crate::error::{OptimizerError, Result};
use crate::types::ImageFormat;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FormatRegistry {
    active: Vec<ImageFormat>,
}

impl FormatRegistry {
    /// Formats active without explicit configuration.
    pub const DEFAULT_FORMATS: [ImageFormat; 4] = [
        ImageFormat::Jpeg,
        ImageFormat::Png,
        ImageFormat::Webp,
        ImageFormat::Avif,
    ];

    pub fn with_defaults() -> Self {
        Self {
            active: Self::DEFAULT_FORMATS.to_vec(),
        }
    }

    pub fn empty() -> Self {
        Self { active: Vec::new() }
    }

    /// Activate `format`. Returns `false` if it was already active.
    pub fn enable(&mut self, format: ImageFormat) -> bool {
        if self.contains(format) {
            return false;
        }
        self.active.push(format);
        true
    }

    #[inline]
    pub fn contains(&self, format: ImageFormat) -> bool {
        self.active.contains(&format)
    }

    /// Gate a request on the active set.
    pub fn check(&self, format: ImageFormat) -> Result<()> {
        if self.contains(format) {
            Ok(())
        } else {
            Err(OptimizerError::UnsupportedFormat(format!(
                "{format} is not an active output format"
            )))
        }
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ImageFormat> + '_ {
        self.active.iter().copied()
    }

    /// Caller-owned copy of the active set.
    pub fn to_vec(&self) -> Vec<ImageFormat> {
        self.active.clone()
    }
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
