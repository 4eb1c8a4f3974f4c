//! Orchestrator configuration, read from JSON.
//!
//! ```json
//! {
//!   "backend": "auto",
//!   "device": 0,
//!   "memory_limit_mib": 2048,
//!   "strict_memory_limit": false,
//!   "enable_formats": ["heic"],
//!   "models": { "super_resolution": "models/sr-x2.json" }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use pixopt_core::backend::ModelType;
use pixopt_core::error::{OptimizerError, Result};
use pixopt_core::formats::FormatRegistry;
use pixopt_core::types::ImageFormat;
use pixopt_device::BackendPreference;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OptimizerConfig {
    /// Device backend to open at init.
    pub backend: BackendPreference,
    /// Device ordinal selected at init.
    pub device: usize,
    /// Device memory budget in MiB. `None` is unlimited.
    pub memory_limit_mib: Option<usize>,
    /// Fail allocations over the budget instead of warning.
    pub strict_memory_limit: bool,
    /// Formats enabled on top of the default set.
    pub enable_formats: Vec<ImageFormat>,
    /// Model manifests loaded at init, one per type.
    pub models: BTreeMap<ModelType, PathBuf>,
    /// Reject device programs that stage through host memory. Needs the
    /// `audit-no-host-copies` feature.
    pub strict_no_host_copies: bool,
}

impl OptimizerConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| OptimizerError::InvalidParam(format!("malformed configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| OptimizerError::file_io(path, e))?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.memory_limit_mib == Some(0) {
            return Err(OptimizerError::InvalidParam(
                "memory_limit_mib must be positive; omit it for no limit".into(),
            ));
        }
        if let Some((ty, _)) = self
            .models
            .iter()
            .find(|(_, path)| path.as_os_str().is_empty())
        {
            return Err(OptimizerError::InvalidParam(format!(
                "empty manifest path for {ty} model"
            )));
        }
        require_host_copy_audit_if_strict(self.strict_no_host_copies)
    }

    /// The active format set: defaults plus `enable_formats`.
    pub fn format_registry(&self) -> FormatRegistry {
        let mut formats = FormatRegistry::with_defaults();
        for &format in &self.enable_formats {
            formats.enable(format);
        }
        formats
    }

    pub fn memory_limit_bytes(&self) -> Option<usize> {
        self.memory_limit_mib.map(|mib| mib.saturating_mul(1024 * 1024))
    }
}

fn require_host_copy_audit_if_strict(strict: bool) -> Result<()> {
    if strict && !cfg!(feature = "audit-no-host-copies") {
        return Err(OptimizerError::InvalidParam(
            "strict_no_host_copies requires the `audit-no-host-copies` feature".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pixopt_core::error::ErrorCode;

    #[test]
    fn empty_object_is_the_default() {
        assert_eq!(
            OptimizerConfig::from_json_str("{}").unwrap(),
            OptimizerConfig::default()
        );
    }

    #[test]
    fn parses_models_and_formats() {
        let config = OptimizerConfig::from_json_str(
            r#"{"backend":"host","memory_limit_mib":64,"enable_formats":["heic"],
                "models":{"denoise":"dn.json"}}"#,
        )
        .unwrap();
        assert_eq!(config.backend, BackendPreference::Host);
        assert_eq!(config.memory_limit_bytes(), Some(64 << 20));
        assert_eq!(config.models[&ModelType::Denoise], PathBuf::from("dn.json"));
        let formats = config.format_registry();
        assert!(formats.contains(ImageFormat::Heic));
        assert_eq!(formats.len(), FormatRegistry::DEFAULT_FORMATS.len() + 1);
    }

    #[test]
    fn rejects_unknown_fields_and_zero_limit() {
        let err = OptimizerConfig::from_json_str(r#"{"vram":1}"#).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParam);
        let err = OptimizerConfig::from_json_str(r#"{"memory_limit_mib":0}"#).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParam);
    }

    #[test]
    fn missing_file_is_file_io() {
        let err =
            OptimizerConfig::from_json_file(Path::new("/nonexistent/pixopt.json")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::FileIo);
    }
}
