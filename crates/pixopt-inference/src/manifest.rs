//! JSON model manifests.
//!
//! ```json
//! { "name": "sr-x2", "version": "1.2", "backend": "reference",
//!   "model_type": "super_resolution", "params": { "sharpen": 0.4 } }
//! ```

use std::path::Path;

use tracing::debug;

use pixopt_core::backend::{ModelEntry, ModelType};
use pixopt_core::error::{OptimizerError, Result};

/// Read and validate a manifest. A declared `model_type` must match the
/// slot it is being loaded into.
pub fn load_manifest(path: &Path, model_type: ModelType) -> Result<ModelEntry> {
    let text = std::fs::read_to_string(path).map_err(|e| OptimizerError::file_io(path, e))?;
    let mut entry = parse_manifest(&text)?;
    if let Some(declared) = entry.model_type {
        if declared != model_type {
            return Err(OptimizerError::InvalidParam(format!(
                "manifest {} declares a {declared} model, cannot load it as {model_type}",
                path.display()
            )));
        }
    }
    entry.source = Some(path.to_path_buf());
    debug!(
        path = %path.display(),
        name = %entry.name,
        backend = %entry.backend,
        "Loaded model manifest"
    );
    Ok(entry)
}

pub fn parse_manifest(text: &str) -> Result<ModelEntry> {
    let entry: ModelEntry = serde_json::from_str(text)
        .map_err(|e| OptimizerError::InvalidParam(format!("malformed model manifest: {e}")))?;
    entry.validate()?;
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pixopt_core::error::ErrorCode;
    use std::io::Write;

    #[test]
    fn missing_manifest_is_file_io() {
        let err =
            load_manifest(Path::new("/nonexistent/model.json"), ModelType::Denoise).unwrap_err();
        assert_eq!(err.code(), ErrorCode::FileIo);
    }

    #[test]
    fn slot_mismatch_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"name":"dn","model_type":"denoise"}}"#).unwrap();
        let err = load_manifest(file.path(), ModelType::StyleTransfer).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParam);
        let entry = load_manifest(file.path(), ModelType::Denoise).unwrap();
        assert_eq!(entry.source.as_deref(), Some(file.path()));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(parse_manifest(r#"{"name":"x","weights":"a.onnx"}"#).is_err());
    }
}
