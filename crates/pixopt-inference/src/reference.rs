//! Built-in `reference` backend: classical image processing standing in
//! for each model type. Every call runs as a device program on the
//! context that owns its input buffer.

use std::sync::Arc;

use tracing::debug;

use pixopt_core::backend::{
    InferenceBackend, InferenceOutput, InferenceRequest, ModelEntry, ModelSession, ModelType,
};
use pixopt_core::callbacks::ProgressReporter;
use pixopt_core::context::DeviceBuffer;
use pixopt_core::error::{OptimizerError, Result};
use pixopt_core::types::ImageGeometry;

use crate::filters;

pub const BACKEND_ID: &str = "reference";

#[derive(Clone, Copy, Debug, Default)]
pub struct ReferenceBackend;

impl InferenceBackend for ReferenceBackend {
    fn id(&self) -> &'static str {
        BACKEND_ID
    }

    fn load(&self, model_type: ModelType, entry: &ModelEntry) -> Result<Box<dyn ModelSession>> {
        let tuning = Tuning {
            sharpen: entry.param_f32("sharpen").unwrap_or(0.35).clamp(0.0, 2.0),
            min_area: entry.param_f32("min_area").unwrap_or(0.002).clamp(0.0, 1.0),
        };
        debug!(%model_type, model = %entry.name, ?tuning, "Reference session created");
        Ok(Box::new(ReferenceSession { model_type, tuning }))
    }
}

#[derive(Clone, Copy, Debug)]
struct Tuning {
    /// Unsharp amount after super-resolution.
    sharpen: f32,
    /// Smallest region, as a fraction of the raster, that detectors report.
    min_area: f32,
}

struct ReferenceSession {
    model_type: ModelType,
    tuning: Tuning,
}

fn serves(model_type: ModelType, request: &InferenceRequest<'_>) -> bool {
    matches!(
        (model_type, request),
        (ModelType::SuperResolution, InferenceRequest::SuperResolution { .. })
            | (ModelType::Denoise, InferenceRequest::Denoise { .. })
            | (ModelType::ObjectDetection, InferenceRequest::DetectObjects { .. })
            | (ModelType::Segmentation, InferenceRequest::Segment { .. })
            | (ModelType::FaceEnhance, InferenceRequest::DetectFaces { .. })
            | (ModelType::FaceEnhance, InferenceRequest::EnhanceFaces { .. })
            | (ModelType::StyleTransfer, InferenceRequest::Style { .. })
            | (ModelType::ColorEnhance, InferenceRequest::EnhanceColor { .. })
    )
}

/// Image-to-image program with a possibly different output geometry.
fn image_program(
    kernel: &'static str,
    input: &DeviceBuffer,
    geometry: ImageGeometry,
    mut f: impl FnMut(&[u8]) -> Result<(Vec<u8>, ImageGeometry)>,
) -> Result<InferenceOutput> {
    let ctx = Arc::clone(input.context());
    let mut out_geometry = None;
    let buffer = ctx.execute(kernel, &[input], &mut |bufs| {
        let (pixels, g) = f(&bufs[0][..geometry.byte_size()])?;
        out_geometry = Some(g);
        Ok(pixels)
    })?;
    let geometry =
        out_geometry.ok_or_else(|| OptimizerError::Inference(format!("{kernel} did not run")))?;
    Ok(InferenceOutput::Image { buffer, geometry })
}

/// Read-only program that returns host-side results.
fn analysis_program<T>(
    kernel: &'static str,
    input: &DeviceBuffer,
    geometry: ImageGeometry,
    mut f: impl FnMut(&[u8]) -> Vec<T>,
) -> Result<Vec<T>> {
    let mut found = Vec::new();
    input.context().analyze(kernel, input, &mut |bytes| {
        found = f(&bytes[..geometry.byte_size()]);
        Ok(())
    })?;
    Ok(found)
}

impl ModelSession for ReferenceSession {
    fn run(
        &mut self,
        request: InferenceRequest<'_>,
        progress: &mut ProgressReporter<'_>,
    ) -> Result<InferenceOutput> {
        if !serves(self.model_type, &request) {
            return Err(OptimizerError::Inference(format!(
                "{} session cannot serve {}",
                self.model_type,
                request.kind()
            )));
        }
        let geometry = request.geometry();
        filters::check_layout(geometry)?;
        progress.report(0.0);
        let tuning = self.tuning;

        let output = match request {
            InferenceRequest::SuperResolution { input, scale, .. } => {
                image_program("super_resolution", input, geometry, |px| {
                    filters::upscale(px, geometry, scale, tuning.sharpen)
                })?
            }
            InferenceRequest::Denoise {
                input, strength, ..
            } => image_program("denoise", input, geometry, |px| {
                Ok((filters::denoise(px, geometry, strength), geometry))
            })?,
            InferenceRequest::DetectObjects { input, .. } => InferenceOutput::Objects(
                analysis_program("detect_objects", input, geometry, |px| {
                    filters::detect_regions(px, geometry, tuning.min_area)
                })?,
            ),
            InferenceRequest::Segment { input, .. } => InferenceOutput::Masks(analysis_program(
                "segment",
                input,
                geometry,
                |px| filters::segment(px, geometry),
            )?),
            InferenceRequest::DetectFaces { input, .. } => InferenceOutput::Faces(
                analysis_program("detect_faces", input, geometry, |px| {
                    filters::detect_faces(px, geometry, tuning.min_area)
                })?,
            ),
            InferenceRequest::EnhanceFaces {
                input,
                faces,
                options,
                ..
            } => image_program("enhance_faces", input, geometry, |px| {
                Ok((filters::enhance_faces(px, geometry, faces, options), geometry))
            })?,
            InferenceRequest::Style { input, options, .. } => {
                image_program("apply_style", input, geometry, |px| {
                    Ok((filters::apply_style(px, geometry, options)?, geometry))
                })?
            }
            InferenceRequest::EnhanceColor { input, options, .. } => {
                image_program("enhance_color", input, geometry, |px| {
                    Ok((filters::enhance_color(px, geometry, options), geometry))
                })?
            }
        };
        progress.report(1.0);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pixopt_core::context::Residency;
    use pixopt_core::types::ColorSpace;
    use pixopt_device::{BackendPreference, open_preferred};

    #[test]
    fn session_refuses_foreign_requests() {
        let ctx = open_preferred(BackendPreference::Host, 0).unwrap();
        let g = ImageGeometry::new(2, 2, ColorSpace::Gray);
        let mut input = ctx.allocate(4, Residency::Device).unwrap();
        ctx.upload(&mut input, &[1, 2, 3, 4]).unwrap();
        let mut session = ReferenceBackend
            .load(ModelType::Denoise, &ModelEntry::new("dn"))
            .unwrap();
        let err = session
            .run(
                InferenceRequest::Segment {
                    input: &input,
                    geometry: g,
                },
                &mut ProgressReporter::silent(),
            )
            .err()
            .unwrap();
        assert_eq!(err.code(), pixopt_core::error::ErrorCode::Gpu);
    }
}
