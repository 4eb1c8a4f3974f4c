//! The kernel/model chain behind both pipelines.
//!
//! Every intermediate raster is an owned [`DeviceBuffer`]; replacing one
//! frees the previous buffer, and an early `?` return frees whatever is
//! still held. No device memory outlives the call.

use std::sync::Arc;

use tracing::{debug, info};

use pixopt_core::backend::ModelType;
use pixopt_core::callbacks::{Callbacks, ProgressReporter};
use pixopt_core::context::{DeviceBuffer, Residency};
use pixopt_core::error::{OptimizerError, Result};
use pixopt_core::types::{Enhancements, ImageGeometry, ProcessingOptions};
use pixopt_device::codec::EncodeParams;
use pixopt_device::{Parallelism, kernels, raster};
use pixopt_inference::{Enhanced, ModelRegistry};

use crate::optimizer::Subsystems;

// Progress milestones.
const UPLOADED: f32 = 0.05;
const DECODED: f32 = 0.15;
const RESIZED: f32 = 0.3;
const CONVERTED: f32 = 0.4;
const ENHANCED: f32 = 0.85;
const COMPRESSED: f32 = 0.95;

/// Working raster and its geometry.
struct Raster {
    buffer: DeviceBuffer,
    geometry: ImageGeometry,
}

pub(crate) fn run(
    subsystems: &mut Subsystems,
    input: &[u8],
    options: &ProcessingOptions,
    cbs: &mut Callbacks<'_>,
) -> Result<Vec<u8>> {
    // Fail fast before any allocation.
    for model_type in options.enhancements.required_models() {
        if !subsystems.models.is_loaded(model_type) {
            return Err(OptimizerError::InvalidParam(format!(
                "{model_type} stage requested but no {model_type} model is loaded"
            )));
        }
    }
    let ctx = if options.use_gpu {
        Arc::clone(&subsystems.device)
    } else {
        Arc::clone(&subsystems.host)
    };
    let par = Parallelism::with_threads(options.thread_count)?;
    debug!(
        context = ctx.backend_name(),
        threads = par.threads(),
        "Pipeline starting"
    );
    cbs.progress(0.0);

    let mut encoded = ctx.allocate(input.len(), Residency::Device)?;
    ctx.upload(&mut encoded, input)?;
    cbs.progress(UPLOADED);

    let (buffer, decoded) = kernels::decompress(&encoded, &par)?;
    encoded.free()?;
    let mut work = Raster {
        buffer,
        geometry: decoded.geometry,
    };
    info!(container = decoded.container, geometry = %work.geometry, "Decoded input");
    cbs.progress(DECODED);
    preview(cbs, options, "decode", &work)?;

    if fit(&mut work, options, &par)? {
        preview(cbs, options, "resize", &work)?;
    }
    cbs.progress(RESIZED);

    if work.geometry.colorspace != options.colorspace {
        work.buffer =
            kernels::color_convert(&work.buffer, work.geometry, options.colorspace, &par)?;
        work.geometry = work.geometry.with_colorspace(options.colorspace);
        preview(cbs, options, "color_convert", &work)?;
    }
    cbs.progress(CONVERTED);

    enhance(&mut subsystems.models, &mut work, options, &par, cbs)?;
    cbs.progress(ENHANCED);

    let mut params = EncodeParams::new(options.output_format, options.quality, options.compression);
    if options.preserve_metadata {
        params.icc_profile = decoded.metadata.icc;
        params.exif = decoded.metadata.exif;
    }
    let output = kernels::compress(&work.buffer, work.geometry, &params, &par)?;
    drop(work);
    cbs.progress(COMPRESSED);

    let bytes = ctx.download_to_vec(&output)?;
    cbs.progress(1.0);
    debug!(out_bytes = bytes.len(), "Pipeline complete");
    Ok(bytes)
}

/// Resize into the `max_width` x `max_height` box, keeping aspect ratio.
fn fit(work: &mut Raster, options: &ProcessingOptions, par: &Parallelism) -> Result<bool> {
    let g = work.geometry;
    let (width, height) = g.fit_within(options.max_width, options.max_height);
    if (width, height) == (g.width, g.height) {
        return Ok(false);
    }
    work.buffer = kernels::resize(&work.buffer, g, width, height, par)?;
    work.geometry = g.with_size(width, height);
    Ok(true)
}

fn preview(
    cbs: &mut Callbacks<'_>,
    options: &ProcessingOptions,
    stage: &'static str,
    work: &Raster,
) -> Result<()> {
    if !options.enable_preview || !cbs.wants_preview(stage) {
        return Ok(());
    }
    let g = work.geometry;
    let host = work.buffer.context().download_to_vec(&work.buffer)?;
    let pixels = host
        .get(..g.byte_size())
        .ok_or_else(|| OptimizerError::Kernel {
            kernel: "preview",
            message: format!("{stage}: {} bytes cannot hold {g}", host.len()),
        })?;
    let rgba = raster::to_preview(pixels, g.colorspace);
    cbs.preview(stage, &rgba, g.width, g.height);
    Ok(())
}

/// Progress sink for one AI stage, mapped onto `[start, end]`.
fn window<'r, 'a>(
    reporter: &'r mut ProgressReporter<'a>,
    start: f32,
    end: f32,
) -> impl FnMut(f32) + 'r
where
    'a: 'r,
{
    move |v| reporter.report_within(start, end, v)
}

/// AI stages in [`Enhancements::required_models`] order, sharing the
/// progress range between colour conversion and compression.
fn enhance(
    models: &mut ModelRegistry,
    work: &mut Raster,
    options: &ProcessingOptions,
    par: &Parallelism,
    cbs: &mut Callbacks<'_>,
) -> Result<()> {
    let enh: &Enhancements = &options.enhancements;
    let stages = enh.required_models();
    if stages.is_empty() {
        return Ok(());
    }
    let span = (ENHANCED - CONVERTED) / stages.len() as f32;

    for (i, model_type) in stages.into_iter().enumerate() {
        let start = CONVERTED + span * i as f32;
        let end = start + span;
        let g = work.geometry;
        let out: Option<Enhanced> = match model_type {
            ModelType::Denoise => {
                let strength = enh.denoise.unwrap_or_default();
                Some(models.denoise(
                    &work.buffer,
                    g,
                    strength,
                    Some(&mut window(cbs.reporter(), start, end)),
                )?)
            }
            ModelType::SuperResolution => {
                let scale = enh.super_resolution.unwrap_or(2);
                Some(models.super_resolution(
                    &work.buffer,
                    g,
                    scale,
                    Some(&mut window(cbs.reporter(), start, end)),
                )?)
            }
            ModelType::FaceEnhance => {
                let mid = start + span / 2.0;
                let threshold = enh
                    .face_confidence
                    .unwrap_or(Enhancements::DEFAULT_FACE_CONFIDENCE);
                let faces = models.detect_faces(
                    &work.buffer,
                    g,
                    threshold,
                    Some(&mut window(cbs.reporter(), start, mid)),
                )?;
                if faces.is_empty() {
                    debug!("No faces above threshold; face stage skipped");
                    None
                } else {
                    debug!(faces = faces.len(), "Enhancing faces");
                    Some(models.enhance_faces(
                        &work.buffer,
                        g,
                        faces.as_slice(),
                        &enh.tuning,
                        Some(&mut window(cbs.reporter(), mid, end)),
                    )?)
                }
            }
            ModelType::ColorEnhance => Some(models.enhance_color(
                &work.buffer,
                g,
                &enh.tuning,
                Some(&mut window(cbs.reporter(), start, end)),
            )?),
            ModelType::StyleTransfer => {
                let style = enh.style.as_ref().ok_or_else(|| {
                    OptimizerError::InvalidParam("style stage without style options".into())
                })?;
                Some(models.apply_style(
                    &work.buffer,
                    g,
                    style,
                    Some(&mut window(cbs.reporter(), start, end)),
                )?)
            }
            other => {
                return Err(OptimizerError::InvalidParam(format!(
                    "{other} is not a pipeline stage"
                )));
            }
        };
        if let Some(Enhanced { buffer, geometry }) = out {
            work.buffer = buffer;
            work.geometry = geometry;
        }
        if model_type == ModelType::SuperResolution && fit(work, options, par)? {
            debug!(geometry = %work.geometry, "Upscaled output refitted to bounds");
        }
        cbs.progress(end);
        preview(cbs, options, model_type.name(), work)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn milestones_are_increasing() {
        let marks = [0.0, UPLOADED, DECODED, RESIZED, CONVERTED, ENHANCED, COMPRESSED, 1.0];
        assert!(marks.windows(2).all(|w| w[0] < w[1]));
    }
}
