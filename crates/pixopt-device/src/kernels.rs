//! Device-side pipeline stages.
//!
//! Each stage reads device buffers and produces a new device buffer via
//! [`DeviceContext::execute`], or [`DeviceContext::execute_native`] when a
//! backend may carry its own kernel; inputs are never modified in place.
//! Geometry is validated before the program is launched, so a rejected
//! request allocates nothing.

use std::sync::Arc;

use image::imageops::FilterType;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::instrument;

use pixopt_core::context::{DeviceBuffer, DeviceContext, NativeOp};
use pixopt_core::error::{OptimizerError, Result};
use pixopt_core::types::{ColorSpace, ImageFormat, ImageGeometry, ImageMetadata};

use crate::codec::{self, EncodeParams};
use crate::raster;

// ─── Parallelism ────────────────────────────────────────────────────────────

/// Thread pool used by pixel loops inside device programs.
#[derive(Debug, Default)]
pub struct Parallelism {
    pool: Option<ThreadPool>,
}

impl Parallelism {
    /// Use rayon's global pool.
    pub fn global() -> Self {
        Self { pool: None }
    }

    /// Dedicated pool with `threads` workers; 0 means the global pool.
    pub fn with_threads(threads: usize) -> Result<Self> {
        if threads == 0 {
            return Ok(Self::global());
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("pixopt-kernel-{i}"))
            .build()
            .map_err(|e| OptimizerError::Thread(e.to_string()))?;
        Ok(Self { pool: Some(pool) })
    }

    pub fn threads(&self) -> usize {
        self.pool
            .as_ref()
            .map_or_else(rayon::current_num_threads, ThreadPool::current_num_threads)
    }

    /// Run `f` inside this pool.
    pub fn run<R: Send>(&self, f: impl FnOnce() -> R + Send) -> R {
        match &self.pool {
            Some(pool) => pool.install(f),
            None => f(),
        }
    }
}

// ─── Stages ─────────────────────────────────────────────────────────────────

/// What the decompress stage learned about its input.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodeInfo {
    pub geometry: ImageGeometry,
    pub format: Option<ImageFormat>,
    pub container: &'static str,
    pub metadata: ImageMetadata,
}

fn ctx_of(buf: &DeviceBuffer) -> Arc<DeviceContext> {
    Arc::clone(buf.context())
}

/// Decode the encoded bytes in `input` into an interleaved raster.
#[instrument(skip_all, fields(bytes = input.size()))]
pub fn decompress(input: &DeviceBuffer, par: &Parallelism) -> Result<(DeviceBuffer, DecodeInfo)> {
    let ctx = ctx_of(input);
    let mut info = None;
    let raster = ctx.execute("decompress", &[input], &mut |bufs| {
        let decoded = par.run(|| codec::decode(bufs[0]))?;
        info = Some(DecodeInfo {
            geometry: decoded.geometry,
            format: decoded.format,
            container: decoded.container,
            metadata: decoded.metadata,
        });
        Ok(decoded.raster)
    })?;
    let info = info.ok_or_else(|| OptimizerError::kernel("decompress", "program did not run"))?;
    Ok((raster, info))
}

/// Resample to `width`x`height`. A zero-area target fails before launch.
#[instrument(skip_all, fields(from = %geometry, width = width, height = height))]
pub fn resize(
    input: &DeviceBuffer,
    geometry: ImageGeometry,
    width: u32,
    height: u32,
    par: &Parallelism,
) -> Result<DeviceBuffer> {
    if width == 0 || height == 0 || geometry.is_empty() {
        return Err(OptimizerError::InvalidGeometry {
            kernel: "resize",
            width,
            height,
        });
    }
    check_input("resize", input, geometry)?;
    let op = NativeOp::Resize {
        from: geometry,
        width,
        height,
    };
    ctx_of(input).execute_native("resize", op, input, &mut |bufs| {
        par.run(|| raster::resize(bufs[0], geometry, width, height, FilterType::Lanczos3))
    })
}

#[instrument(skip_all, fields(from = %geometry, to = %target))]
pub fn color_convert(
    input: &DeviceBuffer,
    geometry: ImageGeometry,
    target: ColorSpace,
    par: &Parallelism,
) -> Result<DeviceBuffer> {
    check_input("color_convert", input, geometry)?;
    let len = geometry.byte_size();
    let op = NativeOp::ColorConvert {
        from: geometry,
        to: target,
    };
    ctx_of(input).execute_native("color_convert", op, input, &mut |bufs| {
        Ok(par.run(|| raster::convert(&bufs[0][..len], geometry.colorspace, target)))
    })
}

/// Encode the raster in `input` into an encoded byte stream.
#[instrument(skip_all, fields(from = %geometry, format = %params.format))]
pub fn compress(
    input: &DeviceBuffer,
    geometry: ImageGeometry,
    params: &EncodeParams,
    par: &Parallelism,
) -> Result<DeviceBuffer> {
    if params.format == ImageFormat::Heic {
        return Err(OptimizerError::UnsupportedFormat(
            "no HEIC encoder in this build".into(),
        ));
    }
    check_input("compress", input, geometry)?;
    ctx_of(input).execute("compress", &[input], &mut |bufs| {
        par.run(|| codec::encode(bufs[0], geometry, params))
    })
}

fn check_input(kernel: &'static str, input: &DeviceBuffer, geometry: ImageGeometry) -> Result<()> {
    if geometry.is_empty() {
        return Err(OptimizerError::InvalidGeometry {
            kernel,
            width: geometry.width,
            height: geometry.height,
        });
    }
    if input.size() < geometry.byte_size() {
        return Err(OptimizerError::InvalidParam(format!(
            "{kernel}: buffer of {} bytes cannot hold {geometry}",
            input.size()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BackendPreference, open_preferred};
    use pixopt_core::context::Residency;
    use pixopt_core::error::ErrorCode;
    use pixopt_core::types::CompressionLevel;

    fn upload(ctx: &Arc<DeviceContext>, bytes: &[u8]) -> DeviceBuffer {
        let mut buf = ctx.allocate(bytes.len(), Residency::Device).unwrap();
        ctx.upload(&mut buf, bytes).unwrap();
        buf
    }

    #[test]
    fn zero_area_resize_allocates_nothing() {
        let ctx = open_preferred(BackendPreference::Host, 0).unwrap();
        let g = ImageGeometry::new(2, 2, ColorSpace::Gray);
        let input = upload(&ctx, &[1, 2, 3, 4]);
        let before = ctx.allocation_counts().allocations;
        let err = resize(&input, g, 0, 5, &Parallelism::global()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Gpu);
        assert_eq!(ctx.allocation_counts().allocations, before);
    }

    #[test]
    fn stages_chain_and_leave_inputs_intact() {
        let ctx = open_preferred(BackendPreference::Host, 0).unwrap();
        let par = Parallelism::with_threads(2).unwrap();
        assert_eq!(par.threads(), 2);

        let g = ImageGeometry::new(6, 4, ColorSpace::Rgb);
        let pixels: Vec<u8> = (0..g.byte_size()).map(|i| (i * 13 % 256) as u8).collect();
        let params = EncodeParams::new(ImageFormat::Png, 90, CompressionLevel::Fast);
        let encoded = codec::encode(&pixels, g, &params).unwrap();
        let input = upload(&ctx, &encoded);

        let (raster, info) = decompress(&input, &par).unwrap();
        assert_eq!(info.geometry, g);
        assert_eq!(ctx.download_to_vec(&raster).unwrap(), pixels);

        let gray = color_convert(&raster, g, ColorSpace::Gray, &par).unwrap();
        assert_eq!(gray.size(), 24);
        assert_eq!(ctx.download_to_vec(&raster).unwrap(), pixels);

        let small = resize(&gray, g.with_colorspace(ColorSpace::Gray), 3, 2, &par).unwrap();
        assert_eq!(small.size(), 6);

        let out = compress(
            &small,
            ImageGeometry::new(3, 2, ColorSpace::Gray),
            &EncodeParams::new(ImageFormat::Webp, 90, CompressionLevel::Balanced),
            &par,
        )
        .unwrap();
        let bytes = ctx.download_to_vec(&out).unwrap();
        assert_eq!(codec::sniff(&bytes).unwrap().format, Some(ImageFormat::Webp));
    }

    #[test]
    fn undersized_buffer_is_invalid_param() {
        let ctx = open_preferred(BackendPreference::Host, 0).unwrap();
        let input = upload(&ctx, &[0; 4]);
        let g = ImageGeometry::new(2, 2, ColorSpace::Rgb);
        let err =
            color_convert(&input, g, ColorSpace::Gray, &Parallelism::global()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParam);
    }
}
