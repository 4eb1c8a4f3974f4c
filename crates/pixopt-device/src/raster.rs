//! Interleaved 8-bit raster helpers shared by the kernels and codecs.

use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageBuffer, Luma, Rgb, Rgba};
use rayon::prelude::*;

use pixopt_core::error::{OptimizerError, Result};
use pixopt_core::types::{ColorSpace, ImageGeometry};

// ─── Pixel conversion ───────────────────────────────────────────────────────

#[inline]
fn to_rgba(px: &[u8], from: ColorSpace) -> [u8; 4] {
    match from {
        ColorSpace::Rgb => [px[0], px[1], px[2], 255],
        ColorSpace::Rgba => [px[0], px[1], px[2], px[3]],
        ColorSpace::Gray => [px[0], px[0], px[0], 255],
        ColorSpace::Cmyk => {
            let k = 255 - u32::from(px[3]);
            let ch = |c: u8| ((255 - u32::from(c)) * k / 255) as u8;
            [ch(px[0]), ch(px[1]), ch(px[2]), 255]
        }
    }
}

/// BT.601 luma, rounded.
#[inline]
pub fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((299 * u32::from(r) + 587 * u32::from(g) + 114 * u32::from(b) + 500) / 1000) as u8
}

#[inline]
fn from_rgba(px: [u8; 4], to: ColorSpace, out: &mut [u8]) {
    let [r, g, b, _] = px;
    match to {
        ColorSpace::Rgb => out.copy_from_slice(&[r, g, b]),
        ColorSpace::Rgba => out.copy_from_slice(&px),
        ColorSpace::Gray => out[0] = luma(r, g, b),
        ColorSpace::Cmyk => {
            let max = u32::from(r.max(g).max(b));
            if max == 0 {
                out.copy_from_slice(&[0, 0, 0, 255]);
                return;
            }
            let ch = |c: u8| ((max - u32::from(c)) * 255 / max) as u8;
            out.copy_from_slice(&[ch(r), ch(g), ch(b), (255 - max) as u8]);
        }
    }
}

/// Convert an interleaved raster between layouts. Alpha is dropped when
/// the target has none and set opaque when the source has none.
pub fn convert(src: &[u8], from: ColorSpace, to: ColorSpace) -> Vec<u8> {
    if from == to {
        return src.to_vec();
    }
    let (cin, cout) = (from.channels(), to.channels());
    let pixels = src.len() / cin;
    let mut out = vec![0u8; pixels * cout];
    out.par_chunks_exact_mut(cout)
        .zip(src.par_chunks_exact(cin))
        .for_each(|(dst, px)| from_rgba(to_rgba(px, from), to, dst));
    out
}

/// RGBA8 copy of a raster, as delivered to preview sinks.
pub fn to_preview(src: &[u8], colorspace: ColorSpace) -> Vec<u8> {
    convert(src, colorspace, ColorSpace::Rgba)
}

pub fn check_len(kernel: &'static str, raster: &[u8], geometry: ImageGeometry) -> Result<()> {
    if raster.len() < geometry.byte_size() {
        return Err(OptimizerError::kernel(
            kernel,
            format!(
                "raster holds {} bytes, {geometry} needs {}",
                raster.len(),
                geometry.byte_size()
            ),
        ));
    }
    Ok(())
}

// ─── image interop ──────────────────────────────────────────────────────────

/// Wrap a raster as a [`DynamicImage`]. CMYK is converted to RGB since no
/// encoder accepts it.
pub fn to_dynamic(raster: &[u8], geometry: ImageGeometry) -> Result<DynamicImage> {
    check_len("to_dynamic", raster, geometry)?;
    let (w, h) = (geometry.width, geometry.height);
    let pixels = raster[..geometry.byte_size()].to_vec();
    let bad = || OptimizerError::kernel("to_dynamic", format!("raster does not match {geometry}"));
    let image = match geometry.colorspace {
        ColorSpace::Rgb => {
            DynamicImage::ImageRgb8(ImageBuffer::from_raw(w, h, pixels).ok_or_else(bad)?)
        }
        ColorSpace::Rgba => {
            DynamicImage::ImageRgba8(ImageBuffer::from_raw(w, h, pixels).ok_or_else(bad)?)
        }
        ColorSpace::Gray => {
            DynamicImage::ImageLuma8(ImageBuffer::from_raw(w, h, pixels).ok_or_else(bad)?)
        }
        ColorSpace::Cmyk => {
            let rgb = convert(&pixels, ColorSpace::Cmyk, ColorSpace::Rgb);
            DynamicImage::ImageRgb8(ImageBuffer::from_raw(w, h, rgb).ok_or_else(bad)?)
        }
    };
    Ok(image)
}

/// Flatten a decoded image into an 8-bit raster, keeping alpha and colour
/// where present.
pub fn from_dynamic(image: DynamicImage) -> (Vec<u8>, ImageGeometry) {
    let (w, h) = (image.width(), image.height());
    let color = image.color();
    let (bytes, colorspace) = match (color.has_color(), color.has_alpha()) {
        (false, false) => (image.into_luma8().into_raw(), ColorSpace::Gray),
        (true, false) => (image.into_rgb8().into_raw(), ColorSpace::Rgb),
        (_, true) => (image.into_rgba8().into_raw(), ColorSpace::Rgba),
    };
    (bytes, ImageGeometry::new(w, h, colorspace))
}

// ─── Resampling ─────────────────────────────────────────────────────────────

fn resample<P>(
    raster: &[u8],
    geometry: ImageGeometry,
    w: u32,
    h: u32,
    filter: FilterType,
) -> Result<Vec<u8>>
where
    P: image::Pixel<Subpixel = u8> + 'static,
{
    let view: ImageBuffer<P, &[u8]> =
        ImageBuffer::from_raw(geometry.width, geometry.height, &raster[..geometry.byte_size()])
            .ok_or_else(|| {
                OptimizerError::kernel("resize", format!("raster does not match {geometry}"))
            })?;
    Ok(imageops::resize(&view, w, h, filter).into_raw())
}

/// Resample to `width`x`height`. Both target dimensions must be non-zero.
pub fn resize(
    raster: &[u8],
    geometry: ImageGeometry,
    width: u32,
    height: u32,
    filter: FilterType,
) -> Result<Vec<u8>> {
    if width == 0 || height == 0 || geometry.is_empty() {
        return Err(OptimizerError::InvalidGeometry {
            kernel: "resize",
            width,
            height,
        });
    }
    check_len("resize", raster, geometry)?;
    match geometry.colorspace {
        ColorSpace::Gray => resample::<Luma<u8>>(raster, geometry, width, height, filter),
        ColorSpace::Rgb => resample::<Rgb<u8>>(raster, geometry, width, height, filter),
        ColorSpace::Rgba | ColorSpace::Cmyk => {
            resample::<Rgba<u8>>(raster, geometry, width, height, filter)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gray_round_trip_through_rgb() {
        let gray = vec![0u8, 128, 255];
        let rgb = convert(&gray, ColorSpace::Gray, ColorSpace::Rgb);
        assert_eq!(rgb, vec![0, 0, 0, 128, 128, 128, 255, 255, 255]);
        assert_eq!(convert(&rgb, ColorSpace::Rgb, ColorSpace::Gray), gray);
    }

    #[test]
    fn cmyk_primaries() {
        let rgb = vec![255, 0, 0, 0, 0, 0, 255, 255, 255];
        let cmyk = convert(&rgb, ColorSpace::Rgb, ColorSpace::Cmyk);
        assert_eq!(&cmyk[0..4], &[0, 255, 255, 0]);
        assert_eq!(&cmyk[4..8], &[0, 0, 0, 255]);
        assert_eq!(&cmyk[8..12], &[0, 0, 0, 0]);
        assert_eq!(convert(&cmyk, ColorSpace::Cmyk, ColorSpace::Rgb), rgb);
    }

    #[test]
    fn rgba_to_rgb_drops_alpha() {
        let rgba = vec![10, 20, 30, 40];
        assert_eq!(convert(&rgba, ColorSpace::Rgba, ColorSpace::Rgb), vec![10, 20, 30]);
    }

    #[test]
    fn resize_rejects_zero_area() {
        let g = ImageGeometry::new(2, 2, ColorSpace::Rgb);
        let err = resize(&[0; 12], g, 0, 1, FilterType::Triangle).unwrap_err();
        assert_eq!(err.code(), pixopt_core::error::ErrorCode::Gpu);
    }

    #[test]
    fn resize_produces_target_size() {
        let g = ImageGeometry::new(4, 2, ColorSpace::Rgba);
        let out = resize(&[200; 32], g, 2, 1, FilterType::Triangle).unwrap();
        assert_eq!(out.len(), 2 * 4);
        assert!(out.iter().all(|&v| v.abs_diff(200) <= 1));
    }
}
