//! Container sniffing, header probing, decoding, and encoding.
//!
//! Decoding accepts every container the `image` crate reads (JPEG, PNG,
//! WebP, GIF, BMP, TIFF, ...). Encoding covers the output formats; HEIC is
//! recognised but has no codec in this build.

use std::io::Cursor;

use image::codecs::avif::AvifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{self, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::{ColorType, DynamicImage, ImageDecoder, ImageEncoder, ImageError, ImageReader};
use tracing::debug;

use pixopt_core::error::{OptimizerError, Result};
use pixopt_core::types::{
    ColorSpace, CompressionLevel, ImageFormat, ImageGeometry, ImageInfo, ImageMetadata,
};

use crate::raster;

/// Container identified from leading bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sniffed {
    pub container: &'static str,
    pub format: Option<ImageFormat>,
    reader: Option<image::ImageFormat>,
}

const HEIF_BRANDS: [&[u8; 4]; 6] = [b"heic", b"heix", b"hevc", b"hevx", b"mif1", b"msf1"];

fn is_heif(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[4..8] == b"ftyp" && HEIF_BRANDS.iter().any(|b| &bytes[8..12] == *b)
}

pub fn sniff(bytes: &[u8]) -> Result<Sniffed> {
    if is_heif(bytes) {
        return Ok(Sniffed {
            container: "heic",
            format: Some(ImageFormat::Heic),
            reader: None,
        });
    }
    let reader = image::guess_format(bytes)
        .map_err(|_| OptimizerError::UnsupportedFormat("unrecognised image container".into()))?;
    let (container, format) = match reader {
        image::ImageFormat::Jpeg => ("jpeg", Some(ImageFormat::Jpeg)),
        image::ImageFormat::Png => ("png", Some(ImageFormat::Png)),
        image::ImageFormat::WebP => ("webp", Some(ImageFormat::Webp)),
        image::ImageFormat::Avif => ("avif", Some(ImageFormat::Avif)),
        other => (
            other.extensions_str().first().copied().unwrap_or("unknown"),
            None,
        ),
    };
    Ok(Sniffed {
        container,
        format,
        reader: Some(reader),
    })
}

fn map_image_error(kernel: &'static str, err: ImageError) -> OptimizerError {
    match err {
        ImageError::Unsupported(e) => OptimizerError::UnsupportedFormat(e.to_string()),
        ImageError::Limits(e) => OptimizerError::Memory {
            bytes: 0,
            reason: e.to_string(),
        },
        other => OptimizerError::kernel(kernel, other),
    }
}

fn colorspace_of(color: ColorType) -> ColorSpace {
    match (color.has_color(), color.has_alpha()) {
        (false, false) => ColorSpace::Gray,
        (true, false) => ColorSpace::Rgb,
        (_, true) => ColorSpace::Rgba,
    }
}

fn open_decoder<'a>(
    kernel: &'static str,
    bytes: &'a [u8],
) -> Result<(Sniffed, impl ImageDecoder + 'a)> {
    let sniffed = sniff(bytes)?;
    let Some(reader) = sniffed.reader else {
        return Err(OptimizerError::UnsupportedFormat(format!(
            "no {} decoder in this build",
            sniffed.container
        )));
    };
    let decoder = ImageReader::with_format(Cursor::new(bytes), reader)
        .into_decoder()
        .map_err(|e| map_image_error(kernel, e))?;
    Ok((sniffed, decoder))
}

/// Read dimensions, layout, and metadata without decoding pixels.
pub fn probe(bytes: &[u8]) -> Result<ImageInfo> {
    let (sniffed, mut decoder) = open_decoder("probe", bytes)?;
    let (width, height) = decoder.dimensions();
    let color = decoder.color_type();
    let icc = decoder
        .icc_profile()
        .map_err(|e| map_image_error("probe", e))?;
    let exif = decoder
        .exif_metadata()
        .map_err(|e| map_image_error("probe", e))?;
    Ok(ImageInfo {
        width,
        height,
        colorspace: colorspace_of(color),
        bits_per_pixel: u32::from(color.bits_per_pixel()),
        file_size: bytes.len() as u64,
        format: sniffed.format,
        container: sniffed.container,
        metadata: ImageMetadata {
            exif,
            icc,
            xmp: None,
        },
    })
}

/// Fully decoded image.
#[derive(Debug)]
pub struct Decoded {
    pub raster: Vec<u8>,
    pub geometry: ImageGeometry,
    pub format: Option<ImageFormat>,
    pub container: &'static str,
    pub metadata: ImageMetadata,
}

pub fn decode(bytes: &[u8]) -> Result<Decoded> {
    let (sniffed, mut decoder) = open_decoder("decompress", bytes)?;
    let icc = decoder
        .icc_profile()
        .map_err(|e| map_image_error("decompress", e))?;
    let exif = decoder
        .exif_metadata()
        .map_err(|e| map_image_error("decompress", e))?;
    let image = DynamicImage::from_decoder(decoder).map_err(|e| map_image_error("decompress", e))?;
    let (raster, geometry) = raster::from_dynamic(image);
    debug!(container = sniffed.container, %geometry, "Decoded image");
    Ok(Decoded {
        raster,
        geometry,
        format: sniffed.format,
        container: sniffed.container,
        metadata: ImageMetadata {
            exif,
            icc,
            xmp: None,
        },
    })
}

// ─── Encoding ───────────────────────────────────────────────────────────────

/// Encoder settings for one compress call.
#[derive(Clone, Debug, PartialEq)]
pub struct EncodeParams {
    pub format: ImageFormat,
    pub quality: u8,
    pub compression: CompressionLevel,
    /// ICC profile to embed, when the encoder supports it.
    pub icc_profile: Option<Vec<u8>>,
    /// Raw EXIF block to embed, when the encoder supports it.
    pub exif: Option<Vec<u8>>,
}

impl EncodeParams {
    pub fn new(format: ImageFormat, quality: u8, compression: CompressionLevel) -> Self {
        Self {
            format,
            quality,
            compression,
            icc_profile: None,
            exif: None,
        }
    }
}

fn png_settings(level: CompressionLevel) -> (png::CompressionType, png::FilterType) {
    match level {
        CompressionLevel::None => (png::CompressionType::Fast, png::FilterType::NoFilter),
        CompressionLevel::Fast => (png::CompressionType::Fast, png::FilterType::Sub),
        CompressionLevel::Balanced => (png::CompressionType::Default, png::FilterType::Adaptive),
        CompressionLevel::Max => (png::CompressionType::Best, png::FilterType::Adaptive),
    }
}

/// AVIF encoder speed: 1 is slowest/smallest, 10 fastest.
fn avif_speed(level: CompressionLevel) -> u8 {
    match level {
        CompressionLevel::None => 10,
        CompressionLevel::Fast => 8,
        CompressionLevel::Balanced => 6,
        CompressionLevel::Max => 3,
    }
}

/// Hand ICC and EXIF blocks to the encoder. A format that cannot carry a
/// block skips it; the encode itself still succeeds.
fn attach_metadata<E: ImageEncoder>(encoder: &mut E, params: &EncodeParams) {
    if let Some(icc) = &params.icc_profile {
        if let Err(e) = encoder.set_icc_profile(icc.clone()) {
            debug!(format = %params.format, error = %e, "Encoder dropped ICC profile");
        }
    }
    if let Some(exif) = &params.exif {
        if let Err(e) = encoder.set_exif_metadata(exif.clone()) {
            debug!(format = %params.format, error = %e, "Encoder dropped EXIF block");
        }
    }
}

/// Encode a raster into `params.format`.
pub fn encode(raster: &[u8], geometry: ImageGeometry, params: &EncodeParams) -> Result<Vec<u8>> {
    let image = raster::to_dynamic(raster, geometry)?;
    let mut out = Vec::new();
    let written = match params.format {
        ImageFormat::Jpeg => {
            let image = if image.color().has_alpha() {
                DynamicImage::ImageRgb8(image.to_rgb8())
            } else {
                image
            };
            let quality = match params.compression {
                CompressionLevel::None => 100,
                _ => params.quality,
            };
            let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
            attach_metadata(&mut encoder, params);
            image.write_with_encoder(encoder)
        }
        ImageFormat::Png => {
            let (compression, filter) = png_settings(params.compression);
            let mut encoder = PngEncoder::new_with_quality(&mut out, compression, filter);
            attach_metadata(&mut encoder, params);
            image.write_with_encoder(encoder)
        }
        ImageFormat::Webp => {
            let mut encoder = WebPEncoder::new_lossless(&mut out);
            attach_metadata(&mut encoder, params);
            image.write_with_encoder(encoder)
        }
        ImageFormat::Avif => {
            let image = if image.color().has_color() {
                image
            } else {
                DynamicImage::ImageRgb8(image.to_rgb8())
            };
            let mut encoder = AvifEncoder::new_with_speed_quality(
                &mut out,
                avif_speed(params.compression),
                params.quality,
            );
            attach_metadata(&mut encoder, params);
            image.write_with_encoder(encoder)
        }
        ImageFormat::Heic => {
            return Err(OptimizerError::UnsupportedFormat(
                "no HEIC encoder in this build".into(),
            ));
        }
    };
    written.map_err(|e| map_image_error("compress", e))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(w: u32, h: u32) -> (Vec<u8>, ImageGeometry) {
        let g = ImageGeometry::new(w, h, ColorSpace::Rgb);
        let raster = (0..g.byte_size()).map(|i| (i * 7 % 251) as u8).collect();
        (raster, g)
    }

    #[test]
    fn png_round_trip_is_lossless() {
        let (raster, g) = gradient(9, 5);
        let params = EncodeParams::new(ImageFormat::Png, 85, CompressionLevel::Max);
        let bytes = encode(&raster, g, &params).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.geometry, g);
        assert_eq!(decoded.raster, raster);
        assert_eq!(decoded.format, Some(ImageFormat::Png));
    }

    #[test]
    fn jpeg_drops_alpha_and_probes() {
        let g = ImageGeometry::new(8, 8, ColorSpace::Rgba);
        let raster = vec![128u8; g.byte_size()];
        let params = EncodeParams::new(ImageFormat::Jpeg, 80, CompressionLevel::Balanced);
        let bytes = encode(&raster, g, &params).unwrap();
        let info = probe(&bytes).unwrap();
        assert_eq!((info.width, info.height), (8, 8));
        assert_eq!(info.colorspace, ColorSpace::Rgb);
        assert_eq!(info.format, Some(ImageFormat::Jpeg));
        assert_eq!(info.file_size, bytes.len() as u64);
        assert!(info.metadata.xmp.is_none());
    }

    #[test]
    fn heic_is_recognised_but_not_decodable() {
        let mut bytes = vec![0, 0, 0, 24];
        bytes.extend_from_slice(b"ftypheic");
        bytes.extend_from_slice(&[0; 16]);
        assert_eq!(sniff(&bytes).unwrap().format, Some(ImageFormat::Heic));
        assert_eq!(
            decode(&bytes).unwrap_err().code(),
            pixopt_core::error::ErrorCode::UnsupportedFormat
        );
    }

    #[test]
    fn garbage_is_unsupported() {
        let err = decode(b"definitely not an image").unwrap_err();
        assert_eq!(err.code(), pixopt_core::error::ErrorCode::UnsupportedFormat);
    }

    // Big-endian TIFF header with an empty IFD.
    const EXIF: &[u8] = b"MM\0*\0\0\0\x08\0\0\0\0\0\0";

    fn jpeg_with_exif() -> Vec<u8> {
        let (raster, g) = gradient(8, 8);
        let mut params = EncodeParams::new(ImageFormat::Jpeg, 90, CompressionLevel::Balanced);
        params.exif = Some(EXIF.to_vec());
        encode(&raster, g, &params).unwrap()
    }

    #[test]
    fn exif_follows_jpeg_into_png_and_webp() {
        let source = decode(&jpeg_with_exif()).unwrap();
        let exif = source.metadata.exif.clone().expect("JPEG carries EXIF");
        assert!(exif.windows(4).any(|w| w == b"MM\0*"));

        for format in [ImageFormat::Png, ImageFormat::Webp] {
            let mut params = EncodeParams::new(format, 90, CompressionLevel::Fast);
            params.exif = source.metadata.exif.clone();
            let bytes = encode(&source.raster, source.geometry, &params).unwrap();
            assert_eq!(probe(&bytes).unwrap().metadata.exif.as_ref(), Some(&exif), "{format}");

            let plain = EncodeParams::new(format, 90, CompressionLevel::Fast);
            let bytes = encode(&source.raster, source.geometry, &plain).unwrap();
            assert!(probe(&bytes).unwrap().metadata.exif.is_none(), "{format}");
        }
    }

    #[test]
    fn icc_profile_survives_png() {
        let (raster, g) = gradient(4, 4);
        let mut params = EncodeParams::new(ImageFormat::Png, 85, CompressionLevel::Fast);
        params.icc_profile = Some(vec![7u8; 64]);
        let bytes = encode(&raster, g, &params).unwrap();
        assert_eq!(probe(&bytes).unwrap().metadata.icc, Some(vec![7u8; 64]));
    }
}
