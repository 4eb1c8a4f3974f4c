//! Pixel algorithms behind the reference backend.
//!
//! Rasters are interleaved 8-bit RGB, RGBA, or gray. Alpha is carried
//! through untouched; only colour channels are filtered.

use image::imageops::FilterType;
use rayon::prelude::*;

use pixopt_core::backend::{EnhanceOptions, StyleOptions};
use pixopt_core::detection::{DetectedFace, DetectedObject, SegmentationMask};
use pixopt_core::error::{OptimizerError, Result};
use pixopt_core::types::{ColorSpace, ImageGeometry};
use pixopt_device::raster::{self, luma};

pub fn check_layout(geometry: ImageGeometry) -> Result<()> {
    if geometry.colorspace == ColorSpace::Cmyk {
        return Err(OptimizerError::InvalidParam(
            "reference models accept RGB, RGBA, or gray rasters, not CMYK".into(),
        ));
    }
    if geometry.is_empty() {
        return Err(OptimizerError::InvalidGeometry {
            kernel: "inference",
            width: geometry.width,
            height: geometry.height,
        });
    }
    Ok(())
}

/// Colour channels of a layout (alpha excluded).
#[inline]
fn color_channels(cs: ColorSpace) -> usize {
    match cs {
        ColorSpace::Rgba => 3,
        other => other.channels(),
    }
}

#[inline]
fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

// ─── Blur / sharpen ─────────────────────────────────────────────────────────

fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = (sigma * 3.0).ceil().max(1.0) as usize;
    let mut k: Vec<f32> = (0..=2 * radius)
        .map(|i| {
            let x = i as f32 - radius as f32;
            (-(x * x) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f32 = k.iter().sum();
    k.iter_mut().for_each(|v| *v /= sum);
    k
}

/// Separable gaussian blur: horizontal pass, then vertical pass.
pub fn gaussian_blur(src: &[u8], g: ImageGeometry, sigma: f32) -> Vec<u8> {
    let src = &src[..g.byte_size()];
    if sigma <= 0.0 {
        return src.to_vec();
    }
    let (w, h, c) = (g.width as usize, g.height as usize, g.colorspace.channels());
    let k = gaussian_kernel(sigma);
    let r = (k.len() / 2) as isize;
    let stride = w * c;

    let mut tmp = vec![0f32; src.len()];
    tmp.par_chunks_mut(stride).enumerate().for_each(|(y, row)| {
        let src_row = &src[y * stride..(y + 1) * stride];
        for x in 0..w {
            for ch in 0..c {
                let mut acc = 0.0;
                for (i, kv) in k.iter().enumerate() {
                    let xx = (x as isize + i as isize - r).clamp(0, w as isize - 1) as usize;
                    acc += kv * f32::from(src_row[xx * c + ch]);
                }
                row[x * c + ch] = acc;
            }
        }
    });

    let mut out = vec![0u8; src.len()];
    out.par_chunks_mut(stride).enumerate().for_each(|(y, row)| {
        for x in 0..w {
            for ch in 0..c {
                let mut acc = 0.0;
                for (i, kv) in k.iter().enumerate() {
                    let yy = (y as isize + i as isize - r).clamp(0, h as isize - 1) as usize;
                    acc += kv * tmp[yy * stride + x * c + ch];
                }
                row[x * c + ch] = clamp_u8(acc);
            }
        }
    });
    out
}

/// `src + amount * (src - blur(src))` on colour channels.
pub fn unsharp(src: &[u8], g: ImageGeometry, amount: f32, sigma: f32) -> Vec<u8> {
    let blurred = gaussian_blur(src, g, sigma);
    let (c, cc) = (g.colorspace.channels(), color_channels(g.colorspace));
    let mut out = src[..g.byte_size()].to_vec();
    out.par_chunks_mut(c)
        .zip(blurred.par_chunks(c))
        .for_each(|(px, b)| {
            for ch in 0..cc {
                let v = f32::from(px[ch]);
                px[ch] = clamp_u8(v + amount * (v - f32::from(b[ch])));
            }
        });
    out
}

/// Edge-aware smoothing: blend toward a blur where the local difference is
/// small, keep edges where it is large.
pub fn denoise(src: &[u8], g: ImageGeometry, strength: f32) -> Vec<u8> {
    let strength = strength.clamp(0.0, 1.0);
    if strength == 0.0 {
        return src[..g.byte_size()].to_vec();
    }
    let blurred = gaussian_blur(src, g, 0.6 + 1.8 * strength);
    let edge = 12.0 + 48.0 * strength;
    let (c, cc) = (g.colorspace.channels(), color_channels(g.colorspace));
    let mut out = src[..g.byte_size()].to_vec();
    out.par_chunks_mut(c)
        .zip(blurred.par_chunks(c))
        .for_each(|(px, b)| {
            for ch in 0..cc {
                let v = f32::from(px[ch]);
                let d = f32::from(b[ch]) - v;
                let w = strength * (-(d / edge).powi(2)).exp();
                px[ch] = clamp_u8(v + d * w);
            }
        });
    out
}

/// Bicubic upscale by an integer factor followed by a light unsharp mask.
pub fn upscale(
    src: &[u8],
    g: ImageGeometry,
    scale: u32,
    sharpen: f32,
) -> Result<(Vec<u8>, ImageGeometry)> {
    let (w, h) = (
        g.width.checked_mul(scale),
        g.height.checked_mul(scale),
    );
    let (Some(w), Some(h)) = (w, h) else {
        return Err(OptimizerError::InvalidParam(format!(
            "{scale}x upscale of {g} overflows"
        )));
    };
    let resized = raster::resize(src, g, w, h, FilterType::CatmullRom)?;
    let out_g = g.with_size(w, h);
    if sharpen <= 0.0 {
        return Ok((resized, out_g));
    }
    Ok((unsharp(&resized, out_g, sharpen, 1.0), out_g))
}

// ─── Analysis ───────────────────────────────────────────────────────────────

pub fn luma_plane(src: &[u8], g: ImageGeometry) -> Vec<u8> {
    let c = g.colorspace.channels();
    src[..g.byte_size()]
        .par_chunks(c)
        .map(|px| match g.colorspace {
            ColorSpace::Gray => px[0],
            _ => luma(px[0], px[1], px[2]),
        })
        .collect()
}

/// Otsu threshold and its separability (between-class / total variance).
pub fn otsu(plane: &[u8]) -> (u8, f32) {
    let mut hist = [0u64; 256];
    plane.iter().for_each(|&v| hist[v as usize] += 1);
    let total = plane.len() as f64;
    if total == 0.0 {
        return (128, 0.0);
    }
    let sum_all: f64 = hist.iter().enumerate().map(|(i, &n)| i as f64 * n as f64).sum();
    let mean = sum_all / total;
    let var_total: f64 = hist
        .iter()
        .enumerate()
        .map(|(i, &n)| (i as f64 - mean).powi(2) * n as f64)
        .sum::<f64>()
        / total;

    let (mut best_t, mut best_var) = (0u8, 0.0f64);
    let (mut w0, mut sum0) = (0.0f64, 0.0f64);
    for (t, &n) in hist.iter().enumerate() {
        w0 += n as f64;
        sum0 += t as f64 * n as f64;
        let w1 = total - w0;
        if w0 == 0.0 || w1 == 0.0 {
            continue;
        }
        let m0 = sum0 / w0;
        let m1 = (sum_all - sum0) / w1;
        let between = (w0 / total) * (w1 / total) * (m0 - m1).powi(2);
        if between > best_var {
            best_var = between;
            best_t = t as u8;
        }
    }
    let separability = if var_total > 0.0 { best_var / var_total } else { 0.0 };
    (best_t, separability as f32)
}

/// Connected component bounding box and area.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Component {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
    pub area: u32,
}

impl Component {
    pub fn width(&self) -> u32 {
        self.max_x - self.min_x + 1
    }

    pub fn height(&self) -> u32 {
        self.max_y - self.min_y + 1
    }

    pub fn fill_ratio(&self) -> f32 {
        self.area as f32 / (self.width() * self.height()) as f32
    }
}

/// 4-connected components of `mask` with at least `min_area` pixels,
/// largest first.
pub fn components(mask: &[bool], width: u32, height: u32, min_area: u32) -> Vec<Component> {
    let (w, h) = (width as usize, height as usize);
    let mut seen = vec![false; mask.len()];
    let mut stack = Vec::new();
    let mut found = Vec::new();
    for start in 0..w * h {
        if !mask[start] || seen[start] {
            continue;
        }
        seen[start] = true;
        stack.push(start);
        let (sx, sy) = ((start % w) as u32, (start / w) as u32);
        let mut comp = Component {
            min_x: sx,
            min_y: sy,
            max_x: sx,
            max_y: sy,
            area: 0,
        };
        while let Some(i) = stack.pop() {
            let (x, y) = (i % w, i / w);
            comp.area += 1;
            comp.min_x = comp.min_x.min(x as u32);
            comp.max_x = comp.max_x.max(x as u32);
            comp.min_y = comp.min_y.min(y as u32);
            comp.max_y = comp.max_y.max(y as u32);
            let mut visit = |j: usize| {
                if mask[j] && !seen[j] {
                    seen[j] = true;
                    stack.push(j);
                }
            };
            if x > 0 {
                visit(i - 1);
            }
            if x + 1 < w {
                visit(i + 1);
            }
            if y > 0 {
                visit(i - w);
            }
            if y + 1 < h {
                visit(i + w);
            }
        }
        if comp.area >= min_area {
            found.push(comp);
        }
    }
    found.sort_by(|a, b| b.area.cmp(&a.area));
    found
}

fn min_component_area(g: ImageGeometry, fraction: f32) -> u32 {
    ((g.pixel_count() as f32 * fraction) as u32).max(4)
}

/// Foreground mask: the Otsu class with fewer pixels.
fn foreground(plane: &[u8]) -> (Vec<bool>, f32, bool) {
    let (t, separability) = otsu(plane);
    let bright = plane.iter().filter(|&&v| v > t).count();
    let bright_is_fg = bright * 2 <= plane.len();
    let mask = plane
        .iter()
        .map(|&v| if bright_is_fg { v > t } else { v <= t })
        .collect();
    (mask, separability, bright_is_fg)
}

fn mean_over(plane: &[u8], mask: &[bool], want: bool) -> f32 {
    let (sum, n) = plane
        .iter()
        .zip(mask)
        .filter(|(_, m)| **m == want)
        .fold((0u64, 0u64), |(s, n), (&v, _)| (s + u64::from(v), n + 1));
    if n == 0 { 0.0 } else { sum as f32 / n as f32 }
}

/// Salient-region proposals: connected foreground regions after Otsu
/// thresholding, scored by contrast against the background and by size.
pub fn detect_regions(src: &[u8], g: ImageGeometry, min_area_fraction: f32) -> Vec<DetectedObject> {
    let plane = luma_plane(src, g);
    let (mask, separability, bright_is_fg) = foreground(&plane);
    let contrast = (mean_over(&plane, &mask, true) - mean_over(&plane, &mask, false)).abs() / 255.0;
    let class_name = if bright_is_fg { "bright_region" } else { "dark_region" };
    components(&mask, g.width, g.height, min_component_area(g, min_area_fraction))
        .into_iter()
        .map(|c| {
            let size = (c.area as f32 / g.pixel_count() as f32).sqrt().min(1.0);
            let confidence = (0.5 * contrast + 0.3 * separability + 0.2 * size).clamp(0.0, 1.0);
            DetectedObject {
                class_name: class_name.into(),
                confidence,
                x: c.min_x as f32,
                y: c.min_y as f32,
                width: c.width() as f32,
                height: c.height() as f32,
            }
        })
        .collect()
}

/// Foreground/background masks at raster resolution.
pub fn segment(src: &[u8], g: ImageGeometry) -> Vec<SegmentationMask> {
    let plane = luma_plane(src, g);
    let (mask, separability, _) = foreground(&plane);
    let to_bytes = |want: bool| -> Vec<u8> {
        mask.iter().map(|&m| if m == want { 255 } else { 0 }).collect()
    };
    vec![
        SegmentationMask {
            mask: to_bytes(true),
            width: g.width,
            height: g.height,
            class_name: "foreground".into(),
            confidence: separability,
        },
        SegmentationMask {
            mask: to_bytes(false),
            width: g.width,
            height: g.height,
            class_name: "background".into(),
            confidence: separability,
        },
    ]
}

/// Skin-tone test in YCbCr (BT.601).
#[inline]
fn is_skin(r: u8, g: u8, b: u8) -> bool {
    let (r, g, b) = (f32::from(r), f32::from(g), f32::from(b));
    let cb = 128.0 - 0.168_736 * r - 0.331_264 * g + 0.5 * b;
    let cr = 128.0 + 0.5 * r - 0.418_688 * g - 0.081_312 * b;
    (77.0..=127.0).contains(&cb) && (133.0..=173.0).contains(&cr)
}

fn skin_mask(src: &[u8], g: ImageGeometry) -> Vec<bool> {
    let c = g.colorspace.channels();
    src[..g.byte_size()]
        .par_chunks(c)
        .map(|px| is_skin(px[0], px[1], px[2]))
        .collect()
}

/// Canonical landmark positions inside a face box: eyes, nose tip, mouth
/// corners.
const LANDMARKS: [(f32, f32); 5] = [
    (0.3, 0.38),
    (0.7, 0.38),
    (0.5, 0.58),
    (0.35, 0.78),
    (0.65, 0.78),
];

/// Face proposals from skin-tone regions with a face-like shape. Gray
/// rasters carry no chroma and yield no proposals.
pub fn detect_faces(src: &[u8], g: ImageGeometry, min_area_fraction: f32) -> Vec<DetectedFace> {
    if g.colorspace == ColorSpace::Gray {
        return Vec::new();
    }
    let mask = skin_mask(src, g);
    components(&mask, g.width, g.height, min_component_area(g, min_area_fraction))
        .into_iter()
        .filter_map(|c| {
            let aspect = c.height() as f32 / c.width() as f32;
            if !(0.8..=2.0).contains(&aspect) {
                return None;
            }
            let shape = 1.0 - ((aspect - 1.3).abs() / 0.7).min(1.0);
            let confidence = (0.6 * c.fill_ratio() + 0.4 * shape).clamp(0.0, 1.0);
            let (x, y, w, h) = (
                c.min_x as f32,
                c.min_y as f32,
                c.width() as f32,
                c.height() as f32,
            );
            Some(DetectedFace {
                x,
                y,
                width: w,
                height: h,
                landmarks: LANDMARKS.iter().map(|(lx, ly)| (x + lx * w, y + ly * h)).collect(),
                confidence,
                attributes: None,
            })
        })
        .collect()
}

// ─── Enhancement ────────────────────────────────────────────────────────────

fn face_rect(face: &DetectedFace, g: ImageGeometry) -> Option<(usize, usize, usize, usize)> {
    let x0 = face.x.max(0.0).floor() as usize;
    let y0 = face.y.max(0.0).floor() as usize;
    let x1 = ((face.x + face.width).ceil().max(0.0) as usize).min(g.width as usize);
    let y1 = ((face.y + face.height).ceil().max(0.0) as usize).min(g.height as usize);
    (x0 < x1 && y0 < y1).then_some((x0, y0, x1, y1))
}

/// Denoise, sharpen, and optionally smooth skin and fix red eye inside
/// each face box. Pixels outside the boxes are copied unchanged.
pub fn enhance_faces(
    src: &[u8],
    g: ImageGeometry,
    faces: &[DetectedFace],
    opts: &EnhanceOptions,
) -> Vec<u8> {
    let src = &src[..g.byte_size()];
    let smoothed = denoise(src, g, opts.denoise_strength);
    let sharpened = if opts.sharpen_strength > 0.0 {
        unsharp(&smoothed, g, opts.sharpen_strength, 1.2)
    } else {
        smoothed
    };
    let skin_blur = if opts.fix_skin_tone && g.colorspace != ColorSpace::Gray {
        Some(gaussian_blur(src, g, 2.5))
    } else {
        None
    };

    let c = g.colorspace.channels();
    let cc = color_channels(g.colorspace);
    let w = g.width as usize;
    let mut out = src.to_vec();
    for face in faces {
        let Some((x0, y0, x1, y1)) = face_rect(face, g) else {
            continue;
        };
        for y in y0..y1 {
            for x in x0..x1 {
                let i = (y * w + x) * c;
                out[i..i + cc].copy_from_slice(&sharpened[i..i + cc]);
                if let Some(blur) = &skin_blur {
                    if is_skin(src[i], src[i + 1], src[i + 2]) {
                        for ch in 0..cc {
                            let v = (f32::from(out[i + ch]) + f32::from(blur[i + ch])) / 2.0;
                            out[i + ch] = clamp_u8(v);
                        }
                    }
                }
            }
        }
        if opts.fix_red_eye && g.colorspace != ColorSpace::Gray {
            let radius = (face.width.min(face.height) * 0.08).max(1.0);
            for &(ex, ey) in face.landmarks.iter().take(2) {
                fix_red_eye(&mut out, g, ex, ey, radius);
            }
        }
    }
    out
}

fn fix_red_eye(out: &mut [u8], g: ImageGeometry, cx: f32, cy: f32, radius: f32) {
    let c = g.colorspace.channels();
    let x0 = (cx - radius).floor().max(0.0) as u32;
    let y0 = (cy - radius).floor().max(0.0) as u32;
    let x1 = ((cx + radius).ceil() as u32).min(g.width.saturating_sub(1));
    let y1 = ((cy + radius).ceil() as u32).min(g.height.saturating_sub(1));
    for y in y0..=y1 {
        for x in x0..=x1 {
            let (dx, dy) = (x as f32 - cx, y as f32 - cy);
            if dx * dx + dy * dy > radius * radius {
                continue;
            }
            let i = (y as usize * g.width as usize + x as usize) * c;
            let (r, gr, b) = (out[i], out[i + 1], out[i + 2]);
            if f32::from(r) > 1.5 * f32::from(gr.max(b)) && r > 80 {
                out[i] = ((u16::from(gr) + u16::from(b)) / 2) as u8;
            }
        }
    }
}

/// Per-channel 1%/99% percentiles of colour channels.
fn percentiles(src: &[u8], g: ImageGeometry) -> Vec<(u8, u8)> {
    let (c, cc) = (g.colorspace.channels(), color_channels(g.colorspace));
    let n = g.pixel_count() as u64;
    (0..cc)
        .map(|ch| {
            let mut hist = [0u64; 256];
            src[..g.byte_size()].chunks_exact(c).for_each(|px| hist[px[ch] as usize] += 1);
            let pick = |target: u64| {
                let mut acc = 0u64;
                for (v, &count) in hist.iter().enumerate() {
                    acc += count;
                    if acc > target {
                        return v as u8;
                    }
                }
                255
            };
            (pick(n / 100), pick(n - n / 100 - 1))
        })
        .collect()
}

/// Levels stretch, exposure, contrast, and saturation.
pub fn enhance_color(src: &[u8], g: ImageGeometry, opts: &EnhanceOptions) -> Vec<u8> {
    let levels = percentiles(src, g);
    let strength = opts.color_enhance_strength;
    let exposure = 2f32.powf(opts.exposure_adjust);
    let contrast = 1.0 + opts.contrast_adjust;
    let saturation = 1.0 + 0.3 * strength;
    let (c, cc) = (g.colorspace.channels(), color_channels(g.colorspace));
    let mut out = src[..g.byte_size()].to_vec();
    out.par_chunks_mut(c).for_each(|px| {
        let mut v = [0f32; 3];
        for ch in 0..cc {
            let (lo, hi) = levels[ch];
            let x = f32::from(px[ch]);
            let stretched = if hi > lo {
                (x - f32::from(lo)) * 255.0 / f32::from(hi - lo)
            } else {
                x
            };
            let leveled = x + (stretched - x) * strength;
            v[ch] = ((leveled * exposure) - 128.0) * contrast + 128.0;
        }
        if cc == 3 {
            let y = 0.299 * v[0] + 0.587 * v[1] + 0.114 * v[2];
            for value in v.iter_mut() {
                *value = y + (*value - y) * saturation;
            }
        }
        for ch in 0..cc {
            px[ch] = clamp_u8(v[ch]);
        }
    });
    out
}

/// Named looks available to the style stage.
pub const STYLES: [&str; 7] = ["warm", "cool", "sepia", "mono", "noir", "vivid", "sketch"];

fn styled_pixel(style: &str, r: f32, gr: f32, b: f32) -> [f32; 3] {
    let y = 0.299 * r + 0.587 * gr + 0.114 * b;
    match style {
        "warm" => [r * 1.08 + 8.0, gr * 1.02, b * 0.88],
        "cool" => [r * 0.9, gr * 1.0, b * 1.1 + 8.0],
        "sepia" => [
            0.393 * r + 0.769 * gr + 0.189 * b,
            0.349 * r + 0.686 * gr + 0.168 * b,
            0.272 * r + 0.534 * gr + 0.131 * b,
        ],
        "mono" => [y, y, y],
        "noir" => {
            let v = (y - 128.0) * 1.6 + 128.0;
            [v, v, v]
        }
        "vivid" => [y + (r - y) * 1.5, y + (gr - y) * 1.5, y + (b - y) * 1.5],
        _ => [r, gr, b],
    }
}

/// Sobel magnitude, inverted, as a pencil-sketch look.
fn sketch(src: &[u8], g: ImageGeometry) -> Vec<u8> {
    let plane = luma_plane(&gaussian_blur(src, g, 1.0), g);
    let (w, h) = (g.width as usize, g.height as usize);
    let at = |x: isize, y: isize| {
        let x = x.clamp(0, w as isize - 1) as usize;
        let y = y.clamp(0, h as isize - 1) as usize;
        f32::from(plane[y * w + x])
    };
    (0..w * h)
        .into_par_iter()
        .map(|i| {
            let (x, y) = ((i % w) as isize, (i / w) as isize);
            let gx = at(x + 1, y - 1) + 2.0 * at(x + 1, y) + at(x + 1, y + 1)
                - at(x - 1, y - 1)
                - 2.0 * at(x - 1, y)
                - at(x - 1, y + 1);
            let gy = at(x - 1, y + 1) + 2.0 * at(x, y + 1) + at(x + 1, y + 1)
                - at(x - 1, y - 1)
                - 2.0 * at(x, y - 1)
                - at(x + 1, y - 1);
            clamp_u8(255.0 - (gx * gx + gy * gy).sqrt())
        })
        .collect()
}

fn style_full(src: &[u8], g: ImageGeometry, name: &str) -> Vec<u8> {
    let c = g.colorspace.channels();
    let edges = (name == "sketch").then(|| sketch(src, g));
    let mut out = src[..g.byte_size()].to_vec();
    out.par_chunks_mut(c).enumerate().for_each(|(i, px)| {
        let styled = match (&edges, g.colorspace) {
            (Some(e), _) => [f32::from(e[i]); 3],
            (None, ColorSpace::Gray) => {
                let v = f32::from(px[0]);
                styled_pixel(name, v, v, v)
            }
            (None, _) => styled_pixel(name, f32::from(px[0]), f32::from(px[1]), f32::from(px[2])),
        };
        if g.colorspace == ColorSpace::Gray {
            px[0] = clamp_u8(0.299 * styled[0] + 0.587 * styled[1] + 0.114 * styled[2]);
        } else {
            for ch in 0..3 {
                px[ch] = clamp_u8(styled[ch]);
            }
        }
    });
    out
}

/// Side length above which low-resolution styling works on a half-size copy.
const STYLE_FULL_RES_LIMIT: u32 = 1024;

/// Apply a named look, blended with the source by `strength`.
pub fn apply_style(src: &[u8], g: ImageGeometry, opts: &StyleOptions) -> Result<Vec<u8>> {
    let name = opts.style_name.to_ascii_lowercase();
    if !STYLES.contains(&name.as_str()) {
        return Err(OptimizerError::InvalidParam(format!(
            "unknown style `{}` (available: {})",
            opts.style_name,
            STYLES.join(", ")
        )));
    }
    let src = &src[..g.byte_size()];
    let styled = if !opts.high_resolution && g.width.max(g.height) > STYLE_FULL_RES_LIMIT {
        let small = g.with_size((g.width / 2).max(1), (g.height / 2).max(1));
        let reduced = raster::resize(src, g, small.width, small.height, FilterType::Triangle)?;
        let styled = style_full(&reduced, small, &name);
        raster::resize(&styled, small, g.width, g.height, FilterType::Triangle)?
    } else {
        style_full(src, g, &name)
    };

    let (c, cc) = (g.colorspace.channels(), color_channels(g.colorspace));
    let strength = opts.strength;
    let mut out = src.to_vec();
    out.par_chunks_mut(c)
        .zip(styled.par_chunks(c))
        .for_each(|(px, st)| {
            let mut blended = [0f32; 3];
            for ch in 0..cc {
                let o = f32::from(px[ch]);
                blended[ch] = o + (f32::from(st[ch]) - o) * strength;
            }
            if opts.preserve_color && cc == 3 {
                let orig_y = f32::from(luma(px[0], px[1], px[2])).max(1.0);
                let new_y = 0.299 * blended[0] + 0.587 * blended[1] + 0.114 * blended[2];
                let ratio = new_y / orig_y;
                for ch in 0..3 {
                    blended[ch] = f32::from(px[ch]) * ratio;
                }
            }
            for ch in 0..cc {
                px[ch] = clamp_u8(blended[ch]);
            }
        });
    Ok(out)
}
