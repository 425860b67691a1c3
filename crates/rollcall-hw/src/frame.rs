//! Pixel conversion and still encoding: YUYV/Y16 unpacking, CLAHE, JPEG.

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("YUYV width must be even, got {0}")]
    OddWidth(u32),
    #[error("JPEG encoding failed: {0}")]
    Encode(String),
}

/// Channel layout of a buffer handed to [`encode_jpeg`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    Gray,
    Rgb,
}

impl PixelLayout {
    fn channels(self) -> usize {
        match self {
            PixelLayout::Gray => 1,
            PixelLayout::Rgb => 3,
        }
    }
}

fn check_len(buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Extract the Y channel from packed YUYV 4:2:2 (`[Y0, U, Y1, V]`).
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    check_len(yuyv, expected)?;
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// Downscale 16-bit little-endian grayscale to 8 bits by keeping the high byte.
pub fn y16_to_grayscale(y16: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    check_len(y16, expected)?;
    Ok(y16[..expected].chunks_exact(2).map(|px| px[1]).collect())
}

/// Convert packed YUYV to interleaved RGB using BT.601 studio-range coefficients.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    if width % 2 != 0 {
        return Err(FrameError::OddWidth(width));
    }
    let expected = (width * height * 2) as usize;
    check_len(yuyv, expected)?;

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for quad in yuyv[..expected].chunks_exact(4) {
        let (u, v) = (quad[1], quad[3]);
        rgb.extend_from_slice(&ycbcr_to_rgb(quad[0], u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(quad[2], u, v));
    }
    Ok(rgb)
}

fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 409 * e),
        clamp(298 * c - 100 * d - 208 * e),
        clamp(298 * c + 516 * d),
    ]
}

/// Contrast-limited adaptive histogram equalization, in place.
///
/// The image is split into a `grid`×`grid` set of tiles. Each tile gets a
/// clipped-histogram lookup table; pixels are mapped by bilinear
/// interpolation between the four nearest tile centres.
pub fn clahe_enhance(gray: &mut [u8], width: u32, height: u32, grid: u32, clip_limit: f32) {
    let (w, h) = (width as usize, height as usize);
    let grid = grid.max(1) as usize;
    if w == 0 || h == 0 || gray.len() < w * h {
        return;
    }
    let (tile_w, tile_h) = (w / grid, h / grid);
    if tile_w == 0 || tile_h == 0 {
        return;
    }

    let luts: Vec<[u8; 256]> = (0..grid * grid)
        .map(|t| {
            let x0 = (t % grid) * tile_w;
            let y0 = (t / grid) * tile_h;
            tile_lut(gray, w, x0, y0, tile_w, tile_h, clip_limit)
        })
        .collect();

    for y in 0..h {
        let (r0, r1, dy) = tile_neighbours(y, tile_h, grid);
        for x in 0..w {
            let (c0, c1, dx) = tile_neighbours(x, tile_w, grid);
            let v = gray[y * w + x] as usize;
            let top = lerp(luts[r0 * grid + c0][v], luts[r0 * grid + c1][v], dx);
            let bottom = lerp(luts[r1 * grid + c0][v], luts[r1 * grid + c1][v], dx);
            gray[y * w + x] = (top + (bottom - top) * dy).round().clamp(0.0, 255.0) as u8;
        }
    }
}

fn lerp(a: u8, b: u8, t: f32) -> f32 {
    a as f32 + (b as f32 - a as f32) * t
}

/// Lower and upper tile index around `pos`, plus the weight of the upper one.
fn tile_neighbours(pos: usize, tile: usize, grid: usize) -> (usize, usize, f32) {
    let f = ((pos as f32 + 0.5) / tile as f32 - 0.5).clamp(0.0, (grid - 1) as f32);
    let lo = f as usize;
    let hi = (lo + 1).min(grid - 1);
    (lo, hi, f - lo as f32)
}

fn tile_lut(
    gray: &[u8],
    stride: usize,
    x0: usize,
    y0: usize,
    tile_w: usize,
    tile_h: usize,
    clip_limit: f32,
) -> [u8; 256] {
    let mut hist = [0u32; 256];
    for row in gray[y0 * stride..].chunks(stride).take(tile_h) {
        for &p in &row[x0..x0 + tile_w] {
            hist[p as usize] += 1;
        }
    }

    let pixels = (tile_w * tile_h) as u32;
    let clip = ((clip_limit * pixels as f32) as u32).max(1);
    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > clip {
            excess += *bin - clip;
            *bin = clip;
        }
    }
    let share = excess / 256;
    let rest = (excess % 256) as usize;
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin += share + u32::from(i < rest);
    }

    let mut lut = [0u8; 256];
    let mut acc = 0u32;
    for (slot, count) in lut.iter_mut().zip(hist.iter()) {
        acc += count;
        *slot = (acc as f32 / pixels as f32 * 255.0).round().min(255.0) as u8;
    }
    lut
}

/// Encode a raw gray or RGB buffer as a baseline JPEG.
pub fn encode_jpeg(
    pixels: &[u8],
    width: u32,
    height: u32,
    layout: PixelLayout,
    quality: u8,
) -> Result<Vec<u8>, FrameError> {
    let expected = width as usize * height as usize * layout.channels();
    if pixels.len() != expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: pixels.len(),
        });
    }
    let color = match layout {
        PixelLayout::Gray => ExtendedColorType::L8,
        PixelLayout::Rgb => ExtendedColorType::Rgb8,
    };

    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode(pixels, width, height, color)
        .map_err(|e| FrameError::Encode(e.to_string()))?;
    Ok(out)
}
