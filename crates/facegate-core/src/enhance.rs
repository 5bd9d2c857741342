//! Contrast enhancement applied to the detection copy of a capture.

use image::GrayImage;

/// Default tile grid (tiles per side).
pub const DEFAULT_TILES: u32 = 8;
/// Default clip limit, as a multiple of the uniform bin height.
pub const DEFAULT_CLIP_LIMIT: f32 = 2.0;

/// Contrast-Limited Adaptive Histogram Equalization.
///
/// The image is split into a `tiles × tiles` grid; each tile gets a clipped
/// histogram (clip = `clip_limit × tile_pixels / 256`) whose excess is spread
/// evenly, and pixels are remapped by bilinear interpolation between the
/// CDFs of the four nearest tile centres. Images smaller than the grid are
/// returned unchanged.
pub fn clahe(gray: &GrayImage, tiles: u32, clip_limit: f32) -> GrayImage {
    let (w, h) = (gray.width() as usize, gray.height() as usize);
    let grid = tiles.max(1) as usize;
    let tile_w = w / grid;
    let tile_h = h / grid;
    if tile_w == 0 || tile_h == 0 {
        return gray.clone();
    }

    let tile_pixels = (tile_w * tile_h) as f32;
    let clip = ((clip_limit * tile_pixels / 256.0).max(1.0)) as u32;
    let mut luts: Vec<[u8; 256]> = Vec::with_capacity(grid * grid);

    for row in 0..grid {
        for col in 0..grid {
            let mut hist = [0u32; 256];
            for y in row * tile_h..(row + 1) * tile_h {
                for x in col * tile_w..(col + 1) * tile_w {
                    hist[gray.get_pixel(x as u32, y as u32)[0] as usize] += 1;
                }
            }
            luts.push(clipped_lut(&mut hist, clip, tile_pixels));
        }
    }

    let mut out = GrayImage::new(gray.width(), gray.height());
    for (x, y, px) in out.enumerate_pixels_mut() {
        let value = gray.get_pixel(x, y)[0] as usize;

        // Position relative to tile centres.
        let gy = (y as f32 / tile_h as f32 - 0.5).clamp(0.0, (grid - 1) as f32);
        let gx = (x as f32 / tile_w as f32 - 0.5).clamp(0.0, (grid - 1) as f32);
        let r0 = gy as usize;
        let c0 = gx as usize;
        let r1 = (r0 + 1).min(grid - 1);
        let c1 = (c0 + 1).min(grid - 1);
        let dy = gy - r0 as f32;
        let dx = gx - c0 as f32;

        let at = |r: usize, c: usize| luts[r * grid + c][value] as f32;
        let top = at(r0, c0) * (1.0 - dx) + at(r0, c1) * dx;
        let bottom = at(r1, c0) * (1.0 - dx) + at(r1, c1) * dx;
        px[0] = (top * (1.0 - dy) + bottom * dy).round().clamp(0.0, 255.0) as u8;
    }
    out
}

/// Clip a tile histogram, redistribute the excess, and build its lookup table.
fn clipped_lut(hist: &mut [u32; 256], clip: u32, tile_pixels: f32) -> [u8; 256] {
    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > clip {
            excess += *bin - clip;
            *bin = clip;
        }
    }
    let share = excess / 256;
    let leftover = (excess % 256) as usize;
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin += share + u32::from(i < leftover);
    }

    let mut lut = [0u8; 256];
    let mut acc = 0u32;
    let cdf_min = hist.iter().copied().find(|&v| v > 0).unwrap_or(0) as f32;
    let denom = (tile_pixels - cdf_min).max(1.0);
    for (i, &count) in hist.iter().enumerate() {
        acc += count;
        lut[i] = ((acc as f32 - cdf_min) / denom * 255.0).round().clamp(0.0, 255.0) as u8;
    }
    lut
}
