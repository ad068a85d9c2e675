//! Contrast-limited adaptive histogram equalization.
//!
//! Each channel is split into a grid of tiles. Every tile gets its own
//! clipped-histogram lookup table and pixels are mapped by bilinearly
//! blending the tables of the four nearest tile centers, which avoids
//! visible seams at tile borders.

use image::{Rgb, RgbImage};

const BINS: usize = 256;

/// Equalize each RGB channel independently.
pub fn equalize_rgb(img: &RgbImage, tiles: (u32, u32), clip_limit: f32) -> RgbImage {
    let (w, h) = img.dimensions();
    let planes: Vec<Vec<u8>> = (0..3)
        .map(|c| {
            let plane: Vec<u8> = img.pixels().map(|p| p[c]).collect();
            equalize_plane(&plane, w, h, tiles, clip_limit)
        })
        .collect();

    RgbImage::from_fn(w, h, |x, y| {
        let i = (y * w + x) as usize;
        Rgb([planes[0][i], planes[1][i], planes[2][i]])
    })
}

/// Equalize a single row-major 8-bit plane.
pub fn equalize_plane(
    plane: &[u8],
    width: u32,
    height: u32,
    tiles: (u32, u32),
    clip_limit: f32,
) -> Vec<u8> {
    if plane.is_empty() || width == 0 || height == 0 {
        return plane.to_vec();
    }
    let (w, h) = (width as usize, height as usize);
    let tx = (tiles.0.max(1) as usize).min(w);
    let ty = (tiles.1.max(1) as usize).min(h);

    let col_bounds = tile_bounds(w, tx);
    let row_bounds = tile_bounds(h, ty);

    // One lookup table per tile, row-major over the tile grid
    let mut luts = Vec::with_capacity(tx * ty);
    for ti in 0..ty {
        for tj in 0..tx {
            let (r0, r1) = (row_bounds[ti], row_bounds[ti + 1]);
            let (c0, c1) = (col_bounds[tj], col_bounds[tj + 1]);
            let mut hist = [0u32; BINS];
            for r in r0..r1 {
                for &v in &plane[r * w + c0..r * w + c1] {
                    hist[v as usize] += 1;
                }
            }
            luts.push(tile_lut(&mut hist, (r1 - r0) * (c1 - c0), clip_limit));
        }
    }

    let tile_w = w as f32 / tx as f32;
    let tile_h = h as f32 / ty as f32;
    let mut out = Vec::with_capacity(plane.len());
    for y in 0..h {
        let (i0, i1, ay) = neighbours(y, tile_h, ty);
        for x in 0..w {
            let (j0, j1, ax) = neighbours(x, tile_w, tx);
            let v = plane[y * w + x] as usize;
            let top = (1.0 - ax) * luts[i0 * tx + j0][v] as f32 + ax * luts[i0 * tx + j1][v] as f32;
            let bottom =
                (1.0 - ax) * luts[i1 * tx + j0][v] as f32 + ax * luts[i1 * tx + j1][v] as f32;
            let blended = (1.0 - ay) * top + ay * bottom;
            out.push(blended.round().clamp(0.0, 255.0) as u8);
        }
    }
    out
}

/// Exact-coverage tile boundaries, `count + 1` entries.
fn tile_bounds(len: usize, count: usize) -> Vec<usize> {
    (0..=count).map(|i| i * len / count).collect()
}

/// Two neighbouring tile indices and the blend weight toward the second.
fn neighbours(pos: usize, tile_size: f32, count: usize) -> (usize, usize, f32) {
    let g = (pos as f32 + 0.5) / tile_size - 0.5;
    if g <= 0.0 {
        return (0, 0, 0.0);
    }
    let lo = g.floor() as usize;
    if lo + 1 >= count {
        return (count - 1, count - 1, 0.0);
    }
    (lo, lo + 1, g - lo as f32)
}

/// Clip the histogram, redistribute the excess evenly and build the CDF mapping.
fn tile_lut(hist: &mut [u32; BINS], pixels: usize, clip_limit: f32) -> [u8; BINS] {
    let limit = ((clip_limit * pixels as f32 / BINS as f32) as u32).max(1);

    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > limit {
            excess += *bin - limit;
            *bin = limit;
        }
    }
    let per_bin = excess / BINS as u32;
    let remainder = (excess % BINS as u32) as usize;
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin += per_bin + u32::from(i < remainder);
    }

    let scale = 255.0 / pixels.max(1) as f32;
    let mut lut = [0u8; BINS];
    let mut cdf = 0u32;
    for (v, &count) in hist.iter().enumerate() {
        cdf += count;
        lut[v] = (cdf as f32 * scale).round().min(255.0) as u8;
    }
    lut
}
