//! Single-channel image filters used by the normalizer.

use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;
use rayon::prelude::*;

/// Reflect an out-of-range coordinate back into `0..n` (mirror without
/// repeating the edge pixel).
fn reflect(mut i: i64, n: i64) -> usize {
    if n == 1 {
        return 0;
    }
    while i < 0 || i >= n {
        if i < 0 {
            i = -i;
        }
        if i >= n {
            i = 2 * n - 2 - i;
        }
    }
    i as usize
}

/// Output rows handled by one parallel work item of [`non_local_means`].
const NLM_BAND_ROWS: usize = 32;

/// Weights below this are treated as zero, which bounds the lookup table.
const NLM_WEIGHT_FLOOR: f32 = 0.001;

/// `exp(-d / h²)` for every integer mean squared patch distance `d` whose
/// weight is at least [`NLM_WEIGHT_FLOOR`]. Longer distances weigh nothing.
fn distance_weights(h: f32) -> Vec<f32> {
    let h2 = (h * h).max(f32::EPSILON);
    (0..=255u32 * 255)
        .map(|d| (-(d as f32) / h2).exp())
        .take_while(|&w| w >= NLM_WEIGHT_FLOOR)
        .collect()
}

/// Non-local means denoising.
///
/// Each output pixel is a weighted mean of the pixels in a `search × search`
/// window, weighted by `exp(-d / h²)` where `d` is the mean squared difference
/// between the `patch × patch` neighborhoods. Flat regions are smoothed while
/// stroke edges, whose patches differ strongly, are left intact.
///
/// Rows are processed in independent bands on the rayon pool. Within a band,
/// patch distances are box sums of squared differences per search offset, so
/// cost is independent of the patch size.
pub fn non_local_means(img: &GrayImage, h: f32, patch: u32, search: u32) -> GrayImage {
    let (w, ht) = img.dimensions();
    if w == 0 || ht == 0 {
        return img.clone();
    }
    let pr = (patch / 2) as i64;
    let sr = (search / 2) as i64;
    let pad = pr + sr;
    let (wi, hi) = (w as i64, ht as i64);

    // Reflect-padded copy of the source.
    let pw = (wi + 2 * pad) as usize;
    let ph = (hi + 2 * pad) as usize;
    let mut padded = vec![0u8; pw * ph];
    for y in 0..ph {
        let sy = reflect(y as i64 - pad, hi) as u32;
        for x in 0..pw {
            let sx = reflect(x as i64 - pad, wi) as u32;
            padded[y * pw + x] = img.get_pixel(sx, sy)[0];
        }
    }

    let weights = distance_weights(h);
    let side = (2 * pr + 1) as usize;
    let area = (side * side) as u32;
    let w = w as usize;
    let (sr_u, pad_u) = (sr as usize, pad as usize);

    let mut out = vec![0u8; w * ht as usize];
    out.par_chunks_mut(NLM_BAND_ROWS * w)
        .enumerate()
        .for_each(|(band, rows)| {
            let y0 = band * NLM_BAND_ROWS;
            let band_h = rows.len() / w;
            // Patch rows covering the band: band rows plus the patch radius above and below.
            let region_h = band_h + side - 1;

            let mut weight_sum = vec![0f32; rows.len()];
            let mut value_sum = vec![0f32; rows.len()];
            let mut sq = vec![0u32; w + side - 1];
            let mut row_sums = vec![0u32; region_h * w];
            let mut ssd = vec![0u32; w];

            for dy in -sr..=sr {
                for dx in -sr..=sr {
                    // Horizontal patch sums of squared differences, one region row at a time.
                    for r in 0..region_h {
                        let py = y0 + sr_u + r;
                        let a = &padded[py * pw..(py + 1) * pw];
                        let qy = (py as i64 + dy) as usize;
                        let b = &padded[qy * pw..(qy + 1) * pw];
                        for (c, v) in sq.iter_mut().enumerate() {
                            let px = sr_u + c;
                            let d = a[px] as i32 - b[(px as i64 + dx) as usize] as i32;
                            *v = (d * d) as u32;
                        }
                        let sums = &mut row_sums[r * w..(r + 1) * w];
                        let mut acc: u32 = sq[..side].iter().sum();
                        sums[0] = acc;
                        for x in 1..w {
                            acc = acc + sq[x + side - 1] - sq[x - 1];
                            sums[x] = acc;
                        }
                    }

                    // Vertical sliding sum gives the full patch distance for each output row.
                    ssd.fill(0);
                    for r in 0..side {
                        for (s, v) in ssd.iter_mut().zip(&row_sums[r * w..(r + 1) * w]) {
                            *s += v;
                        }
                    }
                    for j in 0..band_h {
                        if j > 0 {
                            let (add, sub) = ((j + side - 1) * w, (j - 1) * w);
                            for x in 0..w {
                                ssd[x] = ssd[x] + row_sums[add + x] - row_sums[sub + x];
                            }
                        }
                        let sy = (y0 + j + pad_u) as i64 + dy;
                        let samples = &padded[sy as usize * pw..(sy as usize + 1) * pw];
                        for x in 0..w {
                            let Some(&weight) = weights.get((ssd[x] / area) as usize) else {
                                continue;
                            };
                            let sample = samples[(x as i64 + pad + dx) as usize] as f32;
                            weight_sum[j * w + x] += weight;
                            value_sum[j * w + x] += weight * sample;
                        }
                    }
                }
            }

            // The zero offset always contributes weight 1, so no sum is zero.
            for (i, px) in rows.iter_mut().enumerate() {
                *px = (value_sum[i] / weight_sum[i]).round().clamp(0.0, 255.0) as u8;
            }
        });

    GrayImage::from_fn(w as u32, ht, |x, y| Luma([out[y as usize * w + x as usize]]))
}

/// Contrast-limited adaptive histogram equalization over a `tiles × tiles`
/// grid, with bilinear blending between neighboring tile mappings.
///
/// `clip_limit` is relative to a uniform histogram: a bin may hold at most
/// `clip_limit × tile_area / 256` pixels before the excess is redistributed.
pub fn clahe(img: &GrayImage, tiles: u32, clip_limit: f32) -> GrayImage {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return img.clone();
    }
    let tile_w = w.div_ceil(tiles.max(1)).max(1);
    let tile_h = h.div_ceil(tiles.max(1)).max(1);
    let nx = w.div_ceil(tile_w);
    let ny = h.div_ceil(tile_h);

    let mut luts = Vec::with_capacity((nx * ny) as usize);
    for ty in 0..ny {
        for tx in 0..nx {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(w);
            let y1 = (y0 + tile_h).min(h);
            let mut hist = [0u32; 256];
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[img.get_pixel(x, y)[0] as usize] += 1;
                }
            }
            let tile_area = (x1 - x0) * (y1 - y0);
            luts.push(clipped_lut(hist, tile_area, clip_limit));
        }
    }

    // Position of a pixel relative to tile centers: (lower tile, upper tile, blend).
    let axis = |p: u32, size: u32, count: u32| -> (usize, usize, f32) {
        let f = (p as f32 + 0.5) / size as f32 - 0.5;
        if f <= 0.0 {
            return (0, 0, 0.0);
        }
        let lo = (f.floor() as u32).min(count - 1);
        let hi = (lo + 1).min(count - 1);
        (lo as usize, hi as usize, f - f.floor())
    };

    GrayImage::from_fn(w, h, |x, y| {
        let v = img.get_pixel(x, y)[0] as usize;
        let (x1, x2, ax) = axis(x, tile_w, nx);
        let (y1, y2, ay) = axis(y, tile_h, ny);
        let lut = |tx: usize, ty: usize| luts[ty * nx as usize + tx][v] as f32;
        let top = lut(x1, y1) * (1.0 - ax) + lut(x2, y1) * ax;
        let bottom = lut(x1, y2) * (1.0 - ax) + lut(x2, y2) * ax;
        Luma([(top * (1.0 - ay) + bottom * ay).round().clamp(0.0, 255.0) as u8])
    })
}

fn clipped_lut(mut hist: [u32; 256], area: u32, clip_limit: f32) -> [u8; 256] {
    let clip = ((clip_limit * area as f32 / 256.0) as u32).max(1);
    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > clip {
            excess += *bin - clip;
            *bin = clip;
        }
    }
    let share = excess / 256;
    let remainder = (excess % 256) as usize;
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin += share + u32::from(i < remainder);
    }

    let mut lut = [0u8; 256];
    let mut cdf = 0u32;
    let scale = 255.0 / area.max(1) as f32;
    for (i, bin) in hist.iter().enumerate() {
        cdf += bin;
        lut[i] = (cdf as f32 * scale).round().clamp(0.0, 255.0) as u8;
    }
    lut
}

/// Binarize against a Gaussian-weighted local mean: a pixel becomes white when
/// it is brighter than `mean - bias`, black otherwise.
pub fn adaptive_threshold(img: &GrayImage, block: u32, bias: i16) -> GrayImage {
    // Same block-size to sigma relation OpenCV uses for Gaussian kernels.
    let sigma = 0.3 * ((block as f32 - 1.0) * 0.5 - 1.0) + 0.8;
    let mean = imageproc::filter::gaussian_blur_f32(img, sigma.max(0.1));
    GrayImage::from_fn(img.width(), img.height(), |x, y| {
        let p = img.get_pixel(x, y)[0] as i16;
        let t = mean.get_pixel(x, y)[0] as i16 - bias;
        Luma([if p > t { 255 } else { 0 }])
    })
}

/// Morphological closing with a square structuring element of the given radius.
pub fn close(img: &GrayImage, radius: u8) -> GrayImage {
    if radius == 0 {
        return img.clone();
    }
    imageproc::morphology::close(img, Norm::LInf, radius)
}
