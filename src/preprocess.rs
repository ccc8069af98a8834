//! Image preparation before segmentation.
//!
//! Stages run in a fixed order: clip, histogram equalization, contrast
//! stretch, colour quantization. Each stage is pure. A stage that cannot run
//! logs a warning and hands its input to the next one unchanged.

use ndarray::{s, Array2, Array3, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::filters::map_channels;
use crate::parameters::{HistogramMethod, ParameterSet, QuantizeMethod, Quantization};
use crate::utils::value_range;
use crate::{console_log, Image};

/// Working range of the float images handed over by the image reader.
pub const CLIP_RANGE: (f32, f32) = (-1.0, 1.0);

const HISTOGRAM_BINS: usize = 256;
const EQUALIZE_GRID: usize = 8;
const ADAPTIVE_CLIP_LIMIT: f32 = 0.004;
const CLAHE_CLIP_LIMIT: f32 = 0.01;
const STRETCH_PERCENTILES: (f64, f64) = (2.0, 98.0);
const KMEANS_SAMPLES: usize = 1_000;
const KMEANS_ITERATIONS: usize = 100;
const SEED: u64 = 0;

/// Why a stage handed its input through untouched.
#[derive(Debug)]
enum StageSkip {
    Empty,
    Flat,
    NoColors,
}

/// Run every enabled stage on `image`.
pub fn preprocess(image: Image, params: &ParameterSet) -> Image {
    let mut image = clip(image);

    if let Some(method) = params.light_adjustment {
        image = run_stage("histogram equalization", image, |img| equalize(img, method));
    }

    if params.contrast_stretch {
        image = run_stage("contrast stretch", image, |img| {
            stretch_contrast(img, STRETCH_PERCENTILES)
        });
    }

    if let Some(quantization) = params.quantization {
        image = run_stage("color quantization", image, |img| quantize(img, quantization));
    }

    image
}

fn run_stage<F>(name: &str, image: Image, stage: F) -> Image
where
    F: FnOnce(&Image) -> Result<Image, StageSkip>,
{
    match stage(&image) {
        Ok(output) if output.iter().all(|v| v.is_finite()) => {
            console_log!("{name} applied");
            output
        }
        Ok(_) => {
            log::warn!("{name} produced non-finite values, keeping its input");
            image
        }
        Err(reason) => {
            log::warn!("{name} skipped ({reason:?}), keeping its input");
            image
        }
    }
}

pub fn clip(image: Image) -> Image {
    image.mapv_into(|v| {
        if v.is_nan() {
            0.0
        } else {
            v.clamp(CLIP_RANGE.0, CLIP_RANGE.1)
        }
    })
}

fn equalize(image: &Image, method: HistogramMethod) -> Result<Image, StageSkip> {
    if image.is_empty() {
        return Err(StageSkip::Empty);
    }
    Ok(match method {
        HistogramMethod::None => image.clone(),
        HistogramMethod::Global => map_channels(image.view(), equalize_band),
        HistogramMethod::Adaptive => map_channels(image.view(), |band| {
            equalize_band_tiled(band, ADAPTIVE_CLIP_LIMIT)
        }),
        HistogramMethod::Clahe => map_channels(image.view(), |band| {
            equalize_band_tiled(band, CLAHE_CLIP_LIMIT)
        }),
    })
}

fn bin_of(v: f32, lo: f32, hi: f32) -> usize {
    if hi <= lo {
        return 0;
    }
    (((v - lo) / (hi - lo)) * (HISTOGRAM_BINS - 1) as f32).round() as usize
}

/// Cumulative distribution normalized to `[0, 1]`.
fn cdf(histogram: &[f32]) -> Vec<f32> {
    let total: f32 = histogram.iter().sum();
    let mut running = 0.0;
    histogram
        .iter()
        .map(|n| {
            running += n;
            if total > 0.0 {
                running / total
            } else {
                0.0
            }
        })
        .collect()
}

/// Global histogram equalization of one band; output in `[0, 1]`.
fn equalize_band(band: ArrayView2<f32>) -> Array2<f32> {
    let (lo, hi) = value_range(band.iter());
    let mut histogram = vec![0f32; HISTOGRAM_BINS];
    for &v in band.iter() {
        histogram[bin_of(v, lo, hi)] += 1.0;
    }
    let cdf = cdf(&histogram);
    band.mapv(|v| cdf[bin_of(v, lo, hi)])
}

/// Contrast-limited tiled equalization with bilinear blending between tile
/// mappings. `clip_limit` is the per-bin cap as a fraction of tile pixels.
fn equalize_band_tiled(band: ArrayView2<f32>, clip_limit: f32) -> Array2<f32> {
    let (height, width) = band.dim();
    let (lo, hi) = value_range(band.iter());
    let rows = EQUALIZE_GRID.min(height).max(1);
    let cols = EQUALIZE_GRID.min(width).max(1);
    let tile_h = (height + rows - 1) / rows;
    let tile_w = (width + cols - 1) / cols;

    let mut mappings = Vec::with_capacity(rows * cols);
    for ty in 0..rows {
        for tx in 0..cols {
            let y0 = (ty * tile_h).min(height);
            let x0 = (tx * tile_w).min(width);
            let tile = band.slice(s![y0..(y0 + tile_h).min(height), x0..(x0 + tile_w).min(width)]);

            let mut histogram = vec![0f32; HISTOGRAM_BINS];
            for &v in tile.iter() {
                histogram[bin_of(v, lo, hi)] += 1.0;
            }
            let cap = (clip_limit * tile.len() as f32).max(1.0);
            let excess: f32 = histogram.iter().map(|n| (n - cap).max(0.0)).sum();
            let bonus = excess / HISTOGRAM_BINS as f32;
            for n in histogram.iter_mut() {
                *n = n.min(cap) + bonus;
            }
            mappings.push(cdf(&histogram));
        }
    }

    // Tile centres in pixel coordinates, for interpolation.
    let centre = |t: usize, size: usize, len: usize| -> f32 {
        let start = t * size;
        let end = ((t + 1) * size).min(len);
        (start + end) as f32 / 2.0 - 0.5
    };

    Array2::from_shape_fn((height, width), |(y, x)| {
        let bin = bin_of(band[[y, x]], lo, hi);

        let locate = |p: usize, size: usize, count: usize, len: usize| -> (usize, usize, f32) {
            let mut t0 = 0;
            while t0 + 1 < count && centre(t0 + 1, size, len) <= p as f32 {
                t0 += 1;
            }
            let t1 = (t0 + 1).min(count - 1);
            let c0 = centre(t0, size, len);
            let c1 = centre(t1, size, len);
            let frac = if t1 == t0 {
                0.0
            } else {
                ((p as f32 - c0) / (c1 - c0)).clamp(0.0, 1.0)
            };
            (t0, t1, frac)
        };

        let (r0, r1, fy) = locate(y, tile_h, rows, height);
        let (c0, c1, fx) = locate(x, tile_w, cols, width);
        let at = |r: usize, c: usize| mappings[r * cols + c][bin];

        let top = at(r0, c0) * (1.0 - fx) + at(r0, c1) * fx;
        let bottom = at(r1, c0) * (1.0 - fx) + at(r1, c1) * fx;
        top * (1.0 - fy) + bottom * fy
    })
}

fn percentile(sorted: &[f32], q: f64) -> f32 {
    let rank = q / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = (rank - lo as f64) as f32;
    sorted[lo] * (1.0 - frac) + sorted[hi] * frac
}

/// Map the `[lower, upper]` percentiles of the whole image onto `[0, 1]`.
fn stretch_contrast(image: &Image, percentiles: (f64, f64)) -> Result<Image, StageSkip> {
    let mut values: Vec<f32> = image.iter().copied().filter(|v| v.is_finite()).collect();
    if values.is_empty() {
        return Err(StageSkip::Empty);
    }
    values.sort_by(f32::total_cmp);
    let lower = percentile(&values, percentiles.0);
    let upper = percentile(&values, percentiles.1);
    if upper <= lower {
        return Err(StageSkip::Flat);
    }
    Ok(image.mapv(|v| ((v - lower) / (upper - lower)).clamp(0.0, 1.0)))
}

fn quantize(image: &Image, quantization: Quantization) -> Result<Image, StageSkip> {
    let (height, width, channels) = image.dim();
    if image.is_empty() {
        return Err(StageSkip::Empty);
    }
    if quantization.n_colors == 0 {
        return Err(StageSkip::NoColors);
    }

    let pixels = image
        .to_shape((height * width, channels))
        .map_err(|_| StageSkip::Empty)?
        .to_owned();

    let palette = match quantization.method {
        QuantizeMethod::AdaptivePalette => median_cut(&pixels, quantization.n_colors),
        QuantizeMethod::KMeans => kmeans(&pixels, quantization.n_colors),
        QuantizeMethod::RandomSample => random_codebook(&pixels, quantization.n_colors),
    };

    let mut output = Array3::<f32>::zeros((height, width, channels));
    for (i, pixel) in pixels.outer_iter().enumerate() {
        let nearest = nearest_color(&palette, pixel.as_slice().unwrap_or(&[]));
        output
            .slice_mut(s![i / width, i % width, ..])
            .assign(&palette.row(nearest));
    }
    Ok(output)
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn nearest_color(palette: &Array2<f32>, pixel: &[f32]) -> usize {
    palette
        .outer_iter()
        .enumerate()
        .map(|(i, color)| (i, squared_distance(color.as_slice().unwrap_or(&[]), pixel)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Adaptive palette by median cut: split the box with the widest channel
/// range at its median until `n_colors` boxes exist; colours are box means.
fn median_cut(pixels: &Array2<f32>, n_colors: usize) -> Array2<f32> {
    let channels = pixels.ncols();
    let mut boxes: Vec<Vec<usize>> = vec![(0..pixels.nrows()).collect()];

    let spread = |indices: &[usize]| -> (usize, f32) {
        (0..channels)
            .map(|c| {
                let (lo, hi) = indices.iter().fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &i| {
                    (lo.min(pixels[[i, c]]), hi.max(pixels[[i, c]]))
                });
                (c, hi - lo)
            })
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .unwrap_or((0, 0.0))
    };

    while boxes.len() < n_colors {
        let candidate = boxes
            .iter()
            .enumerate()
            .filter(|(_, b)| b.len() > 1)
            .map(|(i, b)| (i, spread(b)))
            .max_by(|a, b| a.1 .1.total_cmp(&b.1 .1));
        let Some((index, (channel, range))) = candidate else {
            break;
        };
        if range <= 0.0 {
            break;
        }
        let mut current = boxes.swap_remove(index);
        current.sort_by(|&a, &b| pixels[[a, channel]].total_cmp(&pixels[[b, channel]]));
        let upper = current.split_off(current.len() / 2);
        boxes.push(current);
        boxes.push(upper);
    }

    let mut palette = Array2::<f32>::zeros((boxes.len(), channels));
    for (row, indices) in boxes.iter().enumerate() {
        for &i in indices {
            let mut target = palette.row_mut(row);
            target += &pixels.row(i);
        }
        palette.row_mut(row).mapv_inplace(|v| v / indices.len() as f32);
    }
    palette
}

fn sample_rows(pixels: &Array2<f32>, amount: usize, rng: &mut StdRng) -> Array2<f32> {
    let amount = amount.min(pixels.nrows());
    let indices = rand::seq::index::sample(rng, pixels.nrows(), amount).into_vec();
    pixels.select(Axis(0), &indices)
}

/// Lloyd's algorithm on a seeded sample with k-means++ initialisation.
fn kmeans(pixels: &Array2<f32>, n_colors: usize) -> Array2<f32> {
    let mut rng = StdRng::seed_from_u64(SEED);
    let sample = sample_rows(pixels, KMEANS_SAMPLES, &mut rng);
    let k = n_colors.min(sample.nrows()).max(1);
    let channels = sample.ncols();

    let row = |i: usize| sample.row(i).to_vec();
    let mut centers: Vec<Vec<f32>> = vec![row(rng.random_range(0..sample.nrows()))];
    while centers.len() < k {
        let distances: Vec<f32> = sample
            .outer_iter()
            .map(|p| {
                let p = p.to_vec();
                centers
                    .iter()
                    .map(|c| squared_distance(c, &p))
                    .fold(f32::INFINITY, f32::min)
            })
            .collect();
        let total: f32 = distances.iter().sum();
        if total <= 0.0 {
            break;
        }
        let mut target = rng.random_range(0.0..total);
        let mut chosen = distances.len() - 1;
        for (i, d) in distances.iter().enumerate() {
            if target < *d {
                chosen = i;
                break;
            }
            target -= d;
        }
        centers.push(row(chosen));
    }

    for _ in 0..KMEANS_ITERATIONS {
        let mut sums = vec![vec![0f32; channels]; centers.len()];
        let mut counts = vec![0usize; centers.len()];
        for p in sample.outer_iter() {
            let p = p.to_vec();
            let nearest = centers
                .iter()
                .enumerate()
                .map(|(i, c)| (i, squared_distance(c, &p)))
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(i, _)| i)
                .unwrap_or(0);
            counts[nearest] += 1;
            for (s, v) in sums[nearest].iter_mut().zip(&p) {
                *s += v;
            }
        }

        let mut moved = false;
        for ((center, sum), count) in centers.iter_mut().zip(&sums).zip(&counts) {
            if *count == 0 {
                continue;
            }
            let updated: Vec<f32> = sum.iter().map(|s| s / *count as f32).collect();
            if squared_distance(center, &updated) > 1e-12 {
                moved = true;
            }
            *center = updated;
        }
        if !moved {
            break;
        }
    }

    let flat: Vec<f32> = centers.iter().flatten().copied().collect();
    Array2::from_shape_vec((centers.len(), channels), flat)
        .unwrap_or_else(|_| Array2::zeros((1, channels)))
}

/// Codebook of `n_colors` seeded random pixels.
fn random_codebook(pixels: &Array2<f32>, n_colors: usize) -> Array2<f32> {
    let mut rng = StdRng::seed_from_u64(SEED);
    sample_rows(pixels, n_colors, &mut rng)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::parameters::SegmentationMethod;

    fn ramp(height: usize, width: usize) -> Image {
        Array3::from_shape_fn((height, width, 3), |(y, x, c)| {
            ((y * width + x) as f32 / (height * width) as f32) * 0.5 + c as f32 * 0.1
        })
    }

    fn base() -> ParameterSet {
        ParameterSet::new(SegmentationMethod::Watershed {
            smoothing_radius: 1.0,
            gradient_cut: 10.0,
        })
    }

    #[test]
    fn test_clip_bounds_values() {
        let img = Array3::from_shape_vec((1, 3, 1), vec![-3.0, 0.5, f32::NAN]).unwrap();
        let clipped = clip(img);
        assert_eq!(clipped.as_slice().unwrap(), &[-1.0, 0.5, 0.0]);
    }

    #[test]
    fn test_global_equalization_spans_unit_range() {
        let out = preprocess(ramp(16, 16), &base().with_light_adjustment(HistogramMethod::Global));
        let (lo, hi) = value_range(out.iter());
        assert!(lo >= 0.0 && lo < 0.05);
        assert!((hi - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_adaptive_equalization_stays_in_range() {
        for method in [HistogramMethod::Adaptive, HistogramMethod::Clahe] {
            let out = preprocess(ramp(32, 40), &base().with_light_adjustment(method));
            assert_eq!(out.dim(), (32, 40, 3));
            assert!(out.iter().all(|v| (0.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn test_stretch_on_flat_image_is_identity() {
        let img = Array3::<f32>::from_elem((4, 4, 3), 0.3);
        let out = preprocess(img.clone(), &base().with_contrast_stretch());
        assert_eq!(out, img);
    }

    #[test]
    fn test_stretch_maps_percentiles_to_unit() {
        let out = preprocess(ramp(20, 20), &base().with_contrast_stretch());
        let (lo, hi) = value_range(out.iter());
        assert_eq!((lo, hi), (0.0, 1.0));
    }

    #[test]
    fn test_quantization_limits_colors() {
        for method in [
            QuantizeMethod::AdaptivePalette,
            QuantizeMethod::KMeans,
            QuantizeMethod::RandomSample,
        ] {
            let out = preprocess(ramp(24, 24), &base().with_quantization(method, 4));
            let colors: HashSet<Vec<u32>> = out
                .outer_iter()
                .flat_map(|row| {
                    row.outer_iter()
                        .map(|p| p.iter().map(|v| v.to_bits()).collect::<Vec<_>>())
                        .collect::<Vec<_>>()
                })
                .collect();
            assert!(colors.len() <= 4, "{method:?} kept {} colors", colors.len());
            assert!(colors.len() >= 2);
        }
    }

    #[test]
    fn test_disabled_stages_only_clip() {
        let img = ramp(8, 8);
        assert_eq!(preprocess(img.clone(), &base()), img);
    }
}
