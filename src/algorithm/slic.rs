//! Simple Linear Iterative Clustering.

use std::collections::VecDeque;

use ndarray::{s, Array1, Array2, Array3, ArrayView3, Axis};
use palette::{FromColor, Lab, Srgb};
use simple_clustering::Superpixel;

use super::seed::{init_seeds, perturb};
use super::slic_helpers::{calculate_grid_interval, distance_pixel, distance_s, distance_xy, m_div_s};
use crate::{
    console_log,
    error::SegmentError,
    filters::{gaussian_blur, neighbours_4con},
    SegmentImage,
};

const ITERATIONS: usize = 10;

/// Convert a `[0, 1]` RGB image to CIE L*a*b*.
fn rgb_to_lab(image: ArrayView3<f32>) -> Array3<f32> {
    let mut lab = Array3::<f32>::zeros(image.dim());
    for (pixel, mut out) in image.lanes(Axis(2)).into_iter().zip(lab.lanes_mut(Axis(2))) {
        let rgb = Srgb::new(
            pixel[0].clamp(0.0, 1.0),
            pixel[1].clamp(0.0, 1.0),
            pixel[2].clamp(0.0, 1.0),
        );
        let color: Lab = Lab::from_color(rgb.into_linear());
        out[0] = color.l;
        out[1] = color.a;
        out[2] = color.b;
    }
    lab
}

/// Segment `image` into roughly `n_segments` compact superpixels.
///
/// Three-channel images are clustered in L*a*b*, anything else on its raw
/// values. Ids start at 1.
pub(crate) fn slic(
    image: ArrayView3<f32>,
    n_segments: u32,
    compactness: f64,
    sigma: f64,
) -> Result<SegmentImage, SegmentError> {
    let (height, width, channels) = image.dim();
    let smoothed = gaussian_blur(image, sigma);
    let features = if channels == 3 {
        rgb_to_lab(smoothed.view())
    } else {
        smoothed
    };

    let k = n_segments.max(1);
    let s = calculate_grid_interval(width as u32, height as u32, k)
        .round()
        .max(1.0);
    let step = s as u32;

    let mut seeds: Vec<Superpixel<Array1<f32>>> = Vec::new();
    init_seeds(step, k, features.view(), &mut seeds)
        .map_err(|e| SegmentError::Slic(format!("{e:?}")))?;
    for seed in seeds.iter_mut() {
        perturb(seed, features.view()).map_err(|e| SegmentError::Slic(format!("{e:?}")))?;
    }
    console_log!("SLIC: {} seeds, interval {}", seeds.len(), step);

    let scale = m_div_s(compactness, s);
    let window = step as i64;
    let mut labels = Array2::<usize>::from_elem((height, width), usize::MAX);
    let mut distances = Array2::<f64>::from_elem((height, width), f64::INFINITY);

    for _ in 0..ITERATIONS {
        distances.fill(f64::INFINITY);
        for (k, seed) in seeds.iter().enumerate() {
            let (sx, sy) = (i64::from(seed.x), i64::from(seed.y));
            let y_range = (sy - window).max(0) as usize..((sy + window + 1).min(height as i64)) as usize;
            let x_range = (sx - window).max(0) as usize..((sx + window + 1).min(width as i64)) as usize;
            for y in y_range {
                for x in x_range.clone() {
                    let d_lab = distance_pixel(features.slice(s![y, x, ..]), seed.data.view());
                    let d_xy = distance_xy((x as f64, y as f64), (seed.x as f64, seed.y as f64));
                    let d = distance_s(scale, d_lab, d_xy);
                    if d < distances[[y, x]] {
                        distances[[y, x]] = d;
                        labels[[y, x]] = k;
                    }
                }
            }
        }

        // Move every center to the mean of its members
        let mut sums = vec![(Array1::<f64>::zeros(features.dim().2), 0.0, 0.0, 0usize); seeds.len()];
        for ((y, x), label) in labels.indexed_iter() {
            if let Some(sum) = sums.get_mut(*label) {
                for (acc, v) in sum.0.iter_mut().zip(features.slice(s![y, x, ..])) {
                    *acc += f64::from(*v);
                }
                sum.1 += x as f64;
                sum.2 += y as f64;
                sum.3 += 1;
            }
        }
        for (seed, (data, sx, sy, count)) in seeds.iter_mut().zip(sums) {
            if count == 0 {
                continue;
            }
            let n = count as f64;
            seed.data = data.mapv(|v| (v / n) as f32);
            seed.x = (sx / n).round() as u32;
            seed.y = (sy / n).round() as u32;
        }
    }

    // Pixels no window reached go to the spatially closest center
    for ((y, x), label) in labels.indexed_iter_mut() {
        if *label == usize::MAX {
            *label = seeds
                .iter()
                .enumerate()
                .map(|(k, seed)| {
                    (k, distance_xy((x as f64, y as f64), (seed.x as f64, seed.y as f64)))
                })
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .map_or(0, |(k, _)| k);
        }
    }

    let min_size = ((step * step) / 4).max(1) as usize;
    Ok(enforce_connectivity(&labels, min_size))
}

/// Split clusters into 4-connected components and fold components smaller than
/// `min_size` into the component adjacent to their first pixel. Ids start at 1.
fn enforce_connectivity(labels: &Array2<usize>, min_size: usize) -> SegmentImage {
    let (height, width) = labels.dim();
    let mut output = SegmentImage::zeros((height, width));
    let mut next_label = 1u32;
    let mut queue = VecDeque::new();
    let mut component = Vec::new();

    for y in 0..height {
        for x in 0..width {
            if output[[y, x]] != 0 {
                continue;
            }

            let adjacent = neighbours_4con((y, x), (height, width))
                .map(|p| output[p])
                .find(|id| *id != 0);

            let cluster = labels[[y, x]];
            component.clear();
            output[[y, x]] = next_label;
            queue.push_back((y, x));
            while let Some((cy, cx)) = queue.pop_front() {
                component.push((cy, cx));
                for (ny, nx) in neighbours_4con((cy, cx), (height, width)) {
                    if output[[ny, nx]] == 0 && labels[[ny, nx]] == cluster {
                        output[[ny, nx]] = next_label;
                        queue.push_back((ny, nx));
                    }
                }
            }

            match adjacent {
                Some(id) if component.len() < min_size => {
                    for &(cy, cx) in &component {
                        output[[cy, cx]] = id;
                    }
                }
                _ => next_label += 1,
            }
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::utils::id_counts;

    #[test]
    fn test_two_halves() {
        let img = Array3::from_shape_fn((20, 40, 3), |(_, x, _)| if x < 20 { 0.1 } else { 0.9 });
        let labels = slic(img.view(), 2, 10.0, 0.0).unwrap();
        assert_eq!(labels.dim(), (20, 40));
        assert_eq!(*labels.iter().min().unwrap(), 1);
        // no region straddles the colour edge
        for y in 0..20 {
            assert_ne!(labels[[y, 19]], labels[[y, 20]]);
        }
    }

    #[test]
    fn test_ids_are_connected() {
        let img = Array3::from_shape_fn((32, 32, 1), |(y, x, _)| ((x * 7 + y * 3) % 11) as f32 / 10.0);
        let labels = slic(img.view(), 16, 5.0, 1.0).unwrap();
        let counts = id_counts(labels.view());
        assert_eq!(counts.values().sum::<u32>(), 32 * 32);
        assert_eq!(*counts.keys().next().unwrap(), 1);
        assert_eq!(*counts.keys().last().unwrap() as usize, counts.len());
    }

    #[test]
    fn test_enforce_connectivity_splits_and_folds() {
        let labels = array![[0usize, 0, 1, 0], [0, 0, 1, 0], [1, 1, 1, 1]];
        let out = enforce_connectivity(&labels, 3);
        // the 2-pixel right-hand piece of cluster 0 is folded into its neighbour
        assert_eq!(out, array![[1, 1, 2, 2], [1, 1, 2, 2], [2, 2, 2, 2]]);
    }
}
