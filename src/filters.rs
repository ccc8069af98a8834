//! Small neighbourhood filters shared by the segmentation algorithms.

use std::collections::VecDeque;

use ndarray::{Array1, Array2, Array3, ArrayView2, ArrayView3, Axis, Zip};

/// Offsets `(dy, dx)` of a disk structuring element of the given radius.
pub(crate) fn disk(radius: f64) -> Vec<(isize, isize)> {
    let r = radius.max(0.0).floor() as isize;
    let mut offsets = Vec::new();
    for dy in -r..=r {
        for dx in -r..=r {
            if dy * dy + dx * dx <= r * r {
                offsets.push((dy, dx));
            }
        }
    }
    offsets
}

fn gaussian_kernel(sigma: f64) -> Array1<f32> {
    let radius = (4.0 * sigma).ceil().max(1.0) as isize;
    let mut kernel = Array1::from_iter(
        (-radius..=radius).map(|x| (-(x * x) as f64 / (2.0 * sigma * sigma)).exp() as f32),
    );
    let sum = kernel.sum();
    kernel /= sum;
    kernel
}

/// Separable Gaussian smoothing of every channel, edges clamped.
/// Non-positive `sigma` returns a copy of the input.
pub(crate) fn gaussian_blur(image: ArrayView3<f32>, sigma: f64) -> Array3<f32> {
    if sigma.is_nan() || sigma <= 0.0 {
        return image.to_owned();
    }
    let kernel = gaussian_kernel(sigma);
    let radius = (kernel.len() / 2) as isize;
    let (height, width, channels) = image.dim();
    let clamp = |v: isize, len: usize| v.clamp(0, len as isize - 1) as usize;

    let mut horizontal = Array3::<f32>::zeros((height, width, channels));
    Zip::indexed(&mut horizontal).par_for_each(|(y, x, c), out| {
        *out = kernel
            .iter()
            .enumerate()
            .map(|(k, w)| w * image[[y, clamp(x as isize + k as isize - radius, width), c]])
            .sum();
    });

    let mut output = Array3::<f32>::zeros((height, width, channels));
    Zip::indexed(&mut output).par_for_each(|(y, x, c), out| {
        *out = kernel
            .iter()
            .enumerate()
            .map(|(k, w)| w * horizontal[[clamp(y as isize + k as isize - radius, height), x, c]])
            .sum();
    });
    output
}

/// Rank filter over a disk footprint. Pixels outside the image are ignored.
fn rank_filter<F>(image: ArrayView2<u8>, radius: f64, pick: F) -> Array2<u8>
where
    F: Fn(&[u32; 256], u32) -> u8 + Sync,
{
    let offsets = disk(radius);
    let (height, width) = image.dim();
    let mut output = Array2::<u8>::zeros((height, width));

    Zip::indexed(&mut output).par_for_each(|(y, x), out| {
        let mut histogram = [0u32; 256];
        let mut count = 0;
        for &(dy, dx) in &offsets {
            let (ny, nx) = (y as isize + dy, x as isize + dx);
            if ny < 0 || nx < 0 || ny >= height as isize || nx >= width as isize {
                continue;
            }
            histogram[image[[ny as usize, nx as usize]] as usize] += 1;
            count += 1;
        }
        *out = pick(&histogram, count);
    });
    output
}

pub(crate) fn median_disk(image: ArrayView2<u8>, radius: f64) -> Array2<u8> {
    rank_filter(image, radius, |histogram, count| {
        let target = count / 2;
        let mut seen = 0;
        for (value, &n) in histogram.iter().enumerate() {
            seen += n;
            if seen > target {
                return value as u8;
            }
        }
        255
    })
}

/// Local `max - min` over a disk footprint.
pub(crate) fn gradient_disk(image: ArrayView2<u8>, radius: f64) -> Array2<u8> {
    rank_filter(image, radius, |histogram, _| {
        let lo = histogram.iter().position(|&n| n > 0).unwrap_or(0);
        let hi = histogram.iter().rposition(|&n| n > 0).unwrap_or(0);
        (hi - lo) as u8
    })
}

/// Scale a `[0, 1]` band to 8 bits, clipping values outside the range.
pub(crate) fn to_u8_band(band: ArrayView2<f32>) -> Array2<u8> {
    band.mapv(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
}

/// Split into per-channel bands, apply `f`, and stack them back.
pub(crate) fn map_channels<F>(image: ArrayView3<f32>, mut f: F) -> Array3<f32>
where
    F: FnMut(ArrayView2<f32>) -> Array2<f32>,
{
    let mut output = Array3::<f32>::zeros(image.dim());
    for (band, mut out) in image.axis_iter(Axis(2)).zip(output.axis_iter_mut(Axis(2))) {
        out.assign(&f(band));
    }
    output
}

/// The 4-connected neighbours of `(y, x)` inside a `(height, width)` grid.
pub(crate) fn neighbours_4con(
    (y, x): (usize, usize),
    (height, width): (usize, usize),
) -> impl Iterator<Item = (usize, usize)> {
    [(0isize, -1isize), (-1, 0), (0, 1), (1, 0)]
        .into_iter()
        .filter_map(move |(dy, dx)| {
            let (ny, nx) = (y as isize + dy, x as isize + dx);
            (ny >= 0 && nx >= 0 && ny < height as isize && nx < width as isize)
                .then_some((ny as usize, nx as usize))
        })
}

/// Number the 4-connected components of `mask` from 1 in raster order.
/// Background pixels are 0. Returns the labels and the component count.
pub(crate) fn label_components(mask: ArrayView2<bool>) -> (Array2<u32>, u32) {
    let dim = mask.dim();
    let mut labels = Array2::<u32>::zeros(dim);
    let mut count = 0;
    let mut queue = VecDeque::new();

    for ((y, x), inside) in mask.indexed_iter() {
        if !*inside || labels[[y, x]] != 0 {
            continue;
        }
        count += 1;
        labels[[y, x]] = count;
        queue.push_back((y, x));
        while let Some(p) = queue.pop_front() {
            for (ny, nx) in neighbours_4con(p, dim) {
                if mask[[ny, nx]] && labels[[ny, nx]] == 0 {
                    labels[[ny, nx]] = count;
                    queue.push_back((ny, nx));
                }
            }
        }
    }
    (labels, count)
}
