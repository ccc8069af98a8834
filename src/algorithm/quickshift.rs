use ndarray::{Array2, Array3, ArrayView3, Zip};
use palette::{FromColor, Lab, Srgb};

use crate::{
    console_log, error::SegmentError, filters::gaussian_blur, utils::number_by_appearance,
    SegmentImage,
};

/// Weight of colour against position in the joint feature space.
const RATIO: f32 = 0.75;

fn features(image: ArrayView3<f32>, sigma: f64) -> Array3<f32> {
    let smoothed = gaussian_blur(image, sigma);
    if smoothed.dim().2 != 3 {
        return smoothed.mapv(|v| v * RATIO);
    }
    let mut lab = Array3::<f32>::zeros(smoothed.dim());
    Zip::from(lab.rows_mut())
        .and(smoothed.rows())
        .for_each(|mut out, pixel| {
            let rgb = Srgb::new(
                pixel[0].clamp(0.0, 1.0),
                pixel[1].clamp(0.0, 1.0),
                pixel[2].clamp(0.0, 1.0),
            );
            let color: Lab = Lab::from_color(rgb.into_linear());
            out[0] = color.l * RATIO;
            out[1] = color.a * RATIO;
            out[2] = color.b * RATIO;
        });
    lab
}

fn joint_distance(features: &Array3<f32>, (y, x): (usize, usize), (ny, nx): (usize, usize)) -> f32 {
    let dy = y as f32 - ny as f32;
    let dx = x as f32 - nx as f32;
    let mut d = dy * dy + dx * dx;
    for c in 0..features.dim().2 {
        let diff = features[[y, x, c]] - features[[ny, nx, c]];
        d += diff * diff;
    }
    d
}

/// Mode seeking: every pixel links to the closest pixel of higher Parzen
/// density within `max_distance`; pixels without one start a region.
pub(crate) fn quickshift(
    image: ArrayView3<f32>,
    kernel_size: f64,
    max_distance: f64,
    sigma: f64,
) -> Result<SegmentImage, SegmentError> {
    if !(kernel_size.is_finite() && kernel_size > 0.0) {
        return Err(SegmentError::InvalidInput(format!(
            "quickshift kernel size must be positive, got {kernel_size}"
        )));
    }
    let features = features(image, sigma);
    let (height, width, _) = features.dim();
    let window = (3.0 * kernel_size).ceil() as isize;
    let inv_two_var = 1.0 / (2.0 * kernel_size * kernel_size) as f32;
    let max_sq = (max_distance * max_distance) as f32;

    let window_of = move |y: usize, x: usize| {
        let y_lo = (y as isize - window).max(0) as usize;
        let y_hi = (y as isize + window + 1).min(height as isize) as usize;
        let x_lo = (x as isize - window).max(0) as usize;
        let x_hi = (x as isize + window + 1).min(width as isize) as usize;
        (y_lo..y_hi).flat_map(move |ny| (x_lo..x_hi).map(move |nx| (ny, nx)))
    };

    let mut density = Array2::<f32>::zeros((height, width));
    Zip::indexed(&mut density).par_for_each(|(y, x), out| {
        *out = window_of(y, x)
            .map(|n| (-joint_distance(&features, (y, x), n) * inv_two_var).exp())
            .sum();
    });

    let mut parents = Array2::<usize>::zeros((height, width));
    Zip::indexed(&mut parents).par_for_each(|(y, x), parent| {
        let own = density[[y, x]];
        let mut best = (f32::INFINITY, y * width + x);
        for (ny, nx) in window_of(y, x) {
            if density[[ny, nx]] > own {
                let d = joint_distance(&features, (y, x), (ny, nx));
                if d < best.0 && d <= max_sq {
                    best = (d, ny * width + nx);
                }
            }
        }
        *parent = best.1;
    });

    // Links always climb in density, so chains end at a root
    let parents = parents.into_raw_vec();
    let mut roots = vec![usize::MAX; parents.len()];
    let mut chain = Vec::new();
    for start in 0..parents.len() {
        let mut i = start;
        while roots[i] == usize::MAX && parents[i] != i {
            chain.push(i);
            i = parents[i];
        }
        let root = if roots[i] == usize::MAX { i } else { roots[i] };
        roots[i] = root;
        for j in chain.drain(..) {
            roots[j] = root;
        }
    }

    let labels = number_by_appearance(&roots, (height, width));
    console_log!("Quickshift: {} regions", labels.iter().max().copied().unwrap_or(0));
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::id_counts;

    #[test]
    fn test_separates_distinct_colors() {
        let img = Array3::from_shape_fn((12, 12, 3), |(_, x, _)| if x < 6 { 0.05 } else { 0.95 });
        let labels = quickshift(img.view(), 2.0, 6.0, 0.0).unwrap();
        assert_eq!(*labels.iter().min().unwrap(), 1);
        for y in 0..12 {
            assert_ne!(labels[[y, 5]], labels[[y, 6]]);
        }
    }

    #[test]
    fn test_zero_max_distance_gives_singletons() {
        let img = Array3::from_shape_fn((4, 4, 1), |(y, x, _)| (y * 4 + x) as f32 / 16.0);
        let labels = quickshift(img.view(), 1.0, 0.0, 0.0).unwrap();
        assert_eq!(id_counts(labels.view()).len(), 16);
    }

    #[test]
    fn test_rejects_non_positive_kernel() {
        let img = Array3::<f32>::zeros((4, 4, 1));
        assert!(matches!(
            quickshift(img.view(), 0.0, 5.0, 0.0),
            Err(SegmentError::InvalidInput(_))
        ));
    }
}
