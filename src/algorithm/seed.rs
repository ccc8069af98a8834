use ndarray::{s, Array1, ArrayView3};
use num_traits::ToPrimitive;
use simple_clustering::error::{ScError, SeedErrorKind};
use simple_clustering::Superpixel;

use super::slic_helpers::{distance_pixel, get_pixel};

/// Initialize the superpixel seed centers on a regular grid of step `s`.
///
/// `width`, `height`, `s`, and `k` must not be `0`.
pub fn init_seeds(
    s: u32,
    k: u32,
    image: ArrayView3<f32>,
    seeds: &mut Vec<Superpixel<Array1<f32>>>,
) -> Result<(), ScError> {
    seeds.clear();
    let width = image.shape()[1] as u32;
    let height = image.shape()[0] as u32;
    let half_s = s.div_ceil(2);
    let mut x_seeds = width.div_ceil(s);
    let mut y_seeds = height.div_ceil(s);

    // The seeds per row and column might be too high due to the div_ceil
    if u64::from(s) * u64::from(x_seeds) > u64::from(width) {
        x_seeds -= 1;
    }
    if u64::from(s) * u64::from(y_seeds) > u64::from(height) {
        y_seeds -= 1;
    }

    // If the seed count is larger than k, reduce until we're below (the
    // connectivity step may still add regions later)
    while u64::from(x_seeds) * u64::from(y_seeds) > u64::from(k) {
        x_seeds = x_seeds.saturating_sub(1);
        y_seeds = y_seeds.saturating_sub(1);
    }

    // Edge case for very small image sizes where no clusters would be produced
    x_seeds = x_seeds.max(1);
    y_seeds = y_seeds.max(1);

    // Spread the seeds out evenly along rows/cols
    let x_correction = (f64::from(width) - f64::from(x_seeds) * f64::from(s)) / f64::from(x_seeds);
    let y_correction = (f64::from(height) - f64::from(y_seeds) * f64::from(s)) / f64::from(y_seeds);

    let total_seeds = usize::try_from(u64::from(x_seeds) * u64::from(y_seeds))
        .or(Err(ScError::SeedError(SeedErrorKind::InvalidTotalSeeds)))?;

    if total_seeds > seeds.capacity() {
        seeds.try_reserve_exact(total_seeds - seeds.capacity())?;
    }

    for ydx in 0..y_seeds {
        let y_correct = (f64::from(ydx) * y_correction).max(0.0)
            .to_u32()
            .ok_or("Could not convert Y correction")?;
        for xdx in 0..x_seeds {
            let x_correct = (f64::from(xdx) * x_correction).max(0.0)
                .to_u32()
                .ok_or("Could not convert X correction")?;
            let x = xdx
                .saturating_mul(s)
                .saturating_add(half_s)
                .saturating_add(x_correct)
                .min(width.saturating_sub(1));
            let y = ydx
                .saturating_mul(s)
                .saturating_add(half_s)
                .saturating_add(y_correct)
                .min(height.saturating_sub(1));
            if x < width && y < height {
                seeds.push(Superpixel {
                    data: image.slice(s![y as usize, x as usize, ..]).to_owned(),
                    x,
                    y,
                });
            }
        }
    }

    Ok(())
}

/// Find the lowest gradient in a 3x3 neighborhood for a seed.
///
/// This step minimizes the chance that a noisy pixel is chosen as a seed.
pub fn perturb(seed: &mut Superpixel<Array1<f32>>, image: ArrayView3<f32>) -> Result<(), ScError> {
    let mut min = f64::INFINITY;
    let default = Array1::<f32>::zeros(image.shape()[2]);
    let sp_x = seed.x as i32;
    let sp_y = seed.y as i32;

    // Gradient equation is
    // fn gradient() -> f64 {
    //     (I[x + 1, y] - I[x - 1, y]).powi(2) +
    //     (I[x, y + 1] - I[x, y - 1]).powi(2)
    // }
    for ydx in -1..=1 {
        for xdx in -1..=1 {
            let (cx, cy) = (sp_x + xdx, sp_y + ydx);
            let Some(pixel) = get_pixel(cx, cy, image) else {
                continue;
            };

            // Out-of-image neighbours count as zero
            let at = |x: i32, y: i32| -> Array1<f32> {
                get_pixel(x, y, image).map_or_else(|| default.clone(), |v| v.to_owned())
            };
            let (a, b) = (at(cx + 1, cy), at(cx - 1, cy));
            let (c, d) = (at(cx, cy + 1), at(cx, cy - 1));

            let gradient = distance_pixel(a.view(), b.view()) + distance_pixel(c.view(), d.view());

            if gradient < min {
                min = gradient;
                seed.data = pixel.to_owned();
                seed.x = u32::try_from(cx)
                    .or(Err(ScError::SeedError(SeedErrorKind::PerturbConversion)))?;
                seed.y = u32::try_from(cy)
                    .or(Err(ScError::SeedError(SeedErrorKind::PerturbConversion)))?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use ndarray::Array3;

    use super::*;

    #[test]
    fn test_seed_grid() {
        let img = Array3::<f32>::zeros((20, 20, 3));
        let mut seeds = Vec::new();
        init_seeds(10, 4, img.view(), &mut seeds).unwrap();
        assert_eq!(seeds.len(), 4);
        assert_eq!((seeds[0].x, seeds[0].y), (5, 5));
        assert_eq!((seeds[3].x, seeds[3].y), (15, 15));
    }

    #[test]
    fn test_seed_count_capped() {
        let img = Array3::<f32>::zeros((30, 30, 1));
        let mut seeds = Vec::new();
        init_seeds(5, 4, img.view(), &mut seeds).unwrap();
        assert!(seeds.len() <= 4);
        assert!(!seeds.is_empty());
    }

    #[test]
    fn test_perturb_moves_off_edge() {
        // vertical edge between columns 2 and 3
        let img = Array3::from_shape_fn((5, 6, 1), |(_, x, _)| if x < 3 { 0.0 } else { 1.0 });
        let mut seed = Superpixel {
            data: Array1::zeros(1),
            x: 2,
            y: 2,
        };
        perturb(&mut seed, img.view()).unwrap();
        assert_eq!(seed.x, 1);
        assert_eq!(seed.data[0], 0.0);
    }

    #[test]
    fn test_perturb_treats_outside_as_zero() {
        // on a flat image only the borders carry a gradient
        let img = Array3::<f32>::ones((3, 3, 1));
        let mut seed = Superpixel {
            data: Array1::zeros(1),
            x: 0,
            y: 0,
        };
        perturb(&mut seed, img.view()).unwrap();
        assert_eq!((seed.x, seed.y), (1, 1));
        assert_eq!(seed.data[0], 1.0);
    }
}
