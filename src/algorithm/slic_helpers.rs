use ndarray::{s, ArrayView1, ArrayView3};
use num_traits::Float;

/// Calculate the superpixel side length, `S`.
///
/// `S * S` is the approximate size of each superpixel in pixels. The formula is
/// `S = (N / K).sqrt()`, where `N` is the number of pixels and `K` is the
/// number of desired superpixels.
#[inline]
pub fn calculate_grid_interval(width: u32, height: u32, superpixels: u32) -> f64 {
    ((f64::from(width) * f64::from(height)) / f64::from(superpixels)).sqrt()
}

/// Squared colour distance between two pixels
#[inline]
pub fn distance_pixel(lhs: ArrayView1<f32>, rhs: ArrayView1<f32>) -> f64 {
    lhs.iter()
        .zip(rhs.iter())
        .map(|(a, b)| {
            let diff = f64::from(*a) - f64::from(*b);
            diff * diff
        })
        .sum()
}

/// Calculate the distance between two two-dimensional points.
#[inline]
pub fn distance_xy<T: Float>(lhs: (T, T), rhs: (T, T)) -> T {
    (rhs.0 - lhs.0).powi(2) + (rhs.1 - lhs.1).powi(2)
}

/// Calculate the `s` distance.
#[inline]
pub fn distance_s<T: Float>(m_div_s: T, d_lab: T, d_xy: T) -> T {
    d_lab + m_div_s * d_xy
}

/// Calculate the superpixel scaling factor.
///
/// `m_div_s` is `(m / s).powi(2)`.
#[inline]
pub fn m_div_s(m: f64, s: f64) -> f64 {
    (m / s).powi(2)
}

/// Checks if the index is in bounds and returns the pixel data at that point if it exists.
#[inline]
pub fn get_pixel(x: i32, y: i32, image: ArrayView3<f32>) -> Option<ArrayView1<f32>> {
    if (0..(image.shape()[0] as i32)).contains(&y) && (0..(image.shape()[1] as i32)).contains(&x) {
        Some(image.slice_move(s![y, x, ..]))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{array, Array3};

    use super::*;

    #[test]
    fn test_grid_interval() {
        assert_eq!(calculate_grid_interval(10, 10, 4), 5.0);
    }

    #[test]
    fn test_distances() {
        let a = array![0.0f32, 1.0, 2.0];
        let b = array![1.0f32, 1.0, 0.0];
        assert_eq!(distance_pixel(a.view(), b.view()), 5.0);
        assert_eq!(distance_xy((0.0, 0.0), (3.0, 4.0)), 25.0);
        assert_eq!(distance_s(m_div_s(10.0, 5.0), 1.0, 2.0), 9.0);
    }

    #[test]
    fn test_get_pixel_bounds() {
        let img = Array3::<f32>::zeros((2, 3, 1));
        assert!(get_pixel(2, 1, img.view()).is_some());
        assert!(get_pixel(3, 1, img.view()).is_none());
        assert!(get_pixel(0, -1, img.view()).is_none());
    }
}
