use std::{cmp::Reverse, collections::BinaryHeap};

use ndarray::{Array2, ArrayView2, ArrayView3};

use crate::{
    console_log,
    error::SegmentError,
    filters::{gradient_disk, label_components, median_disk, neighbours_4con, to_u8_band},
    utils::gray,
    SegmentImage,
};

/// Marker-based watershed on the morphological gradient of the median-filtered
/// gray image.
///
/// `smoothing_radius` is the disk radius of both filters; markers are the
/// connected areas whose gradient is below `gradient_cut` (8-bit scale).
pub(crate) fn watershed(
    image: ArrayView3<f32>,
    smoothing_radius: f64,
    gradient_cut: f64,
) -> Result<SegmentImage, SegmentError> {
    let gray = to_u8_band(gray(image).view());
    let denoised = median_disk(gray.view(), smoothing_radius);
    let mut gradient = gradient_disk(denoised.view(), smoothing_radius);

    // A cut below the whole gradient would leave no marker at all
    let min = gradient.iter().min().copied().unwrap_or(0);
    if f64::from(min) >= gradient_cut {
        log::warn!(
            "gradient minimum {} is above the gradient cut {}, shifting the gradient",
            min,
            gradient_cut
        );
        gradient.mapv_inplace(|g| g - min);
    }

    let markers = gradient.mapv(|g| f64::from(g) < gradient_cut);
    let (markers, count) = label_components(markers.view());
    if count == 0 {
        return Err(SegmentError::Degenerate(format!(
            "no watershed marker below gradient cut {gradient_cut}"
        )));
    }
    console_log!("Watershed: {} markers", count);

    Ok(flood(gradient.view(), markers))
}

/// Priority-flood from labeled markers, lowest gradient first. Ties are
/// resolved in insertion order.
fn flood(gradient: ArrayView2<u8>, mut labels: Array2<u32>) -> SegmentImage {
    let dim = gradient.dim();
    let mut heap = BinaryHeap::new();
    let mut age = 0u64;

    for ((y, x), label) in labels.indexed_iter() {
        if *label != 0 {
            heap.push(Reverse((gradient[[y, x]], age, y, x)));
            age += 1;
        }
    }

    while let Some(Reverse((_, _, y, x))) = heap.pop() {
        let label = labels[[y, x]];
        for (ny, nx) in neighbours_4con((y, x), dim) {
            if labels[[ny, nx]] == 0 {
                labels[[ny, nx]] = label;
                heap.push(Reverse((gradient[[ny, nx]], age, ny, nx)));
                age += 1;
            }
        }
    }

    labels
}
