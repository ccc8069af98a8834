use ndarray::ArrayView3;

use crate::{
    console_log,
    error::SegmentError,
    graph::RegionGraph,
    merge::merge,
    parameters::ParameterSet,
    utils::{ensure_positive_ids, id_counts, relabel_sequential},
    SegmentImage,
};

/// User thresholds are expressed in units of this many pixels.
pub const REMOVAL_SCALE: u32 = 5;

/// Merge every region of at most `pixel_threshold × 5` pixels into its
/// closest-coloured neighbour, then renumber to `1..=N`.
///
/// Regions are visited in ascending id order; a region that already grew past
/// the threshold by absorbing a smaller one is left alone. Ties between equally
/// close neighbours go to the lowest id. If removal fails the input is returned.
pub fn remove_small(
    segment_image: &SegmentImage,
    reference: ArrayView3<f32>,
    pixel_threshold: u32,
) -> SegmentImage {
    match try_remove_small(segment_image, reference, pixel_threshold) {
        Ok(cleaned) => cleaned,
        Err(err) => {
            log::warn!("small region removal failed, keeping segments: {err}");
            segment_image.clone()
        }
    }
}

fn try_remove_small(
    segment_image: &SegmentImage,
    reference: ArrayView3<f32>,
    pixel_threshold: u32,
) -> Result<SegmentImage, SegmentError> {
    // One graph node per id: compact sparse ids first
    let segment_image = &relabel_sequential(segment_image);
    let threshold = pixel_threshold.saturating_mul(REMOVAL_SCALE);
    let candidates: Vec<u32> = id_counts(segment_image.view())
        .into_iter()
        .filter(|(_, count)| *count <= threshold)
        .map(|(id, _)| id)
        .collect();
    console_log!("{} segments to be removed", candidates.len());

    let mut rag = RegionGraph::from_labels(reference, segment_image.view())?;
    for segment in candidates {
        if !rag.is_alive(segment) || rag.node(segment).pixel_count() > threshold {
            continue;
        }
        let closest = rag
            .neighbors(segment)
            .into_iter()
            .fold(None, |best: Option<(u32, f64)>, (n, weight)| match best {
                Some((_, w)) if w <= weight => best,
                _ => Some((n, weight)),
            });
        if let Some((target, _)) = closest {
            rag.merge(segment, target);
        }
    }

    Ok(relabel_sequential(&rag.relabel(segment_image.view())))
}

/// Region merge, then small-region removal, as enabled in `params`.
pub fn postprocess(
    segment_image: SegmentImage,
    reference: ArrayView3<f32>,
    params: &ParameterSet,
) -> SegmentImage {
    let mut segment_image = segment_image;
    if let Some(region_merge) = &params.region_merge {
        segment_image = merge(&segment_image, reference, region_merge.method, region_merge.threshold);
    }
    if let Some(pixel_threshold) = params.small_removal {
        segment_image = remove_small(&segment_image, reference, pixel_threshold);
    }
    ensure_positive_ids(segment_image)
}
