//! Label categories and label-level clean-up.

use std::collections::BTreeSet;

use ndarray::{Array2, ArrayView2, Zip};
use serde::{Deserialize, Serialize};

use crate::{
    console_log,
    error::InfoError,
    filters::label_components,
    segment_info::{SegmentInfo, UNLABELED},
};

/// One category of a research field's label map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelEntry {
    pub id: u32,
    pub name: String,
    /// `#rrggbb`
    pub color: String,
}

pub fn parse_label_map(json: &str) -> Result<Vec<LabelEntry>, serde_json::Error> {
    serde_json::from_str(json)
}

/// Id of the entry named "unknown" (any case), 0 if there is none.
pub fn unknown_label_id(label_map: &[LabelEntry]) -> u32 {
    label_map
        .iter()
        .find(|entry| entry.name.eq_ignore_ascii_case("unknown"))
        .map_or(UNLABELED, |entry| entry.id)
}

/// Per-pixel label id. Unlabeled segments and segments labeled `unknown` are 0.
pub fn label_mask(segment_image: ArrayView2<u32>, info: &SegmentInfo, unknown: u32) -> Array2<u32> {
    let mut mask = Array2::<u32>::zeros(segment_image.dim());
    Zip::from(&mut mask).and(segment_image).for_each(|out, segment| {
        let label = info.label_of(*segment).unwrap_or(UNLABELED);
        *out = if label == unknown { UNLABELED } else { label };
    });
    mask
}

/// Fill the small holes of every label's area.
///
/// For each label (unknown excepted), the 4-connected regions outside the label
/// smaller than `area_fraction` of the image are holes; every segment with a
/// pixel in such a hole takes the label. Returns the number of relabeled
/// segments.
pub fn remove_small_labels(
    segment_image: ArrayView2<u32>,
    info: &mut SegmentInfo,
    area_fraction: f64,
    unknown: u32,
) -> Result<usize, InfoError> {
    if !(0.0..=1.0).contains(&area_fraction) {
        return Err(InfoError::InvalidFraction(area_fraction));
    }
    let (height, width) = segment_image.dim();
    let threshold = ((height * width) as f64 * area_fraction) as usize;

    let labels: BTreeSet<u32> = info
        .labels()
        .iter()
        .copied()
        .filter(|l| *l != UNLABELED && *l != unknown)
        .collect();

    let mut relabeled = 0;
    for label in labels {
        let mask = label_mask(segment_image, info, unknown);
        let outside = mask.mapv(|l| l != label);
        let (holes, count) = label_components(outside.view());

        let mut sizes = vec![0usize; count as usize + 1];
        for hole in holes.iter() {
            sizes[*hole as usize] += 1;
        }

        let mut touched = BTreeSet::new();
        Zip::from(&holes).and(segment_image).for_each(|hole, segment| {
            if *hole != 0 && sizes[*hole as usize] < threshold {
                touched.insert(*segment);
            }
        });

        let edits: Vec<(u32, u32)> = touched.into_iter().map(|segment| (segment, label)).collect();
        info.update_labels(&edits)?;
        relabeled += edits.len();
    }

    console_log!("Small label removal relabeled {} segments", relabeled);
    Ok(relabeled)
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    fn label_map() -> Vec<LabelEntry> {
        parse_label_map(
            r##"[
                {"id": 1, "name": "Ice", "color": "#ffffff"},
                {"id": 2, "name": "UNKNOWN", "color": "#808080"},
                {"id": 3, "name": "Water", "color": "#0000ff"}
            ]"##,
        )
        .unwrap()
    }

    #[test]
    fn test_unknown_label_id() {
        assert_eq!(unknown_label_id(&label_map()), 2);
        assert_eq!(unknown_label_id(&label_map()[..1]), 0);
    }

    #[test]
    fn test_label_mask_hides_unknown() {
        let segment_image = array![[1, 2], [3, 3]];
        let mut info = SegmentInfo::create(segment_image.view());
        info.update_labels(&[(1, 1), (2, 2)]).unwrap();
        assert_eq!(label_mask(segment_image.view(), &info, 2), array![[1, 0], [0, 0]]);
    }

    #[test]
    fn test_small_hole_takes_surrounding_label() {
        // segment 2 is a single pixel inside the 24 pixel segment 1
        let mut segment_image = Array2::<u32>::ones((5, 5));
        segment_image[[2, 2]] = 2;
        let mut info = SegmentInfo::create(segment_image.view());
        info.label_segment(1, 3).unwrap();

        // 1 pixel is not below 4% of 25 pixels
        assert_eq!(remove_small_labels(segment_image.view(), &mut info, 0.04, 2), Ok(0));
        assert_eq!(remove_small_labels(segment_image.view(), &mut info, 0.1, 2), Ok(1));
        assert_eq!(info.label_of(2), Some(3));
    }

    #[test]
    fn test_unknown_is_never_spread() {
        let mut segment_image = Array2::<u32>::ones((5, 5));
        segment_image[[2, 2]] = 2;
        let mut info = SegmentInfo::create(segment_image.view());
        info.label_segment(1, 2).unwrap();
        assert_eq!(remove_small_labels(segment_image.view(), &mut info, 0.5, 2), Ok(0));
        assert_eq!(info.label_of(2), Some(0));
    }
}
