//! Review previews: segment boundaries and label colours drawn over the visual.

use std::{collections::HashMap, str::FromStr};

use image::ImageResult;
use ndarray::{Array3, ArrayView2, ArrayView3};
use num_traits::ToPrimitive;
use palette::Srgb;
use serde::{Deserialize, Serialize};

use crate::{
    error::InfoError,
    filters::neighbours_4con,
    labels::LabelEntry,
    segment_info::{SegmentInfo, UNLABELED},
    utils::{array_to_png, to_rgb8},
};

/// Lighting classification of the photographed scene, supplied by the caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lighting {
    Bright,
    Medium,
    Dark,
    #[default]
    Unknown,
}

impl Lighting {
    /// Unrecognized names map to [`Lighting::Unknown`].
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "bright" => Self::Bright,
            "medium" => Self::Medium,
            "dark" => Self::Dark,
            _ => Self::Unknown,
        }
    }

    pub fn boundary_color(self) -> [u8; 3] {
        match self {
            Lighting::Bright | Lighting::Medium => [0, 0, 255],
            Lighting::Dark | Lighting::Unknown => [166, 217, 255],
        }
    }
}

/// Convert `visual` to 8-bit RGB and paint every pixel whose id differs from
/// one of its 4-neighbours.
pub fn mark<T>(
    visual: ArrayView3<T>,
    segment_image: ArrayView2<u32>,
    lighting: Lighting,
) -> Result<Array3<u8>, InfoError>
where
    T: ToPrimitive + Copy,
{
    let (height, width, _) = visual.dim();
    if segment_image.dim() != (height, width) {
        return Err(InfoError::MalformedTable(format!(
            "segment image {:?} does not match image {:?}",
            segment_image.dim(),
            (height, width)
        )));
    }

    let mut marked = to_rgb8(visual);
    let color = lighting.boundary_color();
    for ((y, x), id) in segment_image.indexed_iter() {
        let on_boundary =
            neighbours_4con((y, x), (height, width)).any(|(ny, nx)| segment_image[[ny, nx]] != *id);
        if on_boundary {
            for (c, value) in color.iter().enumerate() {
                marked[[y, x, c]] = *value;
            }
        }
    }
    Ok(marked)
}

fn parse_color(hex: &str) -> Result<[u8; 3], InfoError> {
    let color = Srgb::<u8>::from_str(hex).map_err(|_| InfoError::InvalidColor(hex.to_string()))?;
    Ok([color.red, color.green, color.blue])
}

/// Blend the colour of every labeled segment over `marked` with opacity
/// `alpha`. Unlabeled segments and labels missing from `label_map` are left
/// as they are.
pub fn color_labels(
    marked: ArrayView3<u8>,
    segment_image: ArrayView2<u32>,
    info: &SegmentInfo,
    label_map: &[LabelEntry],
    alpha: f32,
) -> Result<Array3<u8>, InfoError> {
    if !(0.0..=1.0).contains(&alpha) {
        return Err(InfoError::InvalidOpacity(alpha));
    }
    let (height, width, _) = marked.dim();
    if segment_image.dim() != (height, width) {
        return Err(InfoError::MalformedTable(format!(
            "segment image {:?} does not match image {:?}",
            segment_image.dim(),
            (height, width)
        )));
    }

    let colors = label_map
        .iter()
        .map(|entry| Ok((entry.id, parse_color(&entry.color)?)))
        .collect::<Result<HashMap<u32, [u8; 3]>, InfoError>>()?;

    let mut colored = marked.to_owned();
    for ((y, x), segment) in segment_image.indexed_iter() {
        let label = info.label_of(*segment).unwrap_or(UNLABELED);
        if label == UNLABELED {
            continue;
        }
        if let Some(color) = colors.get(&label) {
            for (c, value) in color.iter().enumerate() {
                let blended = marked[[y, x, c]] as f32 * (1.0 - alpha) + *value as f32 * alpha;
                colored[[y, x, c]] = blended.clamp(0.0, 255.0) as u8;
            }
        }
    }
    Ok(colored)
}

/// PNG bytes of a marked or coloured preview. Gray previews are accepted;
/// a preview without channels is an error.
pub fn encode_png(preview: ArrayView3<u8>) -> ImageResult<Vec<u8>> {
    array_to_png(preview)
}

#[cfg(test)]
mod tests {
    use ndarray::{array, s, Array2};

    use super::*;

    #[test]
    fn test_mark_draws_both_sides_of_an_edge() {
        let visual = Array3::<f32>::zeros((2, 4, 3));
        let segments = array![[1, 1, 2, 2], [1, 1, 2, 2]];
        let marked = mark(visual.view(), segments.view(), Lighting::Bright).unwrap();

        assert_eq!(marked.dim(), (2, 4, 3));
        assert_eq!(marked.slice(s![0, 1, ..]), array![0, 0, 255]);
        assert_eq!(marked.slice(s![1, 2, ..]), array![0, 0, 255]);
        assert_eq!(marked.slice(s![0, 0, ..]), array![0, 0, 0]);
        assert_eq!(marked.slice(s![1, 3, ..]), array![0, 0, 0]);
    }

    #[test]
    fn test_boundary_color_follows_lighting() {
        assert_eq!(Lighting::from_name("Medium").boundary_color(), [0, 0, 255]);
        assert_eq!(Lighting::from_name("dark").boundary_color(), [166, 217, 255]);
        assert_eq!(Lighting::from_name("overcast"), Lighting::Unknown);
    }

    #[test]
    fn test_gray_u16_input_becomes_rgb8() {
        let visual = Array3::<u16>::from_elem((3, 3, 1), 1000);
        let segments = Array2::<u32>::ones((3, 3));
        let marked = mark(visual.view(), segments.view(), Lighting::Dark).unwrap();
        assert_eq!(marked.dim(), (3, 3, 3));
        // single region: nothing is drawn
        assert!(marked.iter().all(|v| *v == marked[[0, 0, 0]]));
    }

    #[test]
    fn test_color_labels_blends_labeled_segments() {
        let marked = Array3::<u8>::from_elem((1, 2, 3), 100);
        let segments = array![[1, 2]];
        let mut info = SegmentInfo::create(segments.view());
        info.label_segment(1, 3).unwrap();
        let label_map = vec![LabelEntry {
            id: 3,
            name: "tree".into(),
            color: "#ff0000".into(),
        }];

        let colored = color_labels(marked.view(), segments.view(), &info, &label_map, 0.5).unwrap();
        assert_eq!(colored.slice(s![0, 0, ..]), array![177, 50, 50]);
        assert_eq!(colored.slice(s![0, 1, ..]), array![100, 100, 100]);
    }

    #[test]
    fn test_color_labels_rejects_bad_input() {
        let marked = Array3::<u8>::zeros((1, 1, 3));
        let segments = array![[1]];
        let info = SegmentInfo::create(segments.view());
        assert_eq!(
            color_labels(marked.view(), segments.view(), &info, &[], 1.5),
            Err(InfoError::InvalidOpacity(1.5))
        );

        let label_map = vec![LabelEntry {
            id: 1,
            name: "water".into(),
            color: "blue".into(),
        }];
        assert_eq!(
            color_labels(marked.view(), segments.view(), &info, &label_map, 0.7),
            Err(InfoError::InvalidColor("blue".into()))
        );
    }

    #[test]
    fn test_encode_png_signature() {
        let png = encode_png(Array3::<u8>::zeros((2, 2, 3)).view()).unwrap();
        assert_eq!(&png[1..4], b"PNG");
        assert!(encode_png(Array3::<u8>::zeros((2, 2, 1)).view()).is_ok());
        assert!(encode_png(Array3::<u8>::zeros((2, 2, 0)).view()).is_err());
    }
}
