//! Training datasets built from labeled segment images.
//!
//! A training file is an `.npz` archive with one row per segment: the label
//! vector, a feature matrix and a link table tying every row back to the
//! segment, segment image, crop image and original image it came from.

use std::{collections::BTreeSet, fs::File, path::Path};

use ndarray::{
    concatenate, Array1, Array2, ArrayView1, ArrayView2, ArrayView3, Axis, Ix1, Ix2, OwnedRepr,
};
use ndarray_npy::{NpzReader, NpzWriter};

use crate::{
    console_log,
    error::{InfoError, RecordError},
    record::{check_path, entry_name, replace_atomically, require_entries},
    segment_info::SegmentInfo,
};

pub const LABEL_VECTOR: &str = "label_vector";
pub const FEATURE_MATRIX: &str = "feature_matrix";
pub const SEGMENT_ID_LINK: &str = "segment_id_link";

const LINK_SEGMENT: usize = 0;
const LINK_SEGMENT_IMAGE: usize = 1;
const LINK_CROP_IMAGE: usize = 2;
const LINK_ORIGINAL_IMAGE: usize = 3;

/// N×4 table of `(segment_number, segment_image_id, crop_image_id,
/// original_image_id)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentIdLink {
    table: Array2<u32>,
}

impl SegmentIdLink {
    pub fn new(
        info: &SegmentInfo,
        segment_image_id: u32,
        crop_image_id: u32,
        original_image_id: u32,
    ) -> Self {
        let mut table = Array2::<u32>::zeros((info.len(), 4));
        table.column_mut(LINK_SEGMENT).assign(&info.segment_numbers());
        table.column_mut(LINK_SEGMENT_IMAGE).fill(segment_image_id);
        table.column_mut(LINK_CROP_IMAGE).fill(crop_image_id);
        table.column_mut(LINK_ORIGINAL_IMAGE).fill(original_image_id);
        Self { table }
    }

    pub fn from_table(table: Array2<u32>) -> Result<Self, RecordError> {
        if table.ncols() != 4 {
            return Err(RecordError::Inconsistent(format!(
                "segment id link has {} columns instead of 4",
                table.ncols()
            )));
        }
        Ok(Self { table })
    }

    pub fn table(&self) -> ArrayView2<u32> {
        self.table.view()
    }

    pub fn len(&self) -> usize {
        self.table.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.table.nrows() == 0
    }

    pub fn segment_numbers(&self) -> ArrayView1<u32> {
        self.table.column(LINK_SEGMENT)
    }

    pub fn segment_image_ids(&self) -> ArrayView1<u32> {
        self.table.column(LINK_SEGMENT_IMAGE)
    }
}

/// Distinct image ids referenced by a link table, ascending.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParentIds {
    pub segment_image_ids: Vec<u32>,
    pub crop_image_ids: Vec<u32>,
    pub original_image_ids: Vec<u32>,
}

pub fn unique_parent_ids(link: &SegmentIdLink) -> ParentIds {
    let unique = |column: usize| -> Vec<u32> {
        link.table
            .column(column)
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    };
    ParentIds {
        segment_image_ids: unique(LINK_SEGMENT_IMAGE),
        crop_image_ids: unique(LINK_CROP_IMAGE),
        original_image_ids: unique(LINK_ORIGINAL_IMAGE),
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrainingRecord {
    pub labels: Array1<u32>,
    pub features: Array2<f64>,
    pub link: SegmentIdLink,
}

impl TrainingRecord {
    pub fn new(
        labels: Array1<u32>,
        features: Array2<f64>,
        link: SegmentIdLink,
    ) -> Result<Self, RecordError> {
        if labels.len() != features.nrows() || labels.len() != link.len() {
            return Err(RecordError::Inconsistent(format!(
                "{} labels, {} feature rows and {} link rows",
                labels.len(),
                features.nrows(),
                link.len()
            )));
        }
        Ok(Self {
            labels,
            features,
            link,
        })
    }

    /// Labels, features and link rows of every segment in `info`.
    pub fn from_segments(
        image: ArrayView3<f32>,
        segment_image: ArrayView2<u32>,
        info: &SegmentInfo,
        segment_image_id: u32,
        crop_image_id: u32,
        original_image_id: u32,
    ) -> Result<Self, RecordError> {
        let features = region_features(image, segment_image, info)?;
        let link = SegmentIdLink::new(info, segment_image_id, crop_image_id, original_image_id);
        Self::new(info.labels().to_owned(), features, link)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    fn select(&self, rows: &[usize]) -> Self {
        Self {
            labels: self.labels.select(Axis(0), rows),
            features: self.features.select(Axis(0), rows),
            link: SegmentIdLink {
                table: self.link.table.select(Axis(0), rows),
            },
        }
    }

    fn append(&self, other: &Self) -> Result<Self, RecordError> {
        let mismatch = |err: ndarray::ShapeError| RecordError::Inconsistent(err.to_string());
        if !self.is_empty() && self.features.ncols() != other.features.ncols() {
            return Err(RecordError::Inconsistent(format!(
                "training file has {} features per segment, new rows have {}",
                self.features.ncols(),
                other.features.ncols()
            )));
        }
        if self.is_empty() {
            return Ok(other.clone());
        }
        Self::new(
            concatenate(Axis(0), &[self.labels.view(), other.labels.view()]).map_err(mismatch)?,
            concatenate(Axis(0), &[self.features.view(), other.features.view()])
                .map_err(mismatch)?,
            SegmentIdLink {
                table: concatenate(Axis(0), &[self.link.table.view(), other.link.table.view()])
                    .map_err(mismatch)?,
            },
        )
    }
}

/// Per-segment features, one row per row of `info`: the mean and standard
/// deviation of every channel of `image`, then the area in pixels.
pub fn region_features(
    image: ArrayView3<f32>,
    segment_image: ArrayView2<u32>,
    info: &SegmentInfo,
) -> Result<Array2<f64>, InfoError> {
    let (height, width, channels) = image.dim();
    if segment_image.dim() != (height, width) {
        return Err(InfoError::MalformedTable(format!(
            "segment image {:?} does not match image {:?}",
            segment_image.dim(),
            (height, width)
        )));
    }

    let mut sums = Array2::<f64>::zeros((info.len(), channels));
    let mut squares = Array2::<f64>::zeros((info.len(), channels));
    let mut counts = vec![0u64; info.len()];
    for ((y, x), segment) in segment_image.indexed_iter() {
        let row = info
            .row_of(*segment)
            .ok_or(InfoError::UnknownSegment(*segment))?;
        counts[row] += 1;
        for c in 0..channels {
            let v = image[[y, x, c]] as f64;
            sums[[row, c]] += v;
            squares[[row, c]] += v * v;
        }
    }

    let mut features = Array2::<f64>::zeros((info.len(), 2 * channels + 1));
    for (row, count) in counts.iter().enumerate() {
        let n = (*count).max(1) as f64;
        for c in 0..channels {
            let mean = sums[[row, c]] / n;
            let variance = (squares[[row, c]] / n - mean * mean).max(0.0);
            features[[row, 2 * c]] = mean;
            features[[row, 2 * c + 1]] = variance.sqrt();
        }
        features[[row, 2 * channels]] = *count as f64;
    }
    Ok(features)
}

/// Write `record` to the training file at `path`.
///
/// With `overwrite` (or when no file exists yet) the file holds `record` only.
/// Otherwise rows of the segment images present in `record` are replaced and
/// every other row is kept.
pub fn write_training_file(
    path: &Path,
    record: &TrainingRecord,
    overwrite: bool,
) -> Result<(), RecordError> {
    check_path(path)?;
    let combined = if overwrite || !path.exists() {
        record.clone()
    } else {
        let existing = read_training_file(path, None)?;
        let replaced: BTreeSet<u32> = record.link.segment_image_ids().iter().copied().collect();
        let kept: Vec<usize> = existing
            .link
            .segment_image_ids()
            .iter()
            .enumerate()
            .filter(|(_, id)| !replaced.contains(id))
            .map(|(row, _)| row)
            .collect();
        if kept.len() < existing.len() {
            console_log!(
                "Segment image already in {}, replacing {} rows",
                path.display(),
                existing.len() - kept.len()
            );
        }
        existing.select(&kept).append(record)?
    };

    replace_atomically(path, |file| {
        let mut npz = NpzWriter::new_compressed(file);
        npz.add_array(entry_name(LABEL_VECTOR), &combined.labels)?;
        npz.add_array(entry_name(FEATURE_MATRIX), &combined.features)?;
        npz.add_array(entry_name(SEGMENT_ID_LINK), &combined.link.table)?;
        Ok(npz.finish()?)
    })?;
    console_log!("{} training rows written to {}", combined.len(), path.display());
    Ok(())
}

/// Read a training file, dropping rows labeled `exclude_label` if given.
pub fn read_training_file(
    path: &Path,
    exclude_label: Option<u32>,
) -> Result<TrainingRecord, RecordError> {
    check_path(path)?;
    let mut npz = NpzReader::new(File::open(path)?)?;
    require_entries(&npz.names()?, &[LABEL_VECTOR, FEATURE_MATRIX, SEGMENT_ID_LINK])?;
    let record = TrainingRecord::new(
        npz.by_name::<OwnedRepr<u32>, Ix1>(&entry_name(LABEL_VECTOR))?,
        npz.by_name::<OwnedRepr<f64>, Ix2>(&entry_name(FEATURE_MATRIX))?,
        SegmentIdLink::from_table(
            npz.by_name::<OwnedRepr<u32>, Ix2>(&entry_name(SEGMENT_ID_LINK))?,
        )?,
    )?;

    Ok(match exclude_label {
        Some(label) => {
            let kept: Vec<usize> = record
                .labels
                .iter()
                .enumerate()
                .filter(|(_, l)| **l != label)
                .map(|(row, _)| row)
                .collect();
            record.select(&kept)
        }
        None => record,
    })
}

#[cfg(test)]
mod tests {
    use ndarray::{array, Array3};

    use super::*;

    fn labeled(segment_image_id: u32) -> TrainingRecord {
        let segment_image = array![[1, 1, 2], [1, 1, 2]];
        let image = Array3::from_shape_fn((2, 3, 1), |(_, x, _)| x as f32);
        let mut info = SegmentInfo::create(segment_image.view());
        info.update_labels(&[(1, 4), (2, 9)]).unwrap();
        TrainingRecord::from_segments(image.view(), segment_image.view(), &info, segment_image_id, 20, 30)
            .unwrap()
    }

    #[test]
    fn test_region_features() {
        let record = labeled(1);
        assert_eq!(record.labels, array![4, 9]);
        // segment 1 covers x = 0, 1 twice: mean 0.5, std 0.5, area 4
        assert_eq!(record.features, array![[0.5, 0.5, 4.0], [2.0, 0.0, 2.0]]);
        assert_eq!(record.link.table(), array![[1, 1, 20, 30], [2, 1, 20, 30]]);
    }

    #[test]
    fn test_unknown_segment_in_image() {
        let info = SegmentInfo::create(array![[1, 1]].view());
        let image = Array3::<f32>::zeros((1, 2, 1));
        assert_eq!(
            region_features(image.view(), array![[1, 3]].view(), &info),
            Err(InfoError::UnknownSegment(3))
        );
    }

    #[test]
    fn test_append_then_replace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("training.npz");

        write_training_file(&path, &labeled(1), false).unwrap();
        write_training_file(&path, &labeled(2), false).unwrap();
        let read = read_training_file(&path, None).unwrap();
        assert_eq!(read.len(), 4);
        assert_eq!(unique_parent_ids(&read.link).segment_image_ids, vec![1, 2]);

        // same segment image again: its rows are replaced, not duplicated
        write_training_file(&path, &labeled(1), false).unwrap();
        let read = read_training_file(&path, None).unwrap();
        assert_eq!(read.len(), 4);
        assert_eq!(read.link.segment_image_ids(), array![2, 2, 1, 1]);

        write_training_file(&path, &labeled(3), true).unwrap();
        assert_eq!(read_training_file(&path, None).unwrap(), labeled(3));
    }

    #[test]
    fn test_datasets_use_npy_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("training.npz");
        write_training_file(&path, &labeled(1), true).unwrap();

        let mut npz = NpzReader::new(File::open(&path).unwrap()).unwrap();
        assert_eq!(
            npz.names().unwrap(),
            vec!["label_vector.npy", "feature_matrix.npy", "segment_id_link.npy"]
        );
    }

    #[test]
    fn test_exclude_label() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("training.npz");
        write_training_file(&path, &labeled(1), true).unwrap();

        let read = read_training_file(&path, Some(9)).unwrap();
        assert_eq!(read.labels, array![4]);
        assert_eq!(read.features.nrows(), 1);
        assert_eq!(read.link.segment_numbers(), array![1]);
    }

    #[test]
    fn test_feature_width_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("training.npz");
        write_training_file(&path, &labeled(1), true).unwrap();

        let segment_image = array![[1, 1]];
        let info = SegmentInfo::create(segment_image.view());
        let rgb = TrainingRecord::from_segments(
            Array3::<f32>::zeros((1, 2, 3)).view(),
            segment_image.view(),
            &info,
            5,
            20,
            30,
        )
        .unwrap();
        assert!(matches!(
            write_training_file(&path, &rgb, false),
            Err(RecordError::Inconsistent(_))
        ));
    }

    #[test]
    fn test_parent_ids() {
        let info = SegmentInfo::create(array![[1, 2, 3]].view());
        let link = SegmentIdLink::new(&info, 7, 3, 1);
        let ids = unique_parent_ids(&link);
        assert_eq!(
            ids,
            ParentIds {
                segment_image_ids: vec![7],
                crop_image_ids: vec![3],
                original_image_ids: vec![1],
            }
        );
    }
}
