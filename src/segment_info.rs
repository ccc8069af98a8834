//! The per-region label table stored next to every segment image.

use std::{cmp::Ordering, collections::BTreeMap};

use ndarray::{Array2, ArrayView1, ArrayView2};

use crate::{error::InfoError, utils::id_counts};

/// Label id of a segment nobody has labeled yet.
pub const UNLABELED: u32 = 0;

const SEGMENT: usize = 0;
const LABEL: usize = 1;
const AREA: usize = 2;

/// `(total, labeled, unlabeled)` segment counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LabelCounts {
    pub total: usize,
    pub labeled: usize,
    pub unlabeled: usize,
}

/// N×3 table of `(segment_number, label_id, area_px)`, one row per distinct
/// segment id, sorted by segment number.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentInfo {
    table: Array2<u32>,
}

/// Number of distinct ids in a segment image.
pub fn image_segment_count(segment_image: ArrayView2<u32>) -> usize {
    id_counts(segment_image).len()
}

impl SegmentInfo {
    /// One unlabeled row per distinct id, with its pixel count as area.
    pub fn create(segment_image: ArrayView2<u32>) -> Self {
        let counts = id_counts(segment_image);
        let mut table = Array2::<u32>::zeros((counts.len(), 3));
        for (mut row, (id, count)) in table.rows_mut().into_iter().zip(counts) {
            row[SEGMENT] = id;
            row[LABEL] = UNLABELED;
            row[AREA] = count;
        }
        Self { table }
    }

    /// Wrap a table read back from storage. Rows must have three columns and
    /// strictly increasing segment numbers.
    pub fn from_table(table: Array2<u32>) -> Result<Self, InfoError> {
        if table.ncols() != 3 {
            return Err(InfoError::MalformedTable(format!(
                "expected 3 columns, found {}",
                table.ncols()
            )));
        }
        let segments = table.column(SEGMENT);
        if let Some(i) = (1..segments.len()).find(|i| segments[*i] <= segments[*i - 1]) {
            return Err(InfoError::MalformedTable(format!(
                "segment {} follows segment {}",
                segments[i],
                segments[i - 1]
            )));
        }
        Ok(Self { table })
    }

    pub fn table(&self) -> ArrayView2<u32> {
        self.table.view()
    }

    pub fn into_table(self) -> Array2<u32> {
        self.table
    }

    pub fn len(&self) -> usize {
        self.table.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.table.nrows() == 0
    }

    pub fn segment_numbers(&self) -> ArrayView1<u32> {
        self.table.column(SEGMENT)
    }

    pub fn labels(&self) -> ArrayView1<u32> {
        self.table.column(LABEL)
    }

    pub fn areas(&self) -> ArrayView1<u32> {
        self.table.column(AREA)
    }

    /// Row holding `segment`. Segment numbers are dense `1..=N` in the common
    /// case, so row `segment - 1` is tried before searching.
    pub(crate) fn row_of(&self, segment: u32) -> Option<usize> {
        let segments = self.table.column(SEGMENT);
        if let Some(guess) = (segment as usize).checked_sub(1) {
            if segments.get(guess) == Some(&segment) {
                return Some(guess);
            }
        }
        let (mut lo, mut hi) = (0, segments.len());
        while lo < hi {
            let mid = (lo + hi) / 2;
            match segments[mid].cmp(&segment) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Some(mid),
            }
        }
        None
    }

    pub fn label_of(&self, segment: u32) -> Option<u32> {
        self.row_of(segment).map(|row| self.table[[row, LABEL]])
    }

    pub fn area_of(&self, segment: u32) -> Option<u32> {
        self.row_of(segment).map(|row| self.table[[row, AREA]])
    }

    pub fn label_segment(&mut self, segment: u32, label: u32) -> Result<(), InfoError> {
        let row = self.row_of(segment).ok_or(InfoError::UnknownSegment(segment))?;
        self.table[[row, LABEL]] = label;
        Ok(())
    }

    /// Apply `(segment, label)` edits in order. Every segment is checked first;
    /// if one is unknown nothing is changed.
    pub fn update_labels(&mut self, edits: &[(u32, u32)]) -> Result<(), InfoError> {
        let rows = edits
            .iter()
            .map(|(segment, label)| {
                self.row_of(*segment)
                    .map(|row| (row, *label))
                    .ok_or(InfoError::UnknownSegment(*segment))
            })
            .collect::<Result<Vec<_>, _>>()?;
        for (row, label) in rows {
            self.table[[row, LABEL]] = label;
        }
        Ok(())
    }

    /// Give `label` to the unlabeled segment with the lowest number and return
    /// that number.
    pub fn label_first_unlabeled(&mut self, label: u32) -> Option<u32> {
        let row = self
            .table
            .column(LABEL)
            .iter()
            .position(|l| *l == UNLABELED)?;
        self.table[[row, LABEL]] = label;
        Some(self.table[[row, SEGMENT]])
    }

    /// Label every still-unlabeled segment with `label`. Returns how many
    /// segments changed.
    pub fn set_unlabeled_to(&mut self, label: u32) -> usize {
        let mut changed = 0;
        for l in self.table.column_mut(LABEL) {
            if *l == UNLABELED && label != UNLABELED {
                *l = label;
                changed += 1;
            }
        }
        changed
    }

    pub fn counts(&self) -> LabelCounts {
        let unlabeled = self.labels().iter().filter(|l| **l == UNLABELED).count();
        LabelCounts {
            total: self.len(),
            labeled: self.len() - unlabeled,
            unlabeled,
        }
    }

    /// Number of segments per label id, unlabeled included.
    pub fn label_histogram(&self) -> BTreeMap<u32, usize> {
        let mut histogram = BTreeMap::new();
        for label in self.labels() {
            *histogram.entry(*label).or_insert(0) += 1;
        }
        histogram
    }

    /// Total stored area per label id, unlabeled included.
    pub fn label_areas(&self) -> BTreeMap<u32, u64> {
        let mut areas = BTreeMap::new();
        for row in self.table.rows() {
            *areas.entry(row[LABEL]).or_insert(0) += u64::from(row[AREA]);
        }
        areas
    }

    /// Check that the table and `segment_image` describe the same segments.
    pub fn verify(&self, segment_image: ArrayView2<u32>) -> Result<(), InfoError> {
        let counts = id_counts(segment_image);
        if counts.len() != self.len() {
            return Err(InfoError::CountMismatch {
                rows: self.len(),
                ids: counts.len(),
            });
        }
        for (id, segment) in counts.keys().zip(self.segment_numbers()) {
            if id != segment {
                return Err(InfoError::SetMismatch(*id.min(segment)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    fn info() -> SegmentInfo {
        SegmentInfo::create(array![[1, 1, 2], [3, 3, 3]].view())
    }

    #[test]
    fn test_create() {
        let info = info();
        assert_eq!(info.table(), array![[1, 0, 2], [2, 0, 1], [3, 0, 3]]);
        assert_eq!(info.counts(), LabelCounts { total: 3, labeled: 0, unlabeled: 3 });
    }

    #[test]
    fn test_single_region() {
        let segment_image = Array2::<u32>::ones((512, 512));
        let mut info = SegmentInfo::create(segment_image.view());
        assert_eq!(info.table(), array![[1, 0, 262144]]);
        info.update_labels(&[(1, 5)]).unwrap();
        assert_eq!(info.table(), array![[1, 5, 262144]]);
    }

    #[test]
    fn test_update_labels_is_all_or_nothing() {
        let mut info = info();
        assert_eq!(
            info.update_labels(&[(1, 4), (9, 4)]),
            Err(InfoError::UnknownSegment(9))
        );
        assert_eq!(info.label_of(1), Some(0));

        info.update_labels(&[(1, 4), (3, 2), (1, 6)]).unwrap();
        assert_eq!(info.labels(), array![6, 0, 2]);
    }

    #[test]
    fn test_sparse_segment_numbers() {
        let mut info = SegmentInfo::create(array![[4, 4, 10], [17, 17, 17]].view());
        info.label_segment(10, 3).unwrap();
        assert_eq!(info.label_of(10), Some(3));
        assert_eq!(info.area_of(17), Some(3));
        assert_eq!(info.label_segment(0, 1), Err(InfoError::UnknownSegment(0)));
    }

    #[test]
    fn test_label_first_unlabeled_and_fill() {
        let mut info = info();
        info.label_segment(1, 2).unwrap();
        assert_eq!(info.label_first_unlabeled(7), Some(2));
        assert_eq!(info.set_unlabeled_to(9), 1);
        assert_eq!(info.label_first_unlabeled(7), None);
        assert_eq!(info.counts().unlabeled, 0);
    }

    #[test]
    fn test_histogram_and_areas() {
        let mut info = info();
        info.update_labels(&[(1, 4), (3, 4)]).unwrap();
        assert_eq!(info.label_histogram(), BTreeMap::from([(0, 1), (4, 2)]));
        assert_eq!(info.label_areas(), BTreeMap::from([(0, 1), (4, 5)]));
    }

    #[test]
    fn test_verify() {
        let segment_image = array![[1, 1, 2], [3, 3, 3]];
        let info = SegmentInfo::create(segment_image.view());
        assert_eq!(info.verify(segment_image.view()), Ok(()));
        assert_eq!(
            info.verify(array![[1, 1, 2], [2, 2, 2]].view()),
            Err(InfoError::CountMismatch { rows: 3, ids: 2 })
        );
        assert_eq!(
            info.verify(array![[1, 1, 2], [4, 4, 4]].view()),
            Err(InfoError::SetMismatch(3))
        );
        assert_eq!(image_segment_count(segment_image.view()), 3);
    }

    #[test]
    fn test_from_table_validates() {
        assert!(SegmentInfo::from_table(array![[1, 0, 1], [2, 0, 1]]).is_ok());
        assert!(matches!(
            SegmentInfo::from_table(array![[2, 0, 1], [1, 0, 1]]),
            Err(InfoError::MalformedTable(_))
        ));
        assert!(matches!(
            SegmentInfo::from_table(array![[1, 0]]),
            Err(InfoError::MalformedTable(_))
        ));
    }
}
