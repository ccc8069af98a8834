use std::path::PathBuf;

use thiserror::Error;

/// Raised when UI parameters cannot be turned into a [`crate::ParameterSet`].
#[derive(Debug, Error, PartialEq)]
pub enum ParameterError {
    #[error("missing parameter `{0}`")]
    Missing(&'static str),
    #[error("parameter `{name}` is not a number: `{value}`")]
    NotANumber { name: &'static str, value: String },
    #[error("unknown {kind} id {id}")]
    UnknownId { kind: &'static str, id: i64 },
    #[error("parameter `{name}` out of range: {value}")]
    OutOfRange { name: &'static str, value: f64 },
}

/// Failure modes of a single segmentation call.
#[derive(Debug, Error)]
pub enum SegmentError {
    /// Wrong rank, empty image, mismatched shapes.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The algorithm ran but produced nothing usable.
    #[error("degenerate segmentation: {0}")]
    Degenerate(String),
    #[error("SLIC failed: {0}")]
    Slic(String),
    /// The learned-model call failed; callers may fall back to a local method.
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("tile worker panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("no model client configured")]
    NoClient,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("malformed payload: {0}")]
    Codec(String),
    #[error("response shape {found:?} does not match request shape {expected:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        found: Vec<usize>,
    },
}

/// Errors raised by the on-disk segment record and the training dataset.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("cannot read array: {0}")]
    ReadNpy(#[from] ndarray_npy::ReadNpyError),
    #[error("cannot write array: {0}")]
    WriteNpy(#[from] ndarray_npy::WriteNpyError),
    #[error("cannot read archive: {0}")]
    ReadNpz(#[from] ndarray_npy::ReadNpzError),
    #[error("cannot write archive: {0}")]
    WriteNpz(#[from] ndarray_npy::WriteNpzError),
    #[error(transparent)]
    Info(#[from] InfoError),
    #[error("invalid record path {0:?}")]
    InvalidPath(PathBuf),
    #[error("dataset `{0}` missing from record")]
    MissingDataset(&'static str),
    #[error("inconsistent record: {0}")]
    Inconsistent(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum InfoError {
    #[error("segment {0} does not exist")]
    UnknownSegment(u32),
    #[error("segment info has {rows} rows but the segment image has {ids} distinct ids")]
    CountMismatch { rows: usize, ids: usize },
    #[error("segment {0} is present in one of segment image / segment info only")]
    SetMismatch(u32),
    #[error("area fraction must be within [0, 1], got {0}")]
    InvalidFraction(f64),
    #[error("malformed segment info: {0}")]
    MalformedTable(String),
    #[error("opacity must be within [0, 1], got {0}")]
    InvalidOpacity(f32),
    #[error("invalid label colour `{0}`")]
    InvalidColor(String),
}

/// Errors that escape [`crate::run_segmentation`]. Everything else degrades.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}
