//! On-disk segment record: a `.npz` archive holding the segment image
//! (`segment_data`) and its label table (`segment_info`).
//!
//! Label edits only touch `segment_info`; [`update_info_only`] copies the
//! compressed `segment_data` entry byte for byte.

use std::{
    fs::{self, File},
    io::{BufWriter, Seek, Write},
    path::{Path, PathBuf},
};

use ndarray::{ArrayView2, Ix2, OwnedRepr};
use ndarray_npy::{NpzReader, ReadNpyExt, WriteNpyExt};
use zip::{result::ZipError, write::FileOptions, CompressionMethod, ZipArchive, ZipWriter};

use crate::{console_log, error::RecordError, segment_info::SegmentInfo, SegmentImage};

pub const SEGMENT_DATA: &str = "segment_data";
pub const SEGMENT_INFO: &str = "segment_info";

/// Archive entry holding `dataset`, following the numpy `.npz` layout.
pub(crate) fn entry_name(dataset: &str) -> String {
    format!("{dataset}.npy")
}

/// Every dataset must be stored under its exact [`entry_name`].
pub(crate) fn require_entries(
    names: &[String],
    datasets: &[&'static str],
) -> Result<(), RecordError> {
    match datasets
        .iter()
        .find(|dataset| !names.contains(&entry_name(dataset)))
    {
        Some(dataset) => Err(RecordError::MissingDataset(*dataset)),
        None => Ok(()),
    }
}

fn entry_options() -> FileOptions {
    FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default())
}

pub(crate) fn check_path(path: &Path) -> Result<(), RecordError> {
    match path.extension() {
        Some(ext) if ext == "npz" && path.file_name().is_some() => Ok(()),
        _ => Err(RecordError::InvalidPath(path.to_path_buf())),
    }
}

/// Sibling of `path` the record is written to before it replaces `path`.
pub(crate) fn temp_path(path: &Path) -> Result<PathBuf, RecordError> {
    let name = path
        .file_name()
        .ok_or_else(|| RecordError::InvalidPath(path.to_path_buf()))?;
    let mut temp = std::ffi::OsString::from(".");
    temp.push(name);
    temp.push(".tmp");
    Ok(path.with_file_name(temp))
}

/// Write through `write` into a temporary sibling, then rename over `path`.
/// The temporary file is removed if anything fails.
pub(crate) fn replace_atomically<F>(path: &Path, write: F) -> Result<(), RecordError>
where
    F: FnOnce(BufWriter<File>) -> Result<BufWriter<File>, RecordError>,
{
    let temp = temp_path(path)?;
    let result = File::create(&temp)
        .map_err(RecordError::from)
        .and_then(|file| write(BufWriter::new(file)))
        .and_then(|mut file| {
            file.flush()?;
            file.get_ref().sync_all()?;
            Ok(())
        });
    match result {
        Ok(()) => Ok(fs::rename(&temp, path)?),
        Err(err) => {
            let _ = fs::remove_file(&temp);
            Err(err)
        }
    }
}

fn write_entry<W: Write + Seek>(
    zip: &mut ZipWriter<W>,
    dataset: &str,
    array: ArrayView2<u32>,
) -> Result<(), RecordError> {
    zip.start_file(entry_name(dataset), entry_options())?;
    array.write_npy(zip)?;
    Ok(())
}

fn missing(dataset: &'static str) -> impl FnOnce(ZipError) -> RecordError {
    move |err| match err {
        ZipError::FileNotFound => RecordError::MissingDataset(dataset),
        other => RecordError::Zip(other),
    }
}

/// Create or replace the record at `path`.
pub fn persist(
    segment_image: ArrayView2<u32>,
    info: &SegmentInfo,
    path: &Path,
) -> Result<(), RecordError> {
    check_path(path)?;
    info.verify(segment_image)?;
    replace_atomically(path, |file| {
        let mut zip = ZipWriter::new(file);
        write_entry(&mut zip, SEGMENT_DATA, segment_image)?;
        write_entry(&mut zip, SEGMENT_INFO, info.table())?;
        Ok(zip.finish()?)
    })?;
    console_log!("Segment record written to {}", path.display());
    Ok(())
}

/// Load both datasets. Either one missing is an error.
pub fn read(path: &Path) -> Result<(SegmentImage, SegmentInfo), RecordError> {
    check_path(path)?;
    let mut npz = NpzReader::new(File::open(path)?)?;
    require_entries(&npz.names()?, &[SEGMENT_DATA, SEGMENT_INFO])?;
    let segment_image = npz.by_name::<OwnedRepr<u32>, Ix2>(&entry_name(SEGMENT_DATA))?;
    let info = npz.by_name::<OwnedRepr<u32>, Ix2>(&entry_name(SEGMENT_INFO))?;
    let info = SegmentInfo::from_table(info)?;
    Ok((segment_image, info))
}

/// Replace `segment_info` in the record at `path`, keeping `segment_data`
/// untouched. The segment numbers of `info` must match the stored ones.
///
/// Concurrent updates of the same path must be serialized by the caller.
pub fn update_info_only(info: &SegmentInfo, path: &Path) -> Result<(), RecordError> {
    check_path(path)?;
    let mut source = ZipArchive::new(File::open(path)?)?;

    let stored = {
        let entry = source
            .by_name(&entry_name(SEGMENT_INFO))
            .map_err(missing(SEGMENT_INFO))?;
        ndarray::Array2::<u32>::read_npy(entry)?
    };
    let stored = SegmentInfo::from_table(stored)?;
    if stored.segment_numbers() != info.segment_numbers() {
        return Err(RecordError::Inconsistent(format!(
            "stored table has {} segments, new table has {}; segment numbers differ",
            stored.len(),
            info.len()
        )));
    }

    replace_atomically(path, |file| {
        let mut zip = ZipWriter::new(file);
        let data = source
            .by_name(&entry_name(SEGMENT_DATA))
            .map_err(missing(SEGMENT_DATA))?;
        zip.raw_copy_file(data)?;
        write_entry(&mut zip, SEGMENT_INFO, info.table())?;
        Ok(zip.finish()?)
    })
}
