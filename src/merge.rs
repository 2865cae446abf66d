//! Dataset merger
//!
//! Concatenates the per-participant datasets of a directory into one
//! `all_<descriptor>_data.npy` / `all_<descriptor>_labels.npy` pair. Chunks are
//! copied participant by participant into a memory-mapped output file, so only
//! the pages being copied need to be resident, however many participants
//! there are.

use crate::error::DatasetError;
use crate::experiment::files_with_extension;
use crate::naming::{
    DatasetStem, ARRAY_EXTENSION, DATA_SUFFIX, LABELS_SUFFIX, MERGED_IDENTIFIER,
};
use crate::types::Label;
use crate::windowing::DatasetFiles;
use memmap2::{Mmap, MmapMut};
use ndarray::{Array1, ArrayViewD, ArrayViewMutD, Axis, IxDyn, Slice};
use ndarray_npy::{ViewMutNpyExt, ViewNpyExt};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Chunk and label files of one participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantDataset {
    pub stem: DatasetStem,
    pub data: PathBuf,
    pub labels: PathBuf,
}

/// Find and pair the `<stem>_data.npy` / `<stem>_labels.npy` files in `dir`.
///
/// Previously merged `all_*` files are skipped. Files are paired by their
/// parsed stem; a data file without labels (or the reverse) is an error.
/// Datasets are returned in stem order.
pub fn discover_datasets(dir: &Path) -> Result<Vec<ParticipantDataset>, DatasetError> {
    let data_marker = format!("{}.{}", DATA_SUFFIX, ARRAY_EXTENSION);
    let labels_marker = format!("{}.{}", LABELS_SUFFIX, ARRAY_EXTENSION);
    let merged_prefix = format!("{}_", MERGED_IDENTIFIER);

    // Keyed on the rendered stem so datasets come out in name order.
    let mut pairs: BTreeMap<String, (DatasetStem, Option<PathBuf>, Option<PathBuf>)> =
        BTreeMap::new();
    for path in files_with_extension(dir, ARRAY_EXTENSION)? {
        let name = file_name(&path);
        if name.starts_with(&merged_prefix) {
            continue;
        }
        if name.ends_with(&data_marker) {
            let stem = DatasetStem::from_data_file(&name)?;
            let entry = pairs.entry(stem.to_string()).or_insert((stem, None, None));
            entry.1 = Some(path);
        } else if name.ends_with(&labels_marker) {
            let stem = DatasetStem::from_labels_file(&name)?;
            let entry = pairs.entry(stem.to_string()).or_insert((stem, None, None));
            entry.2 = Some(path);
        }
    }

    let mut datasets = Vec::with_capacity(pairs.len());
    let mut unmatched = Vec::new();
    for (stem, data, labels) in pairs.into_values() {
        match (data, labels) {
            (Some(data), Some(labels)) => datasets.push(ParticipantDataset { stem, data, labels }),
            (Some(path), None) | (None, Some(path)) => unmatched.push(file_name(&path)),
            (None, None) => {}
        }
    }

    if !unmatched.is_empty() {
        return Err(DatasetError::PairMismatch(format!(
            "no matching data or label file for {} in {}",
            unmatched.join(", "),
            dir.display()
        )));
    }
    Ok(datasets)
}

/// Merge the participant datasets in `dir` into `output`.
///
/// With `descriptor` set (e.g. `60@1_64x64_n_train`), only datasets with that
/// descriptor are merged. Otherwise every dataset in `dir` must share one
/// descriptor.
pub fn merge_directory(
    dir: &Path,
    output: &Path,
    descriptor: Option<&str>,
) -> Result<DatasetFiles, DatasetError> {
    let mut datasets = discover_datasets(dir)?;
    if let Some(descriptor) = descriptor {
        datasets.retain(|d| d.stem.descriptor() == descriptor);
    }

    tracing::info!(
        dir = %dir.display(),
        participants = datasets.len(),
        descriptor,
        "Found participant datasets"
    );
    merge_datasets(&datasets, output)
}

/// Concatenate `datasets` in order into one dataset written to `output`.
///
/// All datasets must share the same per-chunk shape and each must have as many
/// labels as chunks. The output is named after the first dataset's stem with
/// the identifier replaced by `all`.
pub fn merge_datasets(
    datasets: &[ParticipantDataset],
    output: &Path,
) -> Result<DatasetFiles, DatasetError> {
    let first = datasets
        .first()
        .ok_or_else(|| DatasetError::MissingInput("no datasets to merge".to_string()))?;

    let mut counts = Vec::with_capacity(datasets.len());
    let mut labels: Vec<Label> = Vec::new();
    let mut chunk_dims: Option<Vec<usize>> = None;

    check_descriptors(datasets)?;

    for dataset in datasets {
        let shape = npy_shape(&dataset.data)?;
        let (count, dims) = shape.split_first().ok_or_else(|| {
            DatasetError::ShapeMismatch(format!("{} holds a scalar", dataset.data.display()))
        })?;

        match &chunk_dims {
            None => chunk_dims = Some(dims.to_vec()),
            Some(expected) if expected.as_slice() != dims => {
                return Err(DatasetError::ShapeMismatch(format!(
                    "chunks of {} have shape {:?}, expected {:?}",
                    dataset.stem.identifier, dims, expected
                )));
            }
            Some(_) => {}
        }

        let participant_labels: Array1<Label> = ndarray_npy::read_npy(&dataset.labels)?;
        if participant_labels.len() != *count {
            return Err(DatasetError::Misaligned {
                chunks: *count,
                labels: participant_labels.len(),
            });
        }

        labels.extend(participant_labels.iter().copied());
        counts.push(*count);
    }

    let chunk_dims = chunk_dims.unwrap_or_default();
    let total: usize = counts.iter().sum();
    let mut dims = vec![total];
    dims.extend_from_slice(&chunk_dims);

    std::fs::create_dir_all(output)?;
    let stem = first.stem.merged();
    let files = DatasetFiles {
        data: stem.data_path(output),
        labels: stem.labels_path(output),
    };

    let partial = files.data.with_extension(format!("{}.partial", ARRAY_EXTENSION));
    if let Err(e) = copy_chunks(datasets, &counts, &dims, &partial) {
        let _ = std::fs::remove_file(&partial);
        return Err(e);
    }
    std::fs::rename(&partial, &files.data)?;
    ndarray_npy::write_npy(&files.labels, &Array1::from(labels))?;

    tracing::info!(
        chunks = total,
        participants = datasets.len(),
        data = %files.data.display(),
        labels = %files.labels.display(),
        "Merged datasets into {}",
        stem
    );

    Ok(files)
}

/// Reject datasets that were built with different settings or labels
fn check_descriptors(datasets: &[ParticipantDataset]) -> Result<(), DatasetError> {
    let Some(first) = datasets.first() else {
        return Ok(());
    };
    let expected = &first.stem;

    for dataset in &datasets[1..] {
        let found = &dataset.stem;
        let same_dims = (found.window, found.subsample, found.height, found.width)
            == (expected.window, expected.subsample, expected.height, expected.width);

        if !same_dims {
            return Err(DatasetError::ShapeMismatch(format!(
                "{} was built as {}, expected {}",
                found.identifier,
                found.descriptor(),
                expected.descriptor()
            )));
        }
        if found.suffix != expected.suffix {
            return Err(DatasetError::PairMismatch(format!(
                "{} has descriptor {} but {} has {}; select one descriptor to merge",
                found.identifier,
                found.descriptor(),
                expected.identifier,
                expected.descriptor()
            )));
        }
    }
    Ok(())
}

/// Copy every dataset into its slice of a zero-initialized `.npy` file at `path`
fn copy_chunks(
    datasets: &[ParticipantDataset],
    counts: &[usize],
    dims: &[usize],
    path: &Path,
) -> Result<(), DatasetError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    ndarray_npy::write_zeroed_npy::<u8, _>(&file, IxDyn(dims))?;

    // SAFETY: the file was just created by us and is not shared.
    let mut mmap = unsafe { MmapMut::map_mut(&file)? };
    {
        let mut merged = ArrayViewMutD::<u8>::view_mut_npy(&mut mmap[..])?;
        let mut offset = 0;

        for (dataset, &count) in datasets.iter().zip(counts) {
            let source = File::open(&dataset.data)?;
            // SAFETY: read-only mapping of an input file.
            let source = unsafe { Mmap::map(&source)? };
            let chunks = ArrayViewD::<u8>::view_npy(&source[..])?;

            merged
                .slice_axis_mut(Axis(0), Slice::from(offset..offset + count))
                .assign(&chunks);
            offset += count;

            tracing::debug!(
                participant = %dataset.stem.identifier,
                chunks = count,
                offset,
                "Copied participant chunks"
            );
        }
    }
    mmap.flush()?;
    Ok(())
}

/// Shape of the array stored in a `.npy` file, read through a memory map
fn npy_shape(path: &Path) -> Result<Vec<usize>, DatasetError> {
    let file = File::open(path)?;
    // SAFETY: read-only mapping of an input file.
    let mmap = unsafe { Mmap::map(&file)? };
    let view = ArrayViewD::<u8>::view_npy(&mmap[..])?;
    Ok(view.shape().to_vec())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChunkShape;
    use crate::windowing::DatasetBuilder;
    use ndarray::{concatenate, Array3, ArrayD};
    use pretty_assertions::assert_eq;

    fn write_participant(
        dir: &Path,
        identifier: &str,
        frames: usize,
        frame_dims: (usize, usize),
        label: Label,
    ) -> (ArrayD<u8>, Array1<Label>) {
        write_dataset(dir, identifier, "n", frames, frame_dims, label)
    }

    fn write_dataset(
        dir: &Path,
        identifier: &str,
        suffix: &str,
        frames: usize,
        frame_dims: (usize, usize),
        label: Label,
    ) -> (ArrayD<u8>, Array1<Label>) {
        let shape = ChunkShape::new(2, &[frame_dims.0, frame_dims.1]).unwrap();
        let mut builder = DatasetBuilder::new(shape, 1).unwrap();
        let seed = identifier.len() as u8;
        let sequence = Array3::from_shape_fn((frames, frame_dims.0, frame_dims.1), |(i, y, x)| {
            (i as u8).wrapping_mul(7).wrapping_add(y as u8 + x as u8 + seed)
        });
        builder.accumulate(&sequence, label).unwrap();
        builder.serialize(dir, identifier, Some(suffix)).unwrap();
        builder.export().unwrap()
    }

    #[test]
    fn test_merge_five_and_three() {
        let dir = tempfile::tempdir().unwrap();
        let (a_chunks, a_labels) = write_participant(dir.path(), "p01", 10, (4, 3), 1);
        let (b_chunks, b_labels) = write_participant(dir.path(), "p02", 6, (4, 3), 4);
        assert_eq!(a_labels.len(), 5);
        assert_eq!(b_labels.len(), 3);

        let out = tempfile::tempdir().unwrap();
        let files = merge_directory(dir.path(), out.path(), None).unwrap();
        assert!(files.data.ends_with("all_2@1_4x3_n_data.npy"));
        assert!(files.labels.ends_with("all_2@1_4x3_n_labels.npy"));

        let chunks: ArrayD<u8> = ndarray_npy::read_npy(&files.data).unwrap();
        let labels: Array1<u8> = ndarray_npy::read_npy(&files.labels).unwrap();
        assert_eq!(chunks.shape(), &[8, 2, 4, 3]);
        assert_eq!(
            chunks,
            concatenate(Axis(0), &[a_chunks.view(), b_chunks.view()]).unwrap()
        );
        assert_eq!(labels.to_vec(), vec![1, 1, 1, 1, 1, 4, 4, 4]);

        let leftovers: Vec<_> = std::fs::read_dir(out.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_merge_into_same_directory_skips_previous_output() {
        let dir = tempfile::tempdir().unwrap();
        write_participant(dir.path(), "p01", 4, (2, 2), 2);
        write_participant(dir.path(), "p02", 4, (2, 2), 3);

        merge_directory(dir.path(), dir.path(), None).unwrap();
        // A second run must not pick up the merged files as a participant.
        let files = merge_directory(dir.path(), dir.path(), None).unwrap();
        let labels: Array1<u8> = ndarray_npy::read_npy(&files.labels).unwrap();
        assert_eq!(labels.to_vec(), vec![2, 2, 3, 3]);
    }

    #[test]
    fn test_merge_fails_on_shape_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        write_participant(dir.path(), "p01", 10, (4, 3), 1);
        write_participant(dir.path(), "p02", 6, (4, 4), 2);

        let out = tempfile::tempdir().unwrap();
        let err = merge_directory(dir.path(), out.path(), None).unwrap_err();
        assert!(matches!(err, DatasetError::ShapeMismatch(_)));
        assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_merge_fails_on_channel_mismatch_with_same_name() {
        let dir = tempfile::tempdir().unwrap();
        write_participant(dir.path(), "p01", 4, (4, 3), 1);
        let color = ndarray::Array5::<u8>::zeros((2, 2, 4, 3, 3));
        ndarray_npy::write_npy(dir.path().join("p02_2@1_4x3_n_data.npy"), &color).unwrap();
        let labels = Array1::<u8>::ones(2);
        ndarray_npy::write_npy(dir.path().join("p02_2@1_4x3_n_labels.npy"), &labels).unwrap();

        let out = tempfile::tempdir().unwrap();
        assert!(matches!(
            merge_directory(dir.path(), out.path(), None),
            Err(DatasetError::ShapeMismatch(_))
        ));
        assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_mixed_suffixes_are_not_merged_together() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path(), "p01", "n_train", 8, (2, 2), 1);
        write_dataset(dir.path(), "p01", "n_validation", 2, (2, 2), 9);

        let out = tempfile::tempdir().unwrap();
        assert!(matches!(
            merge_directory(dir.path(), out.path(), None),
            Err(DatasetError::PairMismatch(_))
        ));
        assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);

        let files = merge_directory(dir.path(), out.path(), Some("2@1_2x2_n_train")).unwrap();
        assert!(files.data.ends_with("all_2@1_2x2_n_train_data.npy"));
        let labels: Array1<u8> = ndarray_npy::read_npy(&files.labels).unwrap();
        assert_eq!(labels.to_vec(), vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_stems_sharing_a_prefix_pair_correctly() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path(), "p01", "score", 4, (2, 2), 3);
        write_dataset(dir.path(), "p01", "score_fold", 4, (2, 2), 5);

        let datasets = discover_datasets(dir.path()).unwrap();
        assert_eq!(datasets.len(), 2);
        for dataset in &datasets {
            assert_eq!(file_name(&dataset.data), dataset.stem.data_file_name());
            assert_eq!(file_name(&dataset.labels), dataset.stem.labels_file_name());
        }
        let suffixes: Vec<_> = datasets.iter().map(|d| d.stem.suffix.clone()).collect();
        assert_eq!(
            suffixes,
            vec![Some("score".to_string()), Some("score_fold".to_string())]
        );
    }

    #[test]
    fn test_merge_fails_on_label_count_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        write_participant(dir.path(), "p01", 10, (4, 3), 1);
        let (_, labels) = write_participant(dir.path(), "p02", 6, (4, 3), 2);
        let short = labels.slice(ndarray::s![..2]).to_owned();
        ndarray_npy::write_npy(dir.path().join("p02_2@1_4x3_n_labels.npy"), &short).unwrap();

        let out = tempfile::tempdir().unwrap();
        assert!(matches!(
            merge_directory(dir.path(), out.path(), None),
            Err(DatasetError::Misaligned {
                chunks: 3,
                labels: 2
            })
        ));
    }

    #[test]
    fn test_mismatched_pair_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_participant(dir.path(), "p01", 4, (2, 2), 1);
        write_participant(dir.path(), "p02", 4, (2, 2), 1);
        std::fs::remove_file(dir.path().join("p01_2@1_2x2_n_labels.npy")).unwrap();
        std::fs::remove_file(dir.path().join("p02_2@1_2x2_n_data.npy")).unwrap();

        assert!(matches!(
            discover_datasets(dir.path()),
            Err(DatasetError::PairMismatch(_))
        ));
    }

    #[test]
    fn test_unpaired_file_count_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_participant(dir.path(), "p01", 4, (2, 2), 1);
        std::fs::remove_file(dir.path().join("p01_2@1_2x2_n_labels.npy")).unwrap();

        assert!(matches!(
            discover_datasets(dir.path()),
            Err(DatasetError::PairMismatch(_))
        ));
    }

    #[test]
    fn test_empty_merge_is_error() {
        let out = tempfile::tempdir().unwrap();
        assert!(matches!(
            merge_datasets(&[], out.path()),
            Err(DatasetError::MissingInput(_))
        ));
    }
}
