//! Windowed dataset builder
//!
//! Frame sequences of arbitrary length are split into fixed-size chunks, one
//! label per chunk, and accumulated into a single in-memory dataset that is
//! written out once at the end of a run.
//!
//! With a subsample factor `s > 1` every phase `x in 0..s` is windowed
//! separately over `frames[x], frames[x + s], ...`, so one trial yields up to
//! `s` times as many chunks as without subsampling.

use crate::error::DatasetError;
use crate::naming::DatasetStem;
use crate::types::{ChunkShape, Label};
use ndarray::{
    Array1, ArrayBase, ArrayD, ArrayView1, ArrayViewD, Axis, Data, Dimension, IxDyn, RemoveAxis,
};
use std::path::{Path, PathBuf};

/// Accumulates labeled chunks of `(window, H, W[, C])` frames
#[derive(Debug, Clone)]
pub struct DatasetBuilder {
    shape: ChunkShape,
    subsample: usize,
    /// Chunk elements, one chunk after the other in row-major order
    data: Vec<u8>,
    labels: Vec<Label>,
}

/// Paths written by [`DatasetBuilder::serialize`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetFiles {
    pub data: PathBuf,
    pub labels: PathBuf,
}

impl DatasetBuilder {
    /// Create an empty builder for chunks of `shape`, subsampling frames by `subsample`
    pub fn new(shape: ChunkShape, subsample: usize) -> Result<Self, DatasetError> {
        if subsample == 0 {
            return Err(DatasetError::InvalidConfig(
                "subsample factor must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            shape,
            subsample,
            data: Vec::new(),
            labels: Vec::new(),
        })
    }

    pub fn shape(&self) -> &ChunkShape {
        &self.shape
    }

    pub fn subsample(&self) -> usize {
        self.subsample
    }

    /// Number of chunks accumulated so far
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Number of chunks a sequence of `frame_count` frames yields with this
    /// builder's window and subsample factor.
    pub fn chunk_count(&self, frame_count: usize) -> usize {
        (0..self.subsample)
            .map(|phase| phase_length(frame_count, phase, self.subsample) / self.shape.window())
            .sum()
    }

    /// Split `frames` (`(L, H, W[, C])`) into chunks and append them with `label`.
    ///
    /// Returns the number of chunks appended. A sequence too short to fill a
    /// single window appends nothing and is not an error.
    pub fn accumulate<S, D>(
        &mut self,
        frames: &ArrayBase<S, D>,
        label: Label,
    ) -> Result<usize, DatasetError>
    where
        S: Data<Elem = u8>,
        D: Dimension + RemoveAxis,
    {
        if frames.ndim() == 0 {
            return Err(DatasetError::ShapeMismatch(
                "frame sequence must have a time axis".to_string(),
            ));
        }

        let frame_count = frames.len_of(Axis(0));
        if frame_count > 0 && !self.shape.accepts_frame(&frames.shape()[1..]) {
            return Err(DatasetError::ShapeMismatch(format!(
                "frames of shape {:?} do not fit chunks of frame shape {:?}",
                &frames.shape()[1..],
                self.shape.frame()
            )));
        }

        let window = self.shape.window();
        let step = self.subsample;
        let added = self.chunk_count(frame_count);

        self.data.reserve(added * self.shape.chunk_len());
        self.labels.reserve(added);

        for phase in 0..step {
            let chunks = phase_length(frame_count, phase, step) / window;

            // Trailing frames that do not fill a window are never read.
            for chunk in 0..chunks {
                for offset in 0..window {
                    let index = phase + (chunk * window + offset) * step;
                    self.data
                        .extend(frames.index_axis(Axis(0), index).iter().copied());
                }
                self.labels.push(label);
            }
        }

        self.check_alignment()?;
        Ok(added)
    }

    /// Borrow the accumulated chunks as a `(N, window, H, W[, C])` view
    pub fn chunks(&self) -> Result<ArrayViewD<'_, u8>, DatasetError> {
        let dims = self.shape.dataset_dims(self.len());
        Ok(ArrayViewD::from_shape(IxDyn(&dims), self.data.as_slice())?)
    }

    /// Borrow the accumulated labels
    pub fn labels(&self) -> ArrayView1<'_, Label> {
        ArrayView1::from(self.labels.as_slice())
    }

    /// Copy out the accumulated chunks and labels, in insertion order
    pub fn export(&self) -> Result<(ArrayD<u8>, Array1<Label>), DatasetError> {
        Ok((self.chunks()?.to_owned(), self.labels().to_owned()))
    }

    /// The file stem this dataset is written under
    pub fn stem(&self, identifier: &str, suffix: Option<&str>) -> DatasetStem {
        DatasetStem {
            identifier: identifier.to_string(),
            window: self.shape.window(),
            subsample: self.subsample,
            height: self.shape.height(),
            width: self.shape.width(),
            suffix: suffix.filter(|s| !s.is_empty()).map(str::to_string),
        }
    }

    /// Write `<stem>_data.npy` and `<stem>_labels.npy` into `dir`.
    pub fn serialize(
        &self,
        dir: &Path,
        identifier: &str,
        suffix: Option<&str>,
    ) -> Result<DatasetFiles, DatasetError> {
        self.check_alignment()?;

        let stem = self.stem(identifier, suffix);
        let files = DatasetFiles {
            data: stem.data_path(dir),
            labels: stem.labels_path(dir),
        };

        ndarray_npy::write_npy(&files.data, &self.chunks()?)?;
        ndarray_npy::write_npy(&files.labels, &self.labels())?;

        tracing::info!(
            chunks = self.len(),
            data = %files.data.display(),
            labels = %files.labels.display(),
            "Wrote dataset {}",
            stem
        );

        Ok(files)
    }

    fn check_alignment(&self) -> Result<(), DatasetError> {
        let chunk_len = self.shape.chunk_len();
        if self.data.len() != self.labels.len() * chunk_len {
            return Err(DatasetError::Misaligned {
                chunks: self.data.len() / chunk_len,
                labels: self.labels.len(),
            });
        }
        Ok(())
    }
}

/// Length of `frames[phase::step]` for a sequence of `frame_count` frames
fn phase_length(frame_count: usize, phase: usize, step: usize) -> usize {
    if frame_count > phase {
        (frame_count - phase).div_ceil(step)
    } else {
        0
    }
}
