//! Frame sources
//!
//! A frame source turns a trial's time interval into the sequence of
//! transformed frames (face crops, eye crops, optical flow images) that the
//! dataset builder windows. Detection itself is a black box behind
//! [`FrameTransform`]: a frame for which the transform finds nothing is dropped,
//! so a sequence may be shorter than the interval's nominal frame count.

use crate::error::DatasetError;
use crate::experiment::VideoTimebase;
use chrono::{DateTime, Utc};
use ndarray::{stack, ArrayD, ArrayViewD, Axis, IxDyn, Slice};
use std::path::Path;

/// Temporally ordered stack of same-shaped `u8` frames, `(L, H, W[, C])`
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSequence {
    frames: ArrayD<u8>,
}

impl FrameSequence {
    /// Wrap an existing `(L, ...)` array
    pub fn new(frames: ArrayD<u8>) -> Result<Self, DatasetError> {
        if frames.ndim() < 3 {
            return Err(DatasetError::ShapeMismatch(format!(
                "frame sequence needs shape (L, H, W[, C]), got {:?}",
                frames.shape()
            )));
        }
        Ok(Self { frames })
    }

    /// An empty sequence of frames shaped `frame_dims`
    pub fn empty(frame_dims: &[usize]) -> Self {
        let mut dims = vec![0];
        dims.extend_from_slice(frame_dims);
        Self {
            frames: ArrayD::zeros(IxDyn(&dims)),
        }
    }

    /// Stack individual frames, which must all be shaped `frame_dims`
    pub fn from_frames(frames: &[ArrayD<u8>], frame_dims: &[usize]) -> Result<Self, DatasetError> {
        if frames.is_empty() {
            return Ok(Self::empty(frame_dims));
        }
        if let Some(bad) = frames.iter().find(|f| f.shape() != frame_dims) {
            return Err(DatasetError::ShapeMismatch(format!(
                "frame of shape {:?} in a sequence of {:?} frames",
                bad.shape(),
                frame_dims
            )));
        }

        let views: Vec<ArrayViewD<'_, u8>> = frames.iter().map(|f| f.view()).collect();
        Ok(Self {
            frames: stack(Axis(0), &views)?,
        })
    }

    /// Number of frames
    pub fn len(&self) -> usize {
        self.frames.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shape of a single frame
    pub fn frame_dims(&self) -> &[usize] {
        &self.frames.shape()[1..]
    }

    pub fn view(&self) -> ArrayViewD<'_, u8> {
        self.frames.view()
    }

    pub fn into_array(self) -> ArrayD<u8> {
        self.frames
    }
}

/// Per-frame transform. Returns `None` when nothing was found in the frame.
pub trait FrameTransform {
    /// Shape of the frames this transform produces
    fn output_dims(&self, input_dims: &[usize], crop_size: usize) -> Vec<usize>;

    fn apply(&mut self, frame: ArrayViewD<'_, u8>, crop_size: usize) -> Option<ArrayD<u8>>;
}

/// Keeps every frame unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl FrameTransform for Passthrough {
    fn output_dims(&self, input_dims: &[usize], _crop_size: usize) -> Vec<usize> {
        input_dims.to_vec()
    }

    fn apply(&mut self, frame: ArrayViewD<'_, u8>, _crop_size: usize) -> Option<ArrayD<u8>> {
        Some(frame.to_owned())
    }
}

/// Cuts a `crop_size x crop_size` square out of the frame center.
///
/// Frames smaller than the crop yield nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct CenterCrop;

impl FrameTransform for CenterCrop {
    fn output_dims(&self, input_dims: &[usize], crop_size: usize) -> Vec<usize> {
        let mut dims = vec![crop_size, crop_size];
        dims.extend_from_slice(input_dims.get(2..).unwrap_or(&[]));
        dims
    }

    fn apply(&mut self, frame: ArrayViewD<'_, u8>, crop_size: usize) -> Option<ArrayD<u8>> {
        let (h, w) = (*frame.shape().first()?, *frame.shape().get(1)?);
        if crop_size == 0 || h < crop_size || w < crop_size {
            return None;
        }

        let top = (h - crop_size) / 2;
        let left = (w - crop_size) / 2;
        let crop = frame
            .slice_axis(Axis(0), Slice::from(top..top + crop_size))
            .slice_axis(Axis(1), Slice::from(left..left + crop_size))
            .to_owned();
        Some(crop)
    }
}

/// Produces the transformed frames captured between two timestamps
pub trait FrameSource {
    fn get_frames(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        crop_size: usize,
    ) -> Result<FrameSequence, DatasetError>;

    /// Dimensions of every frame returned by `get_frames`, when known up front
    fn output_dims(&self, _crop_size: usize) -> Option<Vec<usize>> {
        None
    }
}

/// A decoded recording held as one `(L, H, W[, C])` array
pub struct FrameStackSource<T> {
    frames: ArrayD<u8>,
    timebase: VideoTimebase,
    transform: T,
}

impl<T: FrameTransform> FrameStackSource<T> {
    pub fn new(
        frames: ArrayD<u8>,
        timebase: VideoTimebase,
        transform: T,
    ) -> Result<Self, DatasetError> {
        if frames.ndim() < 3 {
            return Err(DatasetError::ShapeMismatch(format!(
                "recording needs shape (L, H, W[, C]), got {:?}",
                frames.shape()
            )));
        }
        Ok(Self {
            frames,
            timebase,
            transform,
        })
    }

    /// Load a recording written as a `.npy` frame stack
    pub fn load(path: &Path, timebase: VideoTimebase, transform: T) -> Result<Self, DatasetError> {
        let frames: ArrayD<u8> = ndarray_npy::read_npy(path)?;
        tracing::info!(
            path = %path.display(),
            frames = frames.len_of(Axis(0)),
            "Loaded recording"
        );
        Self::new(frames, timebase, transform)
    }

    /// Number of frames in the recording
    pub fn len(&self) -> usize {
        self.frames.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn timebase(&self) -> &VideoTimebase {
        &self.timebase
    }
}

impl<T: FrameTransform> FrameSource for FrameStackSource<T> {
    fn output_dims(&self, crop_size: usize) -> Option<Vec<usize>> {
        Some(self.transform.output_dims(&self.frames.shape()[1..], crop_size))
    }

    fn get_frames(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        crop_size: usize,
    ) -> Result<FrameSequence, DatasetError> {
        let range = self.timebase.frame_range(start, end)?;
        let out_dims = self
            .transform
            .output_dims(&self.frames.shape()[1..], crop_size);

        let first = *range.start();
        let last = (*range.end()).min(self.len().saturating_sub(1));
        if self.is_empty() || first > last {
            tracing::warn!(
                first,
                last = *range.end(),
                recorded = self.len(),
                "Interval lies outside the recording"
            );
            return Ok(FrameSequence::empty(&out_dims));
        }

        let mut kept = Vec::with_capacity(last - first + 1);
        for index in first..=last {
            let frame = self.frames.index_axis(Axis(0), index);
            if let Some(transformed) = self.transform.apply(frame, crop_size) {
                kept.push(transformed);
            }
        }

        tracing::debug!(
            first,
            last,
            kept = kept.len(),
            dropped = last - first + 1 - kept.len(),
            "Extracted frames"
        );

        FrameSequence::from_frames(&kept, &out_dims)
    }
}
