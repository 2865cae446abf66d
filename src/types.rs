//! Core data types
//!
//! This module defines the shapes, labels and trial descriptions that flow
//! from the experiment log through the frame source into the dataset builder.

use crate::error::DatasetError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Ground-truth value attached to every chunk
pub type Label = u8;

/// Number of N-back difficulty levels in the experiment
pub const DIFFICULTY_LEVELS: u8 = 5;

/// Highest score a subject can reach on a single trial
pub const MAX_SCORE: u8 = 10;

/// Shape of a single chunk: `(window, H, W[, C])`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawChunkShape")]
pub struct ChunkShape {
    /// Number of frames per chunk
    window: usize,
    /// Shape of one frame: `[H, W]` or `[H, W, C]`
    frame: Vec<usize>,
}

#[derive(Deserialize)]
struct RawChunkShape {
    window: usize,
    frame: Vec<usize>,
}

impl TryFrom<RawChunkShape> for ChunkShape {
    type Error = DatasetError;

    fn try_from(raw: RawChunkShape) -> Result<Self, Self::Error> {
        ChunkShape::new(raw.window, &raw.frame)
    }
}

impl ChunkShape {
    /// Create a chunk shape, rejecting zero-sized or malformed dimensions
    pub fn new(window: usize, frame: &[usize]) -> Result<Self, DatasetError> {
        if window == 0 {
            return Err(DatasetError::InvalidConfig(
                "window size must be greater than 0".to_string(),
            ));
        }
        if frame.len() < 2 || frame.len() > 3 {
            return Err(DatasetError::InvalidConfig(format!(
                "frame shape must be [H, W] or [H, W, C], got {:?}",
                frame
            )));
        }
        if frame.iter().any(|&d| d == 0) {
            return Err(DatasetError::InvalidConfig(format!(
                "frame dimensions must be non-zero, got {:?}",
                frame
            )));
        }

        Ok(Self {
            window,
            frame: frame.to_vec(),
        })
    }

    /// Number of frames per chunk
    pub fn window(&self) -> usize {
        self.window
    }

    /// Shape of one frame
    pub fn frame(&self) -> &[usize] {
        &self.frame
    }

    pub fn height(&self) -> usize {
        self.frame[0]
    }

    pub fn width(&self) -> usize {
        self.frame[1]
    }

    /// Number of elements in one frame
    pub fn frame_len(&self) -> usize {
        self.frame.iter().product()
    }

    /// Number of elements in one chunk
    pub fn chunk_len(&self) -> usize {
        self.window * self.frame_len()
    }

    /// Full array shape for `count` chunks: `[count, window, H, W[, C]]`
    pub fn dataset_dims(&self, count: usize) -> Vec<usize> {
        let mut dims = Vec::with_capacity(self.frame.len() + 2);
        dims.push(count);
        dims.push(self.window);
        dims.extend_from_slice(&self.frame);
        dims
    }

    /// Check whether a frame of `actual` shape can be stored in this chunk shape.
    ///
    /// Trailing singleton axes are ignored on both sides, so `[64, 64]` frames fit
    /// a `[64, 64, 1]` chunk.
    pub fn accepts_frame(&self, actual: &[usize]) -> bool {
        trim_trailing_ones(&self.frame) == trim_trailing_ones(actual)
    }
}

fn trim_trailing_ones(dims: &[usize]) -> &[usize] {
    let mut end = dims.len();
    while end > 0 && dims[end - 1] == 1 {
        end -= 1;
    }
    &dims[..end]
}

/// Which ground truth is used as the chunk label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroundTruth {
    /// N-back difficulty level (1-5)
    N,
    /// Score achieved on the trial (0-10)
    Score,
}

impl GroundTruth {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroundTruth::N => "n",
            GroundTruth::Score => "score",
        }
    }

    /// Select the label of a trial
    pub fn label_for(&self, level: u8, score: u8) -> Label {
        match self {
            GroundTruth::N => level,
            GroundTruth::Score => score,
        }
    }
}

impl fmt::Display for GroundTruth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroundTruth {
    type Err = DatasetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "n" => Ok(GroundTruth::N),
            "score" => Ok(GroundTruth::Score),
            other => Err(DatasetError::InvalidConfig(format!(
                "unknown ground truth '{}', expected 'n' or 'score'",
                other
            ))),
        }
    }
}

/// How the frames of a recording were produced.
///
/// Detection and flow estimation happen upstream: a session recording already
/// holds the method's frames, and processing only center-crops them. The method
/// fixes the expected frame shape, so a face recording and an eye recording are
/// handled the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMethod {
    /// Grayscale face crops
    Face,
    /// Grayscale eye crops
    Eye,
    /// Three-channel optical flow images
    #[serde(rename = "opticalflow")]
    OpticalFlow,
}

impl ProcessingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingMethod::Face => "face",
            ProcessingMethod::Eye => "eye",
            ProcessingMethod::OpticalFlow => "opticalflow",
        }
    }

    /// Per-frame shape produced by this method for a square crop
    pub fn frame_dims(&self, crop_size: usize) -> Vec<usize> {
        match self {
            ProcessingMethod::Face | ProcessingMethod::Eye => vec![crop_size, crop_size],
            ProcessingMethod::OpticalFlow => vec![crop_size, crop_size, 3],
        }
    }
}

impl fmt::Display for ProcessingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingMethod {
    type Err = DatasetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "face" => Ok(ProcessingMethod::Face),
            "eye" => Ok(ProcessingMethod::Eye),
            "opticalflow" | "optical_flow" => Ok(ProcessingMethod::OpticalFlow),
            other => Err(DatasetError::InvalidConfig(format!(
                "unknown processing method '{}'",
                other
            ))),
        }
    }
}

/// One timed N-back trial with its ground truth
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    /// First stimulus the subject is able to answer
    pub start: DateTime<Utc>,
    /// End of the last stimulus
    pub end: DateTime<Utc>,
    /// Difficulty level (1-5)
    pub level: u8,
    /// Number of correctly answered stimuli
    pub score: u8,
}

impl Trial {
    pub fn label(&self, ground_truth: GroundTruth) -> Label {
        ground_truth.label_for(self.level, self.score)
    }
}

/// Ground truth stored next to each raw per-trial frame stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialGroundTruth {
    pub n: u8,
    pub score: u8,
}

impl TrialGroundTruth {
    pub fn label(&self, ground_truth: GroundTruth) -> Label {
        ground_truth.label_for(self.n, self.score)
    }
}
