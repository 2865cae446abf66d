//! cogload - Windowed video dataset builder for cognitive load research
//!
//! cogload turns N-back experiment sessions into training data for
//! spatio-temporal networks: experiment log → trial intervals → frame
//! sequences → fixed-size labeled chunks → `.npy` datasets → merged dataset.
//!
//! ## Modules
//!
//! - **Experiment**: Parse experiment logs and map trial timestamps onto frames
//! - **Windowing**: Split frame sequences into labeled chunks and serialize them
//! - **Merge**: Concatenate per-participant datasets through a memory-mapped file
//! - **Statistics**: Score statistics and confusion matrices

pub mod config;
pub mod error;
pub mod experiment;
pub mod merge;
pub mod naming;
pub mod pipeline;
pub mod source;
pub mod statistics;
pub mod types;
pub mod windowing;

pub use config::RunConfig;
pub use error::DatasetError;
pub use experiment::{ExperimentLog, SessionFiles, VideoTimebase};
pub use merge::{merge_datasets, merge_directory};
pub use naming::DatasetStem;
pub use pipeline::{build_from_raw, extract_raw_trials, process_participant, RawBuildOptions};
pub use source::{FrameSequence, FrameSource, FrameStackSource};
pub use statistics::{ConfusionMatrix, ScoreStatistics};
pub use types::{ChunkShape, GroundTruth, Label, ProcessingMethod, Trial};
pub use windowing::{DatasetBuilder, DatasetFiles};

/// cogload version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
