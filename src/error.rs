//! Error types for cogload

use thiserror::Error;

/// Errors that can occur while building, writing or merging datasets
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Dataset misaligned: {chunks} chunks but {labels} labels")]
    Misaligned { chunks: usize, labels: usize },

    #[error("File pair mismatch: {0}")]
    PairMismatch(String),

    #[error("Invalid dataset name: {0}")]
    InvalidName(String),

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    #[error("Experiment log error: {0}")]
    ExperimentLog(String),

    #[error("Missing input: {0}")]
    MissingInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Array shape error: {0}")]
    ArrayShape(#[from] ndarray::ShapeError),

    #[error("Failed to read .npy file: {0}")]
    ReadNpy(#[from] ndarray_npy::ReadNpyError),

    #[error("Failed to write .npy file: {0}")]
    WriteNpy(#[from] ndarray_npy::WriteNpyError),

    #[error("Failed to map .npy file: {0}")]
    ViewNpy(#[from] ndarray_npy::ViewNpyError),
}
