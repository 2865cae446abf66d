//! Run configuration
//!
//! Settings shared by every processing run. They can be loaded from a JSON
//! file, are overridden by command-line flags, and are validated before any
//! frame is read.

use crate::error::DatasetError;
use crate::experiment::DEFAULT_FPS;
use crate::types::{ChunkShape, GroundTruth, ProcessingMethod};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default number of frames per chunk
pub const DEFAULT_WINDOW: usize = 60;

/// Default edge length of the square crops
pub const DEFAULT_CROP: usize = 64;

/// Configuration of one processing run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// How frames are transformed before windowing
    pub method: ProcessingMethod,
    /// Which ground truth labels the chunks
    pub ground_truth: GroundTruth,
    /// Frames per chunk
    pub window: usize,
    /// Edge length of the square crops
    pub crop: usize,
    /// Stride at which frames are taken before windowing
    pub subsample: usize,
    /// Capture rate of the recording
    pub fps: f64,
    /// Directory the datasets are written to
    pub output: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            method: ProcessingMethod::Face,
            ground_truth: GroundTruth::N,
            window: DEFAULT_WINDOW,
            crop: DEFAULT_CROP,
            subsample: 1,
            fps: DEFAULT_FPS,
            output: PathBuf::from("."),
        }
    }
}

impl RunConfig {
    /// Load a configuration file. Missing keys take their default values.
    pub fn load(path: &Path) -> Result<Self, DatasetError> {
        let content = std::fs::read_to_string(path)?;
        let config: RunConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Write the configuration as pretty-printed JSON
    pub fn save(&self, path: &Path) -> Result<(), DatasetError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject configurations that cannot produce a dataset
    pub fn validate(&self) -> Result<(), DatasetError> {
        if self.window == 0 {
            return Err(DatasetError::InvalidConfig(
                "window size must be greater than 0".to_string(),
            ));
        }
        if self.crop == 0 {
            return Err(DatasetError::InvalidConfig(
                "crop size must be greater than 0".to_string(),
            ));
        }
        if self.subsample == 0 {
            return Err(DatasetError::InvalidConfig(
                "subsample factor must be greater than 0".to_string(),
            ));
        }
        if !(self.fps.is_finite() && self.fps > 0.0) {
            return Err(DatasetError::InvalidConfig(format!(
                "frame rate must be positive, got {}",
                self.fps
            )));
        }
        Ok(())
    }

    /// Ensure the output directory exists
    pub fn ensure_output_dir(&self) -> Result<(), DatasetError> {
        std::fs::create_dir_all(&self.output)?;
        Ok(())
    }

    /// Chunk shape produced by the configured method and crop size
    pub fn chunk_shape(&self) -> Result<ChunkShape, DatasetError> {
        ChunkShape::new(self.window, &self.method.frame_dims(self.crop))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RunConfig::default();
        assert_eq!(config.window, 60);
        assert_eq!(config.crop, 64);
        assert_eq!(config.subsample, 1);
        assert_eq!(config.ground_truth, GroundTruth::N);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        for config in [
            RunConfig {
                window: 0,
                ..Default::default()
            },
            RunConfig {
                crop: 0,
                ..Default::default()
            },
            RunConfig {
                subsample: 0,
                ..Default::default()
            },
            RunConfig {
                fps: 0.0,
                ..Default::default()
            },
        ] {
            assert!(matches!(
                config.validate(),
                Err(DatasetError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_partial_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(
            &path,
            r#"{"method": "opticalflow", "window": 30, "ground_truth": "score"}"#,
        )
        .unwrap();

        let config = RunConfig::load(&path).unwrap();
        assert_eq!(config.method, ProcessingMethod::OpticalFlow);
        assert_eq!(config.window, 30);
        assert_eq!(config.ground_truth, GroundTruth::Score);
        assert_eq!(config.crop, DEFAULT_CROP);
        assert_eq!(config.chunk_shape().unwrap().frame(), &[64, 64, 3]);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        let config = RunConfig {
            subsample: 3,
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(RunConfig::load(&path).unwrap(), config);
    }
}
