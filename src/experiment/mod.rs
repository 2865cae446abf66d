//! Experiment session inputs
//!
//! A participant's session directory holds the experiment log written by the
//! N-back task and the recording captured while it ran. This module parses the
//! log into labeled trials and maps trial timestamps onto recording frames.

mod log;
mod timebase;

pub use log::*;
pub use timebase::*;

use crate::error::DatasetError;
use std::path::{Path, PathBuf};

/// Extension of the experiment log
pub const LOG_EXTENSION: &str = "json";

/// Extension of a decoded recording (`(L, H, W[, C])` frame stack)
pub const RECORDING_EXTENSION: &str = "npy";

/// Files of one participant's session directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFiles {
    /// Participant id, taken from the directory name
    pub participant: String,
    pub log: PathBuf,
    pub recording: PathBuf,
}

impl SessionFiles {
    /// Locate the single experiment log and the single recording in `dir`.
    pub fn discover(dir: &Path) -> Result<Self, DatasetError> {
        if !dir.is_dir() {
            return Err(DatasetError::MissingInput(format!(
                "{} is not a directory",
                dir.display()
            )));
        }

        let participant = dir
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| {
                DatasetError::MissingInput(format!(
                    "cannot derive participant id from {}",
                    dir.display()
                ))
            })?;

        Ok(Self {
            participant,
            log: single_file_with_extension(dir, LOG_EXTENSION)?,
            recording: single_file_with_extension(dir, RECORDING_EXTENSION)?,
        })
    }
}

/// Sorted files in `dir` with the given extension
pub fn files_with_extension(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, DatasetError> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some(extension) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn single_file_with_extension(dir: &Path, extension: &str) -> Result<PathBuf, DatasetError> {
    let mut files = files_with_extension(dir, extension)?;
    if files.len() != 1 {
        return Err(DatasetError::MissingInput(format!(
            "expected exactly one .{} file in {}, found {}",
            extension,
            dir.display(),
            files.len()
        )));
    }
    Ok(files.remove(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_discover_session() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("p03");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("experiment.json"), "[]").unwrap();
        fs::write(dir.join("recording.npy"), b"").unwrap();
        fs::write(dir.join("notes.txt"), "").unwrap();

        let session = SessionFiles::discover(&dir).unwrap();
        assert_eq!(session.participant, "p03");
        assert_eq!(session.log, dir.join("experiment.json"));
        assert_eq!(session.recording, dir.join("recording.npy"));
    }

    #[test]
    fn test_discover_requires_single_log() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("p04");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("a.json"), "[]").unwrap();
        fs::write(dir.join("b.json"), "[]").unwrap();
        fs::write(dir.join("recording.npy"), b"").unwrap();

        assert!(matches!(
            SessionFiles::discover(&dir),
            Err(DatasetError::MissingInput(_))
        ));
    }

    #[test]
    fn test_discover_missing_directory() {
        let root = tempfile::tempdir().unwrap();
        assert!(SessionFiles::discover(&root.path().join("nope")).is_err());
    }
}
