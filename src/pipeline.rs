//! Pipeline orchestration
//!
//! Datasets are produced along one of two paths:
//!
//! 1. Direct: experiment log + frame source → windowed dataset
//!    ([`process_participant`]).
//! 2. Two-stage: experiment log + frame source → one raw frame stack and
//!    ground-truth file per trial ([`extract_raw_trials`]), then raw trials →
//!    windowed dataset ([`build_from_raw`]). The second stage can be re-run
//!    with different window and subsample settings without touching the
//!    recording again.

use crate::config::RunConfig;
use crate::error::DatasetError;
use crate::experiment::{files_with_extension, ExperimentLog};
use crate::source::FrameSource;
use crate::types::{
    ChunkShape, GroundTruth, Label, ProcessingMethod, TrialGroundTruth, DIFFICULTY_LEVELS,
};
use crate::windowing::{DatasetBuilder, DatasetFiles};
use ndarray::ArrayD;
use std::path::{Path, PathBuf};

/// Every `BALANCED_FOLD`-th raw trial goes to the validation set
pub const BALANCED_FOLD: usize = 5;

/// Difficulty level left out of two-class datasets
pub const TWO_CLASS_EXCLUDED_LEVEL: u8 = 3;

/// File stem suffix of the extracted lecture video, `{method}_lecture_video`
pub const LECTURE_VIDEO_SUFFIX: &str = "_lecture_video";

/// Build the windowed dataset of one participant directly from the recording.
///
/// Every trial of every difficulty level is fetched from `source` and
/// accumulated with its level or score as label.
pub fn process_participant<F: FrameSource>(
    log: &ExperimentLog,
    source: &mut F,
    config: &RunConfig,
) -> Result<DatasetBuilder, DatasetError> {
    config.validate()?;
    let shape = config.chunk_shape()?;
    if let Some(dims) = source.output_dims(config.crop) {
        if !shape.accepts_frame(&dims) {
            return Err(DatasetError::ShapeMismatch(format!(
                "method {} expects frames {:?} but the source yields {:?}",
                config.method,
                shape.frame(),
                dims
            )));
        }
    }
    let mut builder = DatasetBuilder::new(shape, config.subsample)?;

    for level in 1..=DIFFICULTY_LEVELS {
        let trials = log.trials(level)?;
        tracing::info!(level, trials = trials.len(), "Processing difficulty level");

        for (index, trial) in trials.iter().enumerate() {
            let frames = source.get_frames(trial.start, trial.end, config.crop)?;
            let added = builder.accumulate(&frames.view(), trial.label(config.ground_truth))?;

            if added == 0 {
                tracing::warn!(
                    level,
                    trial = index + 1,
                    frames = frames.len(),
                    "Trial too short for a single window"
                );
            } else {
                tracing::debug!(level, trial = index + 1, frames = frames.len(), chunks = added);
            }
        }
    }

    Ok(builder)
}

/// Run [`process_participant`] and write the dataset, suffixed with the
/// ground-truth name.
pub fn process_and_write<F: FrameSource>(
    log: &ExperimentLog,
    source: &mut F,
    participant: &str,
    config: &RunConfig,
) -> Result<DatasetFiles, DatasetError> {
    let builder = process_participant(log, source, config)?;
    config.ensure_output_dir()?;
    builder.serialize(&config.output, participant, Some(config.ground_truth.as_str()))
}

/// File stem of a raw trial: `{level}-{index}-{method}`
pub fn raw_trial_stem(level: u8, index: usize, method: ProcessingMethod) -> String {
    format!("{}-{}-{}", level, index, method)
}

/// Write one frame stack and one ground-truth file per trial into
/// `<output>/<participant>/`. Returns the participant directory.
pub fn extract_raw_trials<F: FrameSource>(
    log: &ExperimentLog,
    source: &mut F,
    participant: &str,
    method: ProcessingMethod,
    crop: usize,
    output: &Path,
) -> Result<PathBuf, DatasetError> {
    if crop == 0 {
        return Err(DatasetError::InvalidConfig(
            "crop size must be greater than 0".to_string(),
        ));
    }

    let dir = output.join(participant);
    std::fs::create_dir_all(&dir)?;

    for level in 1..=DIFFICULTY_LEVELS {
        for (index, trial) in log.trials(level)?.iter().enumerate() {
            let frames = source.get_frames(trial.start, trial.end, crop)?;
            let stem = raw_trial_stem(level, index, method);

            ndarray_npy::write_npy(dir.join(format!("{}.npy", stem)), &frames.view())?;
            let ground_truth = TrialGroundTruth {
                n: trial.level,
                score: trial.score,
            };
            std::fs::write(
                dir.join(format!("{}.json", stem)),
                serde_json::to_string(&ground_truth)?,
            )?;

            tracing::debug!(
                level,
                trial = index + 1,
                frames = frames.len(),
                "Wrote raw trial {}",
                stem
            );
        }
    }

    tracing::info!(dir = %dir.display(), "Raw trials written");
    Ok(dir)
}

/// Write the frames of the lecture video segment as `{method}_lecture_video.npy`
pub fn extract_lecture_video<F: FrameSource>(
    log: &ExperimentLog,
    source: &mut F,
    participant: &str,
    method: ProcessingMethod,
    crop: usize,
    output: &Path,
) -> Result<PathBuf, DatasetError> {
    let (start, end) = log.lecture_interval()?;
    let frames = source.get_frames(start, end, crop)?;

    let dir = output.join(participant);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{}{}.npy", method, LECTURE_VIDEO_SUFFIX));
    ndarray_npy::write_npy(&path, &frames.view())?;

    tracing::info!(path = %path.display(), frames = frames.len(), "Lecture video written");
    Ok(path)
}

/// A raw trial frame stack and its ground-truth file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTrialFiles {
    pub frames: PathBuf,
    pub ground_truth: PathBuf,
}

impl RawTrialFiles {
    /// Difficulty level encoded as the leading character of the file name
    pub fn level_prefix(&self) -> Option<char> {
        self.frames.file_name()?.to_str()?.chars().next()
    }

    pub fn load(&self) -> Result<(ArrayD<u8>, TrialGroundTruth), DatasetError> {
        let frames: ArrayD<u8> = ndarray_npy::read_npy(&self.frames)?;
        let ground_truth: TrialGroundTruth =
            serde_json::from_str(&std::fs::read_to_string(&self.ground_truth)?)?;
        Ok((frames, ground_truth))
    }
}

/// Pair the `.npy` and `.json` files of a raw trial directory by file stem.
///
/// The lecture video stored next to the trials is not a trial and is skipped.
pub fn discover_raw_trials(dir: &Path) -> Result<Vec<RawTrialFiles>, DatasetError> {
    let mut frames = files_with_extension(dir, "npy")?;
    frames.retain(|path| {
        !path
            .file_stem()
            .and_then(|s| s.to_str())
            .is_some_and(|s| s.ends_with(LECTURE_VIDEO_SUFFIX))
    });
    let ground_truths = files_with_extension(dir, "json")?;

    if frames.len() != ground_truths.len() {
        return Err(DatasetError::PairMismatch(format!(
            "{} frame files but {} ground-truth files in {}",
            frames.len(),
            ground_truths.len(),
            dir.display()
        )));
    }

    frames
        .into_iter()
        .zip(ground_truths)
        .map(|(frames, ground_truth)| {
            if frames.file_stem() != ground_truth.file_stem() {
                return Err(DatasetError::PairMismatch(format!(
                    "{} does not belong to {}",
                    ground_truth.display(),
                    frames.display()
                )));
            }
            Ok(RawTrialFiles {
                frames,
                ground_truth,
            })
        })
        .collect()
}

/// Options of the raw-trial dataset build
#[derive(Debug, Clone, PartialEq)]
pub struct RawBuildOptions {
    pub ground_truth: GroundTruth,
    pub window: usize,
    pub subsample: usize,
    /// Drop level 3 and merge levels 1-2 and 4-5 into two classes
    pub two_class: bool,
    /// Split one participant's trials into training and validation sets
    pub single_person_balanced: bool,
}

impl Default for RawBuildOptions {
    fn default() -> Self {
        Self {
            ground_truth: GroundTruth::N,
            window: crate::config::DEFAULT_WINDOW,
            subsample: 1,
            two_class: false,
            single_person_balanced: false,
        }
    }
}

impl RawBuildOptions {
    /// Suffix shared by every dataset the build writes
    pub fn suffix(&self) -> String {
        if self.two_class {
            format!("{}_twoclass", self.ground_truth)
        } else {
            self.ground_truth.to_string()
        }
    }

    /// Label of a trial under these options
    pub fn label(&self, ground_truth: &TrialGroundTruth) -> Label {
        if self.two_class && self.ground_truth == GroundTruth::N {
            if ground_truth.n <= 2 {
                1
            } else {
                2
            }
        } else {
            ground_truth.label(self.ground_truth)
        }
    }
}

/// Build the windowed dataset(s) of one participant from a raw trial directory.
///
/// The participant id is the directory name. Returns the written files: one
/// dataset, or a training and a validation dataset when
/// `single_person_balanced` is set.
pub fn build_from_raw(
    dir: &Path,
    options: &RawBuildOptions,
    output: &Path,
) -> Result<Vec<DatasetFiles>, DatasetError> {
    let participant = dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            DatasetError::MissingInput(format!(
                "cannot derive participant id from {}",
                dir.display()
            ))
        })?
        .to_string();

    let mut trials = discover_raw_trials(dir)?;
    if trials.is_empty() {
        return Err(DatasetError::MissingInput(format!(
            "no raw trials found in {}",
            dir.display()
        )));
    }

    // Frame shape comes from the first stack, before any filtering.
    let first: ArrayD<u8> = ndarray_npy::read_npy(&trials[0].frames)?;
    let mut frame_dims = first.shape()[1..].to_vec();
    if frame_dims.len() == 2 {
        frame_dims.push(1);
    }
    let shape = ChunkShape::new(options.window, &frame_dims)?;

    if options.two_class {
        let excluded = char::from(b'0' + TWO_CLASS_EXCLUDED_LEVEL);
        trials.retain(|t| t.level_prefix() != Some(excluded));
    }

    tracing::info!(
        participant = %participant,
        trials = trials.len(),
        window = options.window,
        subsample = options.subsample,
        two_class = options.two_class,
        balanced = options.single_person_balanced,
        "Building dataset from raw trials"
    );

    let suffix = options.suffix();
    std::fs::create_dir_all(output)?;

    if !options.single_person_balanced {
        let mut builder = DatasetBuilder::new(shape, options.subsample)?;
        for trial in &trials {
            let (frames, ground_truth) = trial.load()?;
            builder.accumulate(&frames, options.label(&ground_truth))?;
        }
        return Ok(vec![builder.serialize(output, &participant, Some(suffix.as_str()))?]);
    }

    let mut training = DatasetBuilder::new(shape.clone(), options.subsample)?;
    let mut validation = DatasetBuilder::new(shape, options.subsample)?;
    for (index, trial) in trials.iter().enumerate() {
        let (frames, ground_truth) = trial.load()?;
        let label = options.label(&ground_truth);
        if (index + 1) % BALANCED_FOLD == 0 {
            validation.accumulate(&frames, label)?;
        } else {
            training.accumulate(&frames, label)?;
        }
    }

    let train_suffix = format!("{}_train", suffix);
    let validation_suffix = format!("{}_validation", suffix);
    Ok(vec![
        training.serialize(output, &participant, Some(train_suffix.as_str()))?,
        validation.serialize(output, &participant, Some(validation_suffix.as_str()))?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{sample_log_json, VideoTimebase};
    use crate::source::{FrameStackSource, Passthrough};
    use chrono::{TimeZone, Utc};
    use ndarray::{Array1, Array3};

    const T0_MS: i64 = 1_600_000_000_000;

    /// 10 fps recording of 8x8 frames covering the whole sample log
    fn source(frame_count: usize) -> FrameStackSource<Passthrough> {
        let start = Utc.timestamp_millis_opt(T0_MS).unwrap();
        let timebase = VideoTimebase::new(start, 10.0).unwrap();
        let frames = Array3::from_shape_fn((frame_count, 8, 8), |(i, _, _)| (i % 251) as u8);
        FrameStackSource::new(frames.into_dyn(), timebase, Passthrough).unwrap()
    }

    fn config(output: &Path) -> RunConfig {
        RunConfig {
            method: ProcessingMethod::Face,
            ground_truth: GroundTruth::N,
            window: 20,
            crop: 8,
            subsample: 1,
            fps: 10.0,
            output: output.to_path_buf(),
        }
    }

    #[test]
    fn test_process_participant_labels_by_level() {
        // One trial per level, 4 answerable stimuli of 1s each: the trial spans
        // 4s -> 41 frames at 10 fps -> 2 chunks of 20.
        let log = ExperimentLog::parse(&sample_log_json(T0_MS, 1, 4)).unwrap();
        let mut source = source(1000);
        let dir = tempfile::tempdir().unwrap();

        let builder = process_participant(&log, &mut source, &config(dir.path())).unwrap();
        let (chunks, labels) = builder.export().unwrap();
        assert_eq!(labels.to_vec(), vec![1, 1, 2, 2, 3, 3, 4, 4, 5, 5]);
        assert_eq!(chunks.shape(), &[10, 20, 8, 8]);
    }

    #[test]
    fn test_process_participant_rejects_incompatible_source() {
        let log = ExperimentLog::parse(&sample_log_json(T0_MS, 1, 4)).unwrap();
        let mut source = source(1000);
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            method: ProcessingMethod::OpticalFlow,
            ..config(dir.path())
        };

        assert!(matches!(
            process_participant(&log, &mut source, &config),
            Err(DatasetError::ShapeMismatch(msg)) if msg.contains("opticalflow")
        ));
    }

    #[test]
    fn test_process_participant_score_labels() {
        let log = ExperimentLog::parse(&sample_log_json(T0_MS, 1, 4)).unwrap();
        let mut source = source(1000);
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            ground_truth: GroundTruth::Score,
            ..config(dir.path())
        };

        let builder = process_participant(&log, &mut source, &config).unwrap();
        let expected: Vec<u8> = log
            .all_trials()
            .unwrap()
            .iter()
            .flat_map(|t| [t.score, t.score])
            .collect();
        assert_eq!(builder.labels().to_vec(), expected);
    }

    #[test]
    fn test_process_and_write_names_files() {
        let log = ExperimentLog::parse(&sample_log_json(T0_MS, 1, 4)).unwrap();
        let mut source = source(1000);
        let dir = tempfile::tempdir().unwrap();

        let files = process_and_write(&log, &mut source, "p05", &config(dir.path())).unwrap();
        assert!(files.data.ends_with("p05_20@1_8x8_n_data.npy"));
        let labels: Array1<u8> = ndarray_npy::read_npy(&files.labels).unwrap();
        assert_eq!(labels.len(), 10);
    }

    #[test]
    fn test_invalid_config_rejected_before_processing() {
        let log = ExperimentLog::parse(&sample_log_json(T0_MS, 1, 4)).unwrap();
        let mut source = source(10);
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            subsample: 0,
            ..config(dir.path())
        };
        assert!(matches!(
            process_participant(&log, &mut source, &config),
            Err(DatasetError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_extract_then_build_matches_direct_path() {
        let log = ExperimentLog::parse(&sample_log_json(T0_MS, 1, 4)).unwrap();
        let raw_root = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();

        let dir = extract_raw_trials(
            &log,
            &mut source(1000),
            "p06",
            ProcessingMethod::Face,
            8,
            raw_root.path(),
        )
        .unwrap();
        assert!(dir.join("1-0-face.npy").exists());
        assert!(dir.join("5-0-face.json").exists());

        let options = RawBuildOptions {
            window: 20,
            ..Default::default()
        };
        let files = build_from_raw(&dir, &options, out.path()).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].data.ends_with("p06_20@1_8x8_n_data.npy"));

        let raw_chunks: ArrayD<u8> = ndarray_npy::read_npy(&files[0].data).unwrap();
        assert_eq!(raw_chunks.shape(), &[10, 20, 8, 8, 1]);

        let direct = process_participant(&log, &mut source(1000), &config(out.path())).unwrap();
        let (direct_chunks, direct_labels) = direct.export().unwrap();
        let raw_labels: Array1<u8> = ndarray_npy::read_npy(&files[0].labels).unwrap();
        assert_eq!(raw_labels, direct_labels);
        assert_eq!(
            raw_chunks.into_shape_with_order(direct_chunks.shape()).unwrap(),
            direct_chunks
        );
    }

    fn write_raw_trial(dir: &Path, level: u8, index: usize, frames: usize, score: u8) {
        let stem = raw_trial_stem(level, index, ProcessingMethod::Eye);
        let stack = Array3::<u8>::from_elem((frames, 4, 4), level);
        ndarray_npy::write_npy(dir.join(format!("{}.npy", stem)), &stack).unwrap();
        std::fs::write(
            dir.join(format!("{}.json", stem)),
            serde_json::to_string(&TrialGroundTruth { n: level, score }).unwrap(),
        )
        .unwrap();
    }

    fn raw_participant(root: &Path) -> PathBuf {
        let dir = root.join("p09");
        std::fs::create_dir(&dir).unwrap();
        for level in 1..=5u8 {
            for index in 0..5 {
                write_raw_trial(&dir, level, index, 10, 6);
            }
        }
        dir
    }

    #[test]
    fn test_two_class_build() {
        let root = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let dir = raw_participant(root.path());

        let options = RawBuildOptions {
            window: 10,
            two_class: true,
            ..Default::default()
        };
        let files = build_from_raw(&dir, &options, out.path()).unwrap();
        assert!(files[0].data.ends_with("p09_10@1_4x4_n_twoclass_data.npy"));

        let labels: Array1<u8> = ndarray_npy::read_npy(&files[0].labels).unwrap();
        let chunks: ArrayD<u8> = ndarray_npy::read_npy(&files[0].data).unwrap();
        // Level 3 dropped: 20 trials, one chunk each.
        assert_eq!(labels.len(), 20);
        assert_eq!(labels.iter().filter(|&&l| l == 1).count(), 10);
        assert_eq!(labels.iter().filter(|&&l| l == 2).count(), 10);
        assert!(chunks.iter().all(|&v| v != 3));
    }

    #[test]
    fn test_single_person_balanced_split() {
        let root = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let dir = raw_participant(root.path());

        let options = RawBuildOptions {
            window: 5,
            ground_truth: GroundTruth::Score,
            single_person_balanced: true,
            ..Default::default()
        };
        let files = build_from_raw(&dir, &options, out.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].data.ends_with("p09_5@1_4x4_score_train_data.npy"));
        assert!(files[1].data.ends_with("p09_5@1_4x4_score_validation_data.npy"));

        let train: Array1<u8> = ndarray_npy::read_npy(&files[0].labels).unwrap();
        let valid: Array1<u8> = ndarray_npy::read_npy(&files[1].labels).unwrap();
        // 20 training and 5 validation trials, 2 chunks each
        assert_eq!(train.len(), 40);
        assert_eq!(valid.len(), 10);
        assert!(valid.iter().all(|&l| l == 6));

        // The validation set holds the last trial of every level.
        let chunks: ArrayD<u8> = ndarray_npy::read_npy(&files[1].data).unwrap();
        let levels: Vec<u8> = (0..10).map(|k| chunks[[k, 0, 0, 0, 0]]).collect();
        assert_eq!(levels, vec![1, 1, 2, 2, 3, 3, 4, 4, 5, 5]);
    }

    #[test]
    fn test_unpaired_raw_files_rejected() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("p10");
        std::fs::create_dir(&dir).unwrap();
        write_raw_trial(&dir, 1, 0, 10, 5);
        std::fs::rename(dir.join("1-0-eye.json"), dir.join("1-1-eye.json")).unwrap();

        assert!(matches!(
            discover_raw_trials(&dir),
            Err(DatasetError::PairMismatch(_))
        ));
    }

    #[test]
    fn test_lecture_video_extraction() {
        let log = ExperimentLog::parse(&sample_log_json(T0_MS, 1, 1)).unwrap();
        let root = tempfile::tempdir().unwrap();
        let path = extract_lecture_video(
            &log,
            &mut source(2000),
            "p11",
            ProcessingMethod::Face,
            8,
            root.path(),
        )
        .unwrap();
        assert!(path.ends_with("p11/face_lecture_video.npy"));

        let frames: ArrayD<u8> = ndarray_npy::read_npy(&path).unwrap();
        // 60s lecture at 10 fps, inclusive range
        assert_eq!(frames.shape(), &[601, 8, 8]);
    }

    #[test]
    fn test_build_skips_lecture_video_next_to_trials() {
        let log = ExperimentLog::parse(&sample_log_json(T0_MS, 1, 4)).unwrap();
        let raw_root = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();

        let mut recording = source(2000);
        let dir = extract_raw_trials(
            &log,
            &mut recording,
            "p12",
            ProcessingMethod::Face,
            8,
            raw_root.path(),
        )
        .unwrap();
        let lecture = extract_lecture_video(
            &log,
            &mut recording,
            "p12",
            ProcessingMethod::Face,
            8,
            raw_root.path(),
        )
        .unwrap();
        assert_eq!(lecture.parent(), Some(dir.as_path()));

        let trials = discover_raw_trials(&dir).unwrap();
        assert_eq!(trials.len(), 5);

        let options = RawBuildOptions {
            window: 20,
            ..Default::default()
        };
        let files = build_from_raw(&dir, &options, out.path()).unwrap();
        let labels: Array1<u8> = ndarray_npy::read_npy(&files[0].labels).unwrap();
        assert_eq!(labels.len(), 10);
    }
}
