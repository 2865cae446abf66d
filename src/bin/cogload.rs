//! cogload CLI - Command-line interface for the cogload dataset builder
//!
//! Commands:
//! - process: Build a participant dataset from a session directory
//! - extract: Write one raw frame stack per trial
//! - build: Build datasets from raw trial files
//! - merge: Concatenate participant datasets
//! - trials: Print the trials of an experiment log
//! - stats: Score statistics over experiment logs
//! - confusion: Confusion matrix from labels and predictions

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use ndarray::{Array1, Array2};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cogload::experiment::{ExperimentLog, SessionFiles, VideoTimebase};
use cogload::pipeline::{self, RawBuildOptions};
use cogload::source::{CenterCrop, FrameStackSource};
use cogload::statistics::{ConfusionMatrix, ScoreStatistics};
use cogload::types::{GroundTruth, ProcessingMethod, DIFFICULTY_LEVELS};
use cogload::{merge, DatasetError, DatasetFiles, RunConfig, VERSION};

/// cogload - Windowed video dataset builder for cognitive load research
#[derive(Parser)]
#[command(name = "cogload")]
#[command(version = VERSION)]
#[command(
    about = "Build windowed video datasets from N-back experiment sessions",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a participant dataset from a session directory
    Process {
        /// Session directory with the experiment log and the decoded recording
        session: PathBuf,

        /// Run configuration file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,

        #[command(flatten)]
        overrides: ConfigOverrides,

        /// Start of the recording (RFC 3339), defaults to the recording file time
        #[arg(long)]
        recording_start: Option<DateTime<Utc>>,
    },

    /// Write one raw frame stack and ground-truth file per trial
    Extract {
        /// Session directory with the experiment log and the decoded recording
        session: PathBuf,

        /// Processing method
        #[arg(long, default_value = "face")]
        method: Method,

        /// Edge length of the square crops
        #[arg(long, default_value_t = cogload::config::DEFAULT_CROP)]
        crop: usize,

        /// Capture rate of the recording
        #[arg(long, default_value_t = cogload::experiment::DEFAULT_FPS)]
        fps: f64,

        /// Start of the recording (RFC 3339), defaults to the recording file time
        #[arg(long)]
        recording_start: Option<DateTime<Utc>>,

        /// Also extract the lecture video segment
        #[arg(long)]
        lecture: bool,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },

    /// Build datasets from a directory of raw trial files
    Build {
        /// Participant directory written by `extract`
        raw_dir: PathBuf,

        /// Label source
        #[arg(long, default_value = "n")]
        ground_truth: Truth,

        /// Frames per chunk
        #[arg(long, default_value_t = cogload::config::DEFAULT_WINDOW)]
        window: usize,

        /// Frame stride
        #[arg(long, default_value_t = 1)]
        subsample: usize,

        /// Drop level 3 and merge levels 1-2 and 4-5
        #[arg(long)]
        two_class: bool,

        /// Split into training and validation sets
        #[arg(long)]
        single_person_balanced: bool,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },

    /// Concatenate all participant datasets of a directory
    Merge {
        /// Directory containing the participant datasets
        dir: PathBuf,

        /// Output directory (defaults to the input directory)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Only merge datasets with this descriptor, e.g. 60@1_64x64_n_train
        #[arg(long)]
        descriptor: Option<String>,
    },

    /// Print the trials of an experiment log as JSON
    Trials {
        /// Experiment log
        log: PathBuf,

        /// Start of the recording (RFC 3339) to resolve frame ranges
        #[arg(long)]
        recording_start: Option<DateTime<Utc>>,

        /// Capture rate of the recording
        #[arg(long, default_value_t = cogload::experiment::DEFAULT_FPS)]
        fps: f64,
    },

    /// Compute score statistics over experiment logs
    Stats {
        /// Experiment logs, one per subject
        #[arg(required = true)]
        logs: Vec<PathBuf>,

        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Compute a confusion matrix from labels and predictions
    Confusion {
        /// True labels (.npy, u8)
        labels: PathBuf,

        /// Predicted labels (.npy, u8) or class scores (.npy, f32, one row per sample)
        predictions: PathBuf,

        /// Number of classes
        #[arg(long, default_value_t = DIFFICULTY_LEVELS as usize)]
        classes: usize,

        /// Write the row-normalized matrix to this .npy file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Flags overriding the run configuration
#[derive(clap::Args)]
struct ConfigOverrides {
    /// Processing method
    #[arg(long)]
    method: Option<Method>,

    /// Label source
    #[arg(long)]
    ground_truth: Option<Truth>,

    /// Frames per chunk
    #[arg(long)]
    window: Option<usize>,

    /// Edge length of the square crops
    #[arg(long)]
    crop: Option<usize>,

    /// Frame stride
    #[arg(long)]
    subsample: Option<usize>,

    /// Capture rate of the recording
    #[arg(long)]
    fps: Option<f64>,

    /// Output directory
    #[arg(short, long)]
    output: Option<PathBuf>,
}

impl ConfigOverrides {
    fn apply(self, config: &mut RunConfig) {
        if let Some(method) = self.method {
            config.method = method.into();
        }
        if let Some(ground_truth) = self.ground_truth {
            config.ground_truth = ground_truth.into();
        }
        if let Some(window) = self.window {
            config.window = window;
        }
        if let Some(crop) = self.crop {
            config.crop = crop;
        }
        if let Some(subsample) = self.subsample {
            config.subsample = subsample;
        }
        if let Some(fps) = self.fps {
            config.fps = fps;
        }
        if let Some(output) = self.output {
            config.output = output;
        }
    }
}

/// Kind of frames held by the session recording. Every method is center-cropped.
#[derive(Clone, Copy, ValueEnum)]
enum Method {
    /// Grayscale face crops
    Face,
    /// Grayscale eye crops
    Eye,
    /// Three-channel optical flow images
    Opticalflow,
}

impl From<Method> for ProcessingMethod {
    fn from(m: Method) -> Self {
        match m {
            Method::Face => ProcessingMethod::Face,
            Method::Eye => ProcessingMethod::Eye,
            Method::Opticalflow => ProcessingMethod::OpticalFlow,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Truth {
    /// N-back difficulty level
    N,
    /// Trial score
    Score,
}

impl From<Truth> for GroundTruth {
    fn from(t: Truth) -> Self {
        match t {
            Truth::N => GroundTruth::N,
            Truth::Score => GroundTruth::Score,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e))
                    .unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CliFailure> {
    match cli.command {
        Commands::Process {
            session,
            config,
            overrides,
            recording_start,
        } => cmd_process(&session, config.as_deref(), overrides, recording_start),

        Commands::Extract {
            session,
            method,
            crop,
            fps,
            recording_start,
            lecture,
            output,
        } => cmd_extract(
            &session,
            method.into(),
            crop,
            fps,
            recording_start,
            lecture,
            &output,
        ),

        Commands::Build {
            raw_dir,
            ground_truth,
            window,
            subsample,
            two_class,
            single_person_balanced,
            output,
        } => {
            let options = RawBuildOptions {
                ground_truth: ground_truth.into(),
                window,
                subsample,
                two_class,
                single_person_balanced,
            };
            let files = pipeline::build_from_raw(&raw_dir, &options, &output)?;
            print_json(&files.iter().map(FilesReport::from).collect::<Vec<_>>())
        }

        Commands::Merge {
            dir,
            output,
            descriptor,
        } => {
            let output = output.unwrap_or_else(|| dir.clone());
            let files = merge::merge_directory(&dir, &output, descriptor.as_deref())?;
            print_json(&FilesReport::from(&files))
        }

        Commands::Trials {
            log,
            recording_start,
            fps,
        } => cmd_trials(&log, recording_start, fps),

        Commands::Stats { logs, output } => cmd_stats(&logs, output.as_deref()),

        Commands::Confusion {
            labels,
            predictions,
            classes,
            output,
        } => cmd_confusion(&labels, &predictions, classes, output.as_deref()),
    }
}

fn load_session(
    dir: &Path,
    fps: f64,
    recording_start: Option<DateTime<Utc>>,
) -> Result<(SessionFiles, ExperimentLog, FrameStackSource<CenterCrop>), CliFailure> {
    let session = SessionFiles::discover(dir)?;
    let log = ExperimentLog::load(&session.log)?;
    let timebase = match recording_start {
        Some(start) => VideoTimebase::new(start, fps)?,
        None => VideoTimebase::from_file_times(&session.recording, fps)?,
    };
    let source = FrameStackSource::load(&session.recording, timebase, CenterCrop)?;
    Ok((session, log, source))
}

fn cmd_process(
    dir: &Path,
    config_path: Option<&Path>,
    overrides: ConfigOverrides,
    recording_start: Option<DateTime<Utc>>,
) -> Result<(), CliFailure> {
    let mut config = match config_path {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };
    overrides.apply(&mut config);
    config.validate()?;

    let (session, log, mut source) = load_session(dir, config.fps, recording_start)?;
    let files = pipeline::process_and_write(&log, &mut source, &session.participant, &config)?;
    print_json(&FilesReport::from(&files))
}

fn cmd_extract(
    dir: &Path,
    method: ProcessingMethod,
    crop: usize,
    fps: f64,
    recording_start: Option<DateTime<Utc>>,
    lecture: bool,
    output: &Path,
) -> Result<(), CliFailure> {
    let (session, log, mut source) = load_session(dir, fps, recording_start)?;
    let participant_dir = pipeline::extract_raw_trials(
        &log,
        &mut source,
        &session.participant,
        method,
        crop,
        output,
    )?;
    if lecture {
        pipeline::extract_lecture_video(
            &log,
            &mut source,
            &session.participant,
            method,
            crop,
            output,
        )?;
    }

    print_json(&serde_json::json!({
        "participant": session.participant,
        "directory": participant_dir,
    }))
}

fn cmd_trials(
    path: &Path,
    recording_start: Option<DateTime<Utc>>,
    fps: f64,
) -> Result<(), CliFailure> {
    let log = ExperimentLog::load(path)?;
    let timebase = recording_start
        .map(|start| VideoTimebase::new(start, fps))
        .transpose()?;

    let mut reports = Vec::new();
    for level in 1..=DIFFICULTY_LEVELS {
        for (index, trial) in log.trials(level)?.into_iter().enumerate() {
            let frames = match &timebase {
                Some(tb) => {
                    let range = tb.frame_range(trial.start, trial.end)?;
                    Some([*range.start(), *range.end()])
                }
                None => None,
            };
            reports.push(TrialReport {
                level,
                index,
                start: trial.start,
                end: trial.end,
                score: trial.score,
                frames,
            });
        }
    }

    print_json(&reports)
}

fn cmd_stats(logs: &[PathBuf], output: Option<&Path>) -> Result<(), CliFailure> {
    let mut stats = ScoreStatistics::new();
    for path in logs {
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            return Err(CliFailure::InvalidArgument(format!(
                "{} is not a .json experiment log",
                path.display()
            )));
        }
        stats.add_subject(&ExperimentLog::load(path)?)?;
    }

    let report = stats.report();
    match output {
        Some(path) => {
            std::fs::write(path, serde_json::to_string_pretty(&report)?)?;
            tracing::info!(path = %path.display(), "Saved statistics");
            Ok(())
        }
        None => print_json(&report),
    }
}

fn cmd_confusion(
    labels_path: &Path,
    predictions_path: &Path,
    classes: usize,
    output: Option<&Path>,
) -> Result<(), CliFailure> {
    let labels: Array1<u8> = ndarray_npy::read_npy(labels_path).map_err(DatasetError::from)?;

    let matrix = match ndarray_npy::read_npy::<_, Array1<u8>>(predictions_path) {
        Ok(predicted) => ConfusionMatrix::from_labels(labels.view(), predicted.view(), classes)?,
        Err(_) => {
            let scores: Array2<f32> =
                ndarray_npy::read_npy(predictions_path).map_err(DatasetError::from)?;
            ConfusionMatrix::from_scores(labels.view(), scores.view())?
        }
    };

    let normalized = matrix.normalized();
    if let Some(path) = output {
        ndarray_npy::write_npy(path, &normalized).map_err(DatasetError::from)?;
        tracing::info!(path = %path.display(), "Saved confusion matrix");
    }

    print_json(&ConfusionReport {
        classes: matrix.classes(),
        accuracy: matrix.accuracy(),
        counts: matrix.counts().outer_iter().map(|r| r.to_vec()).collect(),
        normalized: normalized.outer_iter().map(|r| r.to_vec()).collect(),
    })
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), CliFailure> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// Report types

#[derive(serde::Serialize)]
struct FilesReport {
    data: PathBuf,
    labels: PathBuf,
}

impl From<&DatasetFiles> for FilesReport {
    fn from(files: &DatasetFiles) -> Self {
        FilesReport {
            data: files.data.clone(),
            labels: files.labels.clone(),
        }
    }
}

#[derive(serde::Serialize)]
struct TrialReport {
    level: u8,
    index: usize,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    score: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    frames: Option<[usize; 2]>,
}

#[derive(serde::Serialize)]
struct ConfusionReport {
    classes: usize,
    accuracy: f64,
    counts: Vec<Vec<u64>>,
    normalized: Vec<Vec<f64>>,
}

// Error types

#[derive(Debug)]
enum CliFailure {
    Dataset(DatasetError),
    Json(serde_json::Error),
    Io(std::io::Error),
    InvalidArgument(String),
}

impl From<DatasetError> for CliFailure {
    fn from(e: DatasetError) -> Self {
        CliFailure::Dataset(e)
    }
}

impl From<serde_json::Error> for CliFailure {
    fn from(e: serde_json::Error) -> Self {
        CliFailure::Json(e)
    }
}

impl From<std::io::Error> for CliFailure {
    fn from(e: std::io::Error) -> Self {
        CliFailure::Io(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl CliError {
    fn new(code: &str, message: String, hint: Option<&str>) -> Self {
        CliError {
            code: code.to_string(),
            message,
            hint: hint.map(str::to_string),
        }
    }
}

impl From<CliFailure> for CliError {
    fn from(e: CliFailure) -> Self {
        match e {
            CliFailure::Dataset(e) => {
                let message = e.to_string();
                match e {
                    DatasetError::InvalidConfig(_) => CliError::new(
                        "INVALID_CONFIG",
                        message,
                        Some("Window, crop and subsample must be greater than 0"),
                    ),
                    DatasetError::ShapeMismatch(_) => CliError::new(
                        "SHAPE_MISMATCH",
                        message,
                        Some("All datasets must share window size and frame shape"),
                    ),
                    DatasetError::Misaligned { .. } => CliError::new(
                        "MISALIGNED",
                        message,
                        Some("Regenerate the dataset; chunk and label files disagree"),
                    ),
                    DatasetError::PairMismatch(_) => CliError::new(
                        "PAIR_MISMATCH",
                        message,
                        Some("Pair every data file with its label file, or merge one --descriptor"),
                    ),
                    DatasetError::InvalidName(_) => CliError::new(
                        "INVALID_NAME",
                        message,
                        Some("Expected {identifier}_{window}@{subsample}_{H}x{W}[_{suffix}]"),
                    ),
                    DatasetError::InvalidInterval(_) => {
                        CliError::new("INVALID_INTERVAL", message, None)
                    }
                    DatasetError::ExperimentLog(_) => CliError::new(
                        "EXPERIMENT_LOG_ERROR",
                        message,
                        Some("Check that the log was written by the N-back experiment"),
                    ),
                    DatasetError::MissingInput(_) => CliError::new(
                        "MISSING_INPUT",
                        message,
                        Some("A session directory holds one .json log and one .npy recording"),
                    ),
                    DatasetError::Io(_) => {
                        CliError::new("IO_ERROR", message, Some("Check file paths and permissions"))
                    }
                    DatasetError::JsonError(_) => {
                        CliError::new("JSON_ERROR", message, Some("Check JSON syntax"))
                    }
                    DatasetError::ArrayShape(_)
                    | DatasetError::ReadNpy(_)
                    | DatasetError::WriteNpy(_)
                    | DatasetError::ViewNpy(_) => CliError::new(
                        "NPY_ERROR",
                        message,
                        Some("Arrays must be C-ordered u8 .npy files"),
                    ),
                }
            }
            CliFailure::Json(e) => {
                CliError::new("JSON_ERROR", e.to_string(), Some("Check JSON syntax"))
            }
            CliFailure::Io(e) => CliError::new(
                "IO_ERROR",
                e.to_string(),
                Some("Check file paths and permissions"),
            ),
            CliFailure::InvalidArgument(msg) => CliError::new("INVALID_ARGUMENT", msg, None),
        }
    }
}
