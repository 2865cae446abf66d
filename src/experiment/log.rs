//! N-back experiment log reader
//!
//! The experiment front end writes one JSON array containing every recorded
//! stimulus. Stimuli of the N-back task carry `test_part == "n-back"`, the
//! difficulty `n`, and an `internal_node_id` such as `"0.0-3.0-1.0"` whose
//! second component identifies the trial the stimulus belongs to. The very last
//! record describes the lecture video segment.

use crate::error::DatasetError;
use crate::types::{Trial, DIFFICULTY_LEVELS};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// `test_part` value of N-back stimuli
pub const N_BACK_PART: &str = "n-back";

/// One record of the experiment log. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(default)]
    pub test_part: Option<String>,
    #[serde(default)]
    pub n: Option<u8>,
    #[serde(default)]
    pub internal_node_id: Option<String>,
    /// Epoch milliseconds
    #[serde(default)]
    pub trial_start: Option<f64>,
    /// Epoch milliseconds
    #[serde(default)]
    pub trial_end: Option<f64>,
    #[serde(default)]
    pub correct: Option<bool>,
}

/// Parsed experiment log with stimuli grouped into trials per difficulty level
#[derive(Debug, Clone)]
pub struct ExperimentLog {
    /// Index `level - 1` holds the trials of that level, each a list of stimuli
    levels: Vec<Vec<Vec<LogRecord>>>,
    lecture: Option<LogRecord>,
}

impl ExperimentLog {
    /// Read and parse an experiment log file
    pub fn load(path: &Path) -> Result<Self, DatasetError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse the JSON array written by the experiment
    pub fn parse(json: &str) -> Result<Self, DatasetError> {
        let records: Vec<LogRecord> = serde_json::from_str(json)?;
        Self::from_records(records)
    }

    pub fn from_records(records: Vec<LogRecord>) -> Result<Self, DatasetError> {
        let mut levels = Vec::with_capacity(DIFFICULTY_LEVELS as usize);

        for level in 1..=DIFFICULTY_LEVELS {
            let stimuli: Vec<&LogRecord> = records
                .iter()
                .filter(|r| r.test_part.as_deref() == Some(N_BACK_PART) && r.n == Some(level))
                .collect();
            levels.push(group_trials(&stimuli)?);
        }

        Ok(Self {
            levels,
            lecture: records.last().cloned(),
        })
    }

    /// Number of trials recorded for `level`
    pub fn trial_count(&self, level: u8) -> usize {
        self.level_trials(level).map(|t| t.len()).unwrap_or(0)
    }

    /// All trials of difficulty `level` (1-5), ordered by trial id.
    ///
    /// A trial starts at the first stimulus the subject can answer (index
    /// `level`) and ends with the last stimulus. The score is the number of
    /// answerable stimuli marked correct.
    pub fn trials(&self, level: u8) -> Result<Vec<Trial>, DatasetError> {
        let grouped = self.level_trials(level).ok_or_else(|| {
            DatasetError::InvalidConfig(format!(
                "difficulty level must be between 1 and {}, got {}",
                DIFFICULTY_LEVELS, level
            ))
        })?;

        grouped
            .iter()
            .enumerate()
            .map(|(index, stimuli)| build_trial(level, index, stimuli))
            .collect()
    }

    /// Trials of every difficulty level, level 1 first
    pub fn all_trials(&self) -> Result<Vec<Trial>, DatasetError> {
        let mut all = Vec::new();
        for level in 1..=DIFFICULTY_LEVELS {
            all.extend(self.trials(level)?);
        }
        Ok(all)
    }

    /// Start and end of the lecture video segment (the last record of the log)
    pub fn lecture_interval(&self) -> Result<(DateTime<Utc>, DateTime<Utc>), DatasetError> {
        let record = self
            .lecture
            .as_ref()
            .ok_or_else(|| DatasetError::ExperimentLog("experiment log is empty".to_string()))?;

        let start = required_timestamp(record.trial_start, "trial_start of lecture record")?;
        let end = required_timestamp(record.trial_end, "trial_end of lecture record")?;
        Ok((start, end))
    }

    fn level_trials(&self, level: u8) -> Option<&Vec<Vec<LogRecord>>> {
        if level == 0 {
            return None;
        }
        self.levels.get(level as usize - 1)
    }
}

/// Extract the component at `index` of an `internal_node_id` like `"0.0-3.0-1.0"`
pub fn node_id_component(node_id: &str, index: usize) -> Option<f64> {
    node_id.split('-').nth(index)?.parse().ok()
}

/// Group stimuli into trials by the second node id component, ordered by id
fn group_trials(stimuli: &[&LogRecord]) -> Result<Vec<Vec<LogRecord>>, DatasetError> {
    // Keyed on thousandths of the id so trials sort numerically.
    let mut groups: BTreeMap<i64, Vec<LogRecord>> = BTreeMap::new();

    for stimulus in stimuli {
        let node_id = stimulus.internal_node_id.as_deref().ok_or_else(|| {
            DatasetError::ExperimentLog("stimulus without internal_node_id".to_string())
        })?;
        let trial_id = node_id_component(node_id, 1).ok_or_else(|| {
            DatasetError::ExperimentLog(format!("malformed internal_node_id '{}'", node_id))
        })?;

        groups
            .entry((trial_id * 1000.0).round() as i64)
            .or_default()
            .push((*stimulus).clone());
    }

    Ok(groups.into_values().collect())
}

fn build_trial(level: u8, index: usize, stimuli: &[LogRecord]) -> Result<Trial, DatasetError> {
    let first = stimuli.get(level as usize).ok_or_else(|| {
        DatasetError::ExperimentLog(format!(
            "trial {} of level {} has {} stimuli, at least {} required",
            index + 1,
            level,
            stimuli.len(),
            level as usize + 1
        ))
    })?;
    // `first` exists, so the trial is non-empty
    let last = &stimuli[stimuli.len() - 1];

    let start = required_timestamp(first.trial_start, "trial_start")?;
    let end = required_timestamp(last.trial_end, "trial_end")?;

    let correct = stimuli[level as usize..]
        .iter()
        .filter(|s| s.correct == Some(true))
        .count();

    Ok(Trial {
        start,
        end,
        level,
        score: u8::try_from(correct).unwrap_or(u8::MAX),
    })
}

fn required_timestamp(millis: Option<f64>, field: &str) -> Result<DateTime<Utc>, DatasetError> {
    let millis =
        millis.ok_or_else(|| DatasetError::ExperimentLog(format!("missing {}", field)))?;
    DateTime::from_timestamp_millis(millis.round() as i64).ok_or_else(|| {
        DatasetError::ExperimentLog(format!("{} out of range: {}", field, millis))
    })
}

/// Test fixture: `trials_per_level` trials for every level, each with
/// `level + stimuli` one-second stimuli, starting at `t0` epoch millis.
#[cfg(test)]
pub(crate) fn sample_log_json(t0: i64, trials_per_level: usize, stimuli: usize) -> String {
    let mut records = Vec::new();
    let mut t = t0;

    for level in 1..=5u8 {
        for trial in 0..trials_per_level {
            let node = (level as usize - 1) * trials_per_level + trial;
            for s in 0..(level as usize + stimuli) {
                records.push(serde_json::json!({
                    "test_part": "n-back",
                    "n": level,
                    "internal_node_id": format!("0.0-{}.0-{}.0", node, s),
                    "trial_start": t,
                    "trial_end": t + 1000,
                    "correct": s % 2 == 0,
                }));
                t += 1000;
            }
        }
    }

    records.push(serde_json::json!({
        "test_part": "lecture",
        "trial_start": t,
        "trial_end": t + 60_000,
    }));

    serde_json::Value::Array(records).to_string()
}
