//! Score statistics and confusion matrices
//!
//! [`ScoreStatistics`] summarizes how well subjects performed on each
//! difficulty level across a set of experiment logs. [`ConfusionMatrix`]
//! compares predicted class labels against the true chunk labels.

use crate::error::DatasetError;
use crate::experiment::ExperimentLog;
use crate::types::{Label, DIFFICULTY_LEVELS, MAX_SCORE};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

const LEVELS: usize = DIFFICULTY_LEVELS as usize;

/// Trial scores of every subject, grouped by difficulty level
#[derive(Debug, Clone, Default)]
pub struct ScoreStatistics {
    /// One entry per subject, holding the trial scores of levels 1-5
    subjects: Vec<[Vec<u8>; LEVELS]>,
}

/// Serializable summary of [`ScoreStatistics`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsReport {
    pub subjects: usize,
    /// Per subject: average score on levels 1-5
    pub average_scores: Vec<Vec<f64>>,
    pub global_average: Vec<f64>,
    pub global_std_deviation: Vec<f64>,
    /// Rows are levels 1-5, columns scores 1-10
    pub score_count: Vec<Vec<u64>>,
}

impl ScoreStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the trial scores of one subject
    pub fn add_subject(&mut self, log: &ExperimentLog) -> Result<(), DatasetError> {
        let mut scores: [Vec<u8>; LEVELS] = Default::default();
        for (index, level_scores) in scores.iter_mut().enumerate() {
            *level_scores = log
                .trials(index as u8 + 1)?
                .iter()
                .map(|t| t.score)
                .collect();
        }
        self.subjects.push(scores);
        Ok(())
    }

    pub fn subject_count(&self) -> usize {
        self.subjects.len()
    }

    /// `(subjects, 5)` matrix of each subject's mean score per level.
    ///
    /// A level without trials averages to 0.
    pub fn average_scores_all_subjects(&self) -> Array2<f64> {
        Array2::from_shape_fn((self.subjects.len(), LEVELS), |(subject, level)| {
            let scores = &self.subjects[subject][level];
            if scores.is_empty() {
                0.0
            } else {
                scores.iter().map(|&s| f64::from(s)).sum::<f64>() / scores.len() as f64
            }
        })
    }

    /// Mean of the subject averages per level
    pub fn global_average_scores(&self) -> Array1<f64> {
        self.average_scores_all_subjects()
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(LEVELS))
    }

    /// Population standard deviation of the subject averages per level
    pub fn global_std_deviation(&self) -> Array1<f64> {
        if self.subjects.is_empty() {
            return Array1::zeros(LEVELS);
        }
        self.average_scores_all_subjects().std_axis(Axis(0), 0.0)
    }

    /// `(5, 10)` matrix counting how often each score 1-10 occurred per level
    pub fn global_score_count(&self) -> Array2<u64> {
        let mut counts = Array2::zeros((LEVELS, MAX_SCORE as usize));
        for subject in &self.subjects {
            for (level, scores) in subject.iter().enumerate() {
                for &score in scores {
                    if (1..=MAX_SCORE).contains(&score) {
                        counts[[level, score as usize - 1]] += 1;
                    }
                }
            }
        }
        counts
    }

    pub fn report(&self) -> StatisticsReport {
        StatisticsReport {
            subjects: self.subjects.len(),
            average_scores: self
                .average_scores_all_subjects()
                .outer_iter()
                .map(|row| row.to_vec())
                .collect(),
            global_average: self.global_average_scores().to_vec(),
            global_std_deviation: self.global_std_deviation().to_vec(),
            score_count: self
                .global_score_count()
                .outer_iter()
                .map(|row| row.to_vec())
                .collect(),
        }
    }
}

/// Confusion matrix over 1-based class labels
#[derive(Debug, Clone, PartialEq)]
pub struct ConfusionMatrix {
    /// Rows are actual classes, columns predicted classes
    counts: Array2<u64>,
}

impl ConfusionMatrix {
    /// Count `(actual, predicted)` pairs for classes `1..=classes`
    pub fn from_labels(
        actual: ArrayView1<'_, Label>,
        predicted: ArrayView1<'_, Label>,
        classes: usize,
    ) -> Result<Self, DatasetError> {
        if actual.len() != predicted.len() {
            return Err(DatasetError::Misaligned {
                chunks: predicted.len(),
                labels: actual.len(),
            });
        }

        let mut counts = Array2::zeros((classes, classes));
        for (&a, &p) in actual.iter().zip(predicted.iter()) {
            let row = class_index(a, classes)?;
            let col = class_index(p, classes)?;
            counts[[row, col]] += 1;
        }
        Ok(Self { counts })
    }

    /// Build from per-class prediction scores `(samples, classes)`; the
    /// predicted class is the arg-max column plus one.
    pub fn from_scores(
        actual: ArrayView1<'_, Label>,
        scores: ArrayView2<'_, f32>,
    ) -> Result<Self, DatasetError> {
        let classes = scores.ncols();
        let predicted: Array1<Label> = scores
            .outer_iter()
            .map(|row| {
                let best = row
                    .iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
                        if v > best.1 {
                            (i, v)
                        } else {
                            best
                        }
                    })
                    .0;
                Label::try_from(best + 1).map_err(|_| {
                    DatasetError::InvalidConfig(format!("{} classes do not fit a label", classes))
                })
            })
            .collect::<Result<_, _>>()?;

        Self::from_labels(actual, predicted.view(), classes)
    }

    pub fn classes(&self) -> usize {
        self.counts.nrows()
    }

    pub fn counts(&self) -> &Array2<u64> {
        &self.counts
    }

    /// Counts divided by their row sums. Classes that never occurred get an all-zero row.
    pub fn normalized(&self) -> Array2<f64> {
        let mut out = self.counts.mapv(|c| c as f64);
        for mut row in out.outer_iter_mut() {
            let total = row.sum();
            if total > 0.0 {
                row /= total;
            }
        }
        out
    }

    /// Fraction of samples on the diagonal
    pub fn accuracy(&self) -> f64 {
        let total = self.counts.sum();
        if total == 0 {
            return 0.0;
        }
        self.counts.diag().sum() as f64 / total as f64
    }
}

fn class_index(label: Label, classes: usize) -> Result<usize, DatasetError> {
    let label = label as usize;
    if label == 0 || label > classes {
        return Err(DatasetError::InvalidConfig(format!(
            "label {} outside classes 1..={}",
            label, classes
        )));
    }
    Ok(label - 1)
}
