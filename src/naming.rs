//! Dataset file naming
//!
//! Every serialized dataset is identified by a stem of the form
//! `{identifier}_{window}@{subsample}_{H}x{W}[_{suffix}]`, for example
//! `p01_60@1_64x64_n`. The chunk file is `<stem>_data.npy` and the label file
//! `<stem>_labels.npy`.

use crate::error::DatasetError;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// File extension of serialized arrays
pub const ARRAY_EXTENSION: &str = "npy";

/// Suffix marking the chunk array file
pub const DATA_SUFFIX: &str = "_data";

/// Suffix marking the label array file
pub const LABELS_SUFFIX: &str = "_labels";

/// Identifier used for merged datasets
pub const MERGED_IDENTIFIER: &str = "all";

/// Parsed dataset file stem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetStem {
    pub identifier: String,
    pub window: usize,
    pub subsample: usize,
    pub height: usize,
    pub width: usize,
    pub suffix: Option<String>,
}

impl DatasetStem {
    pub fn data_file_name(&self) -> String {
        format!("{}{}.{}", self, DATA_SUFFIX, ARRAY_EXTENSION)
    }

    pub fn labels_file_name(&self) -> String {
        format!("{}{}.{}", self, LABELS_SUFFIX, ARRAY_EXTENSION)
    }

    pub fn data_path(&self, dir: &Path) -> PathBuf {
        dir.join(self.data_file_name())
    }

    pub fn labels_path(&self, dir: &Path) -> PathBuf {
        dir.join(self.labels_file_name())
    }

    /// Everything after the identifier, e.g. `60@1_64x64_n`
    pub fn descriptor(&self) -> String {
        let mut out = format!(
            "{}@{}_{}x{}",
            self.window, self.subsample, self.height, self.width
        );
        if let Some(suffix) = &self.suffix {
            out.push('_');
            out.push_str(suffix);
        }
        out
    }

    /// The stem of the combined dataset built from datasets named like this one
    pub fn merged(&self) -> Self {
        Self {
            identifier: MERGED_IDENTIFIER.to_string(),
            ..self.clone()
        }
    }

    /// Parse the stem of a `<stem>_data.npy` file name
    pub fn from_data_file(file_name: &str) -> Result<Self, DatasetError> {
        strip_array_suffix(file_name, DATA_SUFFIX)?.parse()
    }

    /// Parse the stem of a `<stem>_labels.npy` file name
    pub fn from_labels_file(file_name: &str) -> Result<Self, DatasetError> {
        strip_array_suffix(file_name, LABELS_SUFFIX)?.parse()
    }
}

impl fmt::Display for DatasetStem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.identifier, self.descriptor())
    }
}

impl FromStr for DatasetStem {
    type Err = DatasetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens: Vec<&str> = s.split('_').collect();

        // The identifier may itself contain underscores, so locate the
        // `{window}@{subsample}` token followed by `{H}x{W}`.
        for pos in 1..tokens.len().saturating_sub(1) {
            let (Some((window, subsample)), Some((height, width))) =
                (parse_pair(tokens[pos], '@'), parse_pair(tokens[pos + 1], 'x'))
            else {
                continue;
            };

            let suffix = if pos + 2 < tokens.len() {
                Some(tokens[pos + 2..].join("_"))
            } else {
                None
            };

            return Ok(Self {
                identifier: tokens[..pos].join("_"),
                window,
                subsample,
                height,
                width,
                suffix,
            });
        }

        Err(DatasetError::InvalidName(format!(
            "'{}' does not match {{identifier}}_{{window}}@{{subsample}}_{{H}}x{{W}}[_{{suffix}}]",
            s
        )))
    }
}

fn parse_pair(token: &str, separator: char) -> Option<(usize, usize)> {
    let (a, b) = token.split_once(separator)?;
    Some((a.parse().ok()?, b.parse().ok()?))
}

fn strip_array_suffix<'a>(file_name: &'a str, marker: &str) -> Result<&'a str, DatasetError> {
    file_name
        .strip_suffix(ARRAY_EXTENSION)
        .and_then(|s| s.strip_suffix('.'))
        .and_then(|s| s.strip_suffix(marker))
        .ok_or_else(|| {
            DatasetError::InvalidName(format!(
                "'{}' does not end in {}.{}",
                file_name, marker, ARRAY_EXTENSION
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn stem(suffix: Option<&str>) -> DatasetStem {
        DatasetStem {
            identifier: "p01".to_string(),
            window: 60,
            subsample: 1,
            height: 64,
            width: 64,
            suffix: suffix.map(str::to_string),
        }
    }

    #[test]
    fn test_stem_format() {
        assert_eq!(stem(Some("n")).to_string(), "p01_60@1_64x64_n");
        assert_eq!(stem(None).to_string(), "p01_60@1_64x64");
        assert_eq!(stem(Some("n")).data_file_name(), "p01_60@1_64x64_n_data.npy");
        assert_eq!(
            stem(Some("n")).labels_file_name(),
            "p01_60@1_64x64_n_labels.npy"
        );
    }

    #[test]
    fn test_stem_parse_with_multi_token_suffix() {
        let parsed: DatasetStem = "p07_30@2_32x48_n_twoclass_train".parse().unwrap();
        assert_eq!(parsed.identifier, "p07");
        assert_eq!(parsed.window, 30);
        assert_eq!(parsed.subsample, 2);
        assert_eq!(parsed.height, 32);
        assert_eq!(parsed.width, 48);
        assert_eq!(parsed.suffix.as_deref(), Some("n_twoclass_train"));
    }

    #[test]
    fn test_stem_parse_identifier_with_underscore() {
        let parsed: DatasetStem = "subject_12_60@1_64x64".parse().unwrap();
        assert_eq!(parsed.identifier, "subject_12");
        assert_eq!(parsed.suffix, None);
    }

    #[test]
    fn test_stem_from_file_names() {
        let data = DatasetStem::from_data_file("p02_60@1_64x64_score_data.npy").unwrap();
        let labels = DatasetStem::from_labels_file("p02_60@1_64x64_score_labels.npy").unwrap();
        assert_eq!(data, labels);
        assert!(DatasetStem::from_data_file("p02_60@1_64x64_score_labels.npy").is_err());
    }

    #[test]
    fn test_merged_stem() {
        let merged = stem(Some("n")).merged();
        assert_eq!(merged.to_string(), "all_60@1_64x64_n");
        assert_eq!(merged.descriptor(), "60@1_64x64_n");
    }

    #[test]
    fn test_invalid_stem() {
        assert!("p01_sixty_64x64".parse::<DatasetStem>().is_err());
        assert!("".parse::<DatasetStem>().is_err());
    }
}
