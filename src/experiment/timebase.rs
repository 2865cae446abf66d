//! Video time base
//!
//! Maps wall-clock timestamps onto frame indices of a recording whose frame 0
//! was captured at a known instant.

use crate::error::DatasetError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::Path;

/// Default capture rate of the experiment recordings
pub const DEFAULT_FPS: f64 = 30.0;

/// Recording start and frame rate of a video
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VideoTimebase {
    pub recording_start: DateTime<Utc>,
    pub fps: f64,
}

impl VideoTimebase {
    pub fn new(recording_start: DateTime<Utc>, fps: f64) -> Result<Self, DatasetError> {
        if !(fps.is_finite() && fps > 0.0) {
            return Err(DatasetError::InvalidConfig(format!(
                "frame rate must be positive, got {}",
                fps
            )));
        }
        Ok(Self {
            recording_start,
            fps,
        })
    }

    /// Use the creation time of the recording file as its start, falling back
    /// to the modification time on filesystems without creation times.
    pub fn from_file_times(path: &Path, fps: f64) -> Result<Self, DatasetError> {
        let metadata = std::fs::metadata(path)?;
        let created = metadata.created().or_else(|_| metadata.modified())?;
        Self::new(DateTime::<Utc>::from(created), fps)
    }

    /// Duration of one frame in milliseconds
    pub fn frame_duration_ms(&self) -> f64 {
        1000.0 / self.fps
    }

    /// Frame captured at `timestamp`. Timestamps before the recording map to frame 0.
    pub fn frame_at(&self, timestamp: DateTime<Utc>) -> usize {
        let elapsed_ms = (timestamp - self.recording_start).num_milliseconds();
        if elapsed_ms < 0 {
            tracing::warn!(
                %timestamp,
                recording_start = %self.recording_start,
                "Timestamp precedes the recording, clamping to frame 0"
            );
            return 0;
        }
        (elapsed_ms as f64 * self.fps / 1000.0).floor() as usize
    }

    /// Inclusive frame range `[frame(start), frame(end)]`
    pub fn frame_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<RangeInclusive<usize>, DatasetError> {
        if end < start {
            return Err(DatasetError::InvalidInterval(format!(
                "end {} is before start {}",
                end, start
            )));
        }
        Ok(self.frame_at(start)..=self.frame_at(end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn timebase() -> VideoTimebase {
        let start = Utc.with_ymd_and_hms(2020, 2, 10, 9, 0, 0).unwrap();
        VideoTimebase::new(start, 30.0).unwrap()
    }

    #[test]
    fn test_frame_at() {
        let tb = timebase();
        let t0 = tb.recording_start;
        assert_eq!(tb.frame_at(t0), 0);
        assert_eq!(tb.frame_at(t0 + Duration::milliseconds(33)), 0);
        assert_eq!(tb.frame_at(t0 + Duration::milliseconds(34)), 1);
        assert_eq!(tb.frame_at(t0 + Duration::seconds(2)), 60);
    }

    #[test]
    fn test_exact_frame_boundaries() {
        let tb = timebase();
        let t0 = tb.recording_start;
        for seconds in 1..=600 {
            assert_eq!(
                tb.frame_at(t0 + Duration::seconds(seconds)),
                seconds as usize * 30,
                "at {}s",
                seconds
            );
        }

        let start = Utc.with_ymd_and_hms(2020, 2, 10, 9, 0, 0).unwrap();
        let tb = VideoTimebase::new(start, 29.97).unwrap();
        assert_eq!(tb.frame_at(start + Duration::seconds(100)), 2997);
    }

    #[test]
    fn test_frame_range_inclusive() {
        let tb = timebase();
        let t0 = tb.recording_start;
        let range = tb
            .frame_range(t0 + Duration::seconds(1), t0 + Duration::seconds(3))
            .unwrap();
        assert_eq!(range, 30..=90);
        assert_eq!(range.count(), 61);
    }

    #[test]
    fn test_before_recording_clamps() {
        let tb = timebase();
        let t0 = tb.recording_start;
        let range = tb
            .frame_range(t0 - Duration::seconds(5), t0 + Duration::seconds(1))
            .unwrap();
        assert_eq!(range, 0..=30);
    }

    #[test]
    fn test_reversed_interval_is_error() {
        let tb = timebase();
        let t0 = tb.recording_start;
        assert!(matches!(
            tb.frame_range(t0 + Duration::seconds(2), t0),
            Err(DatasetError::InvalidInterval(_))
        ));
    }

    #[test]
    fn test_invalid_fps() {
        let start = Utc.with_ymd_and_hms(2020, 2, 10, 9, 0, 0).unwrap();
        assert!(VideoTimebase::new(start, 0.0).is_err());
        assert!(VideoTimebase::new(start, f64::NAN).is_err());
    }

    #[test]
    fn test_from_file_times() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let tb = VideoTimebase::from_file_times(file.path(), 25.0).unwrap();
        assert_eq!(tb.fps, 25.0);
        assert!((Utc::now() - tb.recording_start).num_minutes() < 5);
    }
}
