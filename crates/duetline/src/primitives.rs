//! Core primitives for duetline
//!
//! Time types, segment identity and source locations shared by the
//! scheduler, the engine and the storage collaborators.

use std::fmt;
use std::ops::{Add, Sub};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// AUDIO FORMAT
// =============================================================================

/// Sample rate of every recording and decoded track.
pub const SAMPLE_RATE: u32 = 44_100;

/// Recordings are mono.
pub const RECORDING_CHANNELS: u16 = 1;

/// Recordings are 16-bit signed linear PCM.
pub const RECORDING_BITS: u16 = 16;

// =============================================================================
// TIME TYPES
// =============================================================================

/// Physical time in seconds
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize, Default)]
pub struct Second(pub f64);

impl Second {
    pub fn zero() -> Self {
        Self(0.0)
    }

    pub fn from_millis(ms: f64) -> Self {
        Self(ms / 1000.0)
    }

    pub fn as_millis(self) -> f64 {
        self.0 * 1000.0
    }

    /// Frame index at `sample_rate`, rounded to the nearest frame.
    pub fn to_samples(self, sample_rate: u32) -> Sample {
        Sample((self.0.max(0.0) * sample_rate as f64).round() as u64)
    }
}

impl Add for Second {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Second(self.0 + rhs.0)
    }
}

impl Sub for Second {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Second((self.0 - rhs.0).max(0.0))
    }
}

/// Audio sample position (frames, one sample per channel)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Sample(pub u64);

impl Sample {
    pub fn zero() -> Self {
        Self(0)
    }

    pub fn to_seconds(self, sample_rate: u32) -> Second {
        Second(self.0 as f64 / sample_rate as f64)
    }

    pub fn to_millis(self, sample_rate: u32) -> f64 {
        frames_to_ms(self.0, sample_rate)
    }

    pub fn from_millis(ms: f64, sample_rate: u32) -> Self {
        Sample(ms_to_frames(ms, sample_rate))
    }
}

impl Add for Sample {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Sample(self.0 + rhs.0)
    }
}

impl Sub for Sample {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Sample(self.0.saturating_sub(rhs.0))
    }
}

/// `frames * 1000 / sample_rate`
pub fn frames_to_ms(frames: u64, sample_rate: u32) -> f64 {
    frames as f64 * 1000.0 / sample_rate as f64
}

/// Nearest frame for a millisecond offset. Negative and NaN offsets map to 0.
pub fn ms_to_frames(ms: f64, sample_rate: u32) -> u64 {
    if ms.is_nan() || ms <= 0.0 {
        return 0;
    }
    (ms * sample_rate as f64 / 1000.0).round() as u64
}

// =============================================================================
// IDENTITY
// =============================================================================

/// Stable identifier of a recorded segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentId(pub Uuid);

impl SegmentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SegmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for SegmentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Opaque reference to a segment's audio: a storage key, a path or a URI.
///
/// The engine never interprets it; a [`crate::SourceResolver`] does.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceLocation(pub String);

impl SourceLocation {
    pub fn new(location: impl Into<String>) -> Self {
        Self(location.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Local filesystem path, for plain paths and `file://` URIs.
    pub fn as_path(&self) -> Option<&Path> {
        if let Some(path) = self.0.strip_prefix("file://") {
            return Some(Path::new(path));
        }
        if self.0.contains("://") {
            return None;
        }
        Some(Path::new(&self.0))
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceLocation {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SourceLocation {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<PathBuf> for SourceLocation {
    fn from(path: PathBuf) -> Self {
        Self(path.to_string_lossy().into_owned())
    }
}

// =============================================================================
// SEGMENT
// =============================================================================

/// One recorded layer of a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: SegmentId,
    pub duration: Second,
    pub source: SourceLocation,
    pub parent: Option<SegmentId>,
    pub created_at: DateTime<Utc>,
    /// Start offset actually observed when this take was recorded.
    #[serde(default)]
    pub recorded_start: Option<Second>,
}

impl Segment {
    pub fn new(duration: Second, source: impl Into<SourceLocation>, parent: Option<SegmentId>) -> Self {
        Self {
            id: SegmentId::new(),
            duration,
            source: source.into(),
            parent,
            created_at: Utc::now(),
            recorded_start: None,
        }
    }

    pub fn with_recorded_start(mut self, start: Second) -> Self {
        self.recorded_start = Some(start);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ms_frame_conversion() {
        assert_eq!(ms_to_frames(1000.0, SAMPLE_RATE), 44_100);
        assert_eq!(ms_to_frames(-5.0, SAMPLE_RATE), 0);
        assert_eq!(ms_to_frames(f64::NAN, SAMPLE_RATE), 0);
        assert_eq!(frames_to_ms(22_050, SAMPLE_RATE), 500.0);
        assert_eq!(Sample::from_millis(250.0, SAMPLE_RATE), Sample(11_025));
    }

    #[test]
    fn test_second_arithmetic() {
        assert_eq!(Second(1.5) + Second(0.5), Second(2.0));
        assert_eq!(Second(1.0) - Second(2.0), Second(0.0));
        assert_eq!(Second::from_millis(1500.0), Second(1.5));
        assert_eq!(Second(2.0).to_samples(SAMPLE_RATE), Sample(88_200));
    }

    #[test]
    fn test_source_location_paths() {
        assert_eq!(
            SourceLocation::from("file:///tmp/a.wav").as_path(),
            Some(Path::new("/tmp/a.wav"))
        );
        assert_eq!(
            SourceLocation::from("takes/a.wav").as_path(),
            Some(Path::new("takes/a.wav"))
        );
        assert_eq!(SourceLocation::from("https://host/a.wav").as_path(), None);
    }

    #[test]
    fn test_segment_id_roundtrip_through_string() {
        let id = SegmentId::new();
        let parsed: SegmentId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }
}
