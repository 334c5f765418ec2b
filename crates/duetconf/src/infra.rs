//! Filesystem and telemetry configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Filesystem paths for duetline state and data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    /// Object store root (segment audio, calibration recordings).
    /// Default: ~/.local/share/duetline/store
    #[serde(default = "PathsConfig::default_store_dir")]
    pub store_dir: PathBuf,

    /// Where finalized takes are written before they are committed.
    /// Default: ~/.local/share/duetline/takes
    #[serde(default = "PathsConfig::default_recordings_dir")]
    pub recordings_dir: PathBuf,

    /// Segment metadata file.
    /// Default: ~/.local/share/duetline/segments.json
    #[serde(default = "PathsConfig::default_segments_file")]
    pub segments_file: PathBuf,
}

impl PathsConfig {
    fn data_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".local/share/duetline"))
            .unwrap_or_else(|| PathBuf::from(".local/share/duetline"))
    }

    fn default_store_dir() -> PathBuf {
        Self::data_dir().join("store")
    }

    fn default_recordings_dir() -> PathBuf {
        Self::data_dir().join("takes")
    }

    fn default_segments_file() -> PathBuf {
        Self::data_dir().join("segments.json")
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            store_dir: Self::default_store_dir(),
            recordings_dir: Self::default_recordings_dir(),
            segments_file: Self::default_segments_file(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryConfig {
    /// Log filter directive, `RUST_LOG` syntax.
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}
