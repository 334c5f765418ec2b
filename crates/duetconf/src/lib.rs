//! Configuration loading for duetline.
//!
//! Sections:
//!
//! - `[paths]`: where segment metadata, stored objects and finished takes live.
//! - `[audio]`: device selection, stream format and recording bounds.
//! - `[monitor]`: position polling and the punch-in trigger strategy.
//! - `[calibration]`: transient threshold and the PCM converter.
//! - `[telemetry]`: log level.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/duetline/config.toml` (system)
//! 2. `~/.config/duetline/config.toml` (user)
//! 3. `./duetline.toml` (local override, replaced by `--config` when given)
//! 4. Environment variables (`DUETLINE_*`)
//!
//! Files are merged key by key, so a local file only needs the values it changes.
//!
//! # Example Config
//!
//! ```toml
//! [paths]
//! store_dir = "~/.local/share/duetline/store"
//! recordings_dir = "~/.local/share/duetline/takes"
//!
//! [audio]
//! device = "pipewire"
//! sample_rate = 44100
//! buffer_frames = 256
//! max_recording_secs = 600
//! playback = "overlapping"
//!
//! [monitor]
//! poll_interval_ms = 10
//! trigger = "poll"
//!
//! [calibration]
//! threshold_ratio = 0.6
//! converter = "ffmpeg"
//!
//! [telemetry]
//! log_level = "info"
//! ```

pub mod audio;
pub mod infra;
pub mod loader;

pub use audio::{
    AudioConfig, CalibrationConfig, ConverterKind, DeviceKind, MonitorConfig, PlaybackMode,
    TriggerMode,
};
pub use infra::{PathsConfig, TelemetryConfig};
pub use loader::{discover_config_files_with_override, ConfigSources};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete duetline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct DuetConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub calibration: CalibrationConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl DuetConfig {
    /// Load configuration from all sources.
    ///
    /// Load order (later wins):
    /// 1. Compiled defaults
    /// 2. `/etc/duetline/config.toml`
    /// 3. `~/.config/duetline/config.toml`
    /// 4. `./duetline.toml`
    /// 5. Environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration from a specific file path, then apply env overrides.
    ///
    /// If `config_path` is provided, it takes precedence over the local
    /// `./duetline.toml` override. System and user configs still load first.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let files = loader::discover_config_files_with_override(config_path);
        Self::load_files(&files)
    }

    /// Merge the given files in order, then apply environment overrides.
    pub fn load_files(files: &[PathBuf]) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in files {
            let table = loader::load_table(path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path.clone());
        }

        let origin = sources
            .files
            .last()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("<defaults>"));
        let mut config = loader::config_from_table(merged, &origin)?;

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> String {
        let body = toml::to_string_pretty(self).unwrap_or_default();
        format!("# duetline configuration\n\n{body}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DuetConfig::default();
        assert_eq!(config.audio.sample_rate, 44_100);
        assert_eq!(config.audio.max_recording_secs, 600);
        assert_eq!(config.monitor.poll_interval_ms, 10);
        assert_eq!(config.calibration.threshold_ratio, 0.6);
    }

    #[test]
    fn test_to_toml() {
        let config = DuetConfig::default();
        let toml = config.to_toml();
        assert!(toml.contains("[paths]"));
        assert!(toml.contains("[audio]"));
        assert!(toml.contains("[monitor]"));
        assert!(toml.contains("threshold_ratio"));
    }

    #[test]
    fn test_to_toml_parses_back() {
        let mut config = DuetConfig::default();
        config.audio.buffer_frames = 512;
        config.monitor.trigger = TriggerMode::Callback;

        let parsed: DuetConfig = toml::from_str(&config.to_toml()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_layered_files_merge_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let system = dir.path().join("system.toml");
        let local = dir.path().join("local.toml");
        std::fs::write(
            &system,
            "[audio]\nbuffer_frames = 1024\nmax_recording_secs = 120\n",
        )
        .unwrap();
        std::fs::write(&local, "[audio]\nbuffer_frames = 128\n").unwrap();

        let (config, sources) = DuetConfig::load_files(&[system, local.clone()]).unwrap();

        assert_eq!(config.audio.buffer_frames, 128);
        assert_eq!(config.audio.max_recording_secs, 120);
        assert_eq!(config.audio.sample_rate, 44_100);
        assert_eq!(sources.files.len(), 2);
        assert_eq!(sources.files[1], local);
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "[audio\nbuffer_frames = ").unwrap();

        let err = DuetConfig::load_files(&[bad.clone()]).unwrap_err();
        match err {
            ConfigError::Parse { path, .. } => assert_eq!(path, bad),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
