//! Audio engine, monitor and calibration settings.
//!
//! These seed the engine when it is constructed; nothing here is re-read
//! while a session is running.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which audio backend the engine opens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Paced software device, no hardware required.
    #[default]
    Virtual,
    /// PipeWire streams (needs the `pipewire` feature in duetline).
    Pipewire,
}

/// How loaded tracks are laid out on the shared clock.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackMode {
    #[default]
    Overlapping,
    Sequential,
}

/// Where the punch-in activation happens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    /// Position monitor thread observes the target.
    #[default]
    Poll,
    /// Render callback activates at the exact frame.
    Callback,
}

/// PCM conversion used by the calibrator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConverterKind {
    /// In-process WAV downmix; sources must already be WAV.
    #[default]
    Wav,
    /// External ffmpeg process, any input format.
    Ffmpeg,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioConfig {
    #[serde(default)]
    pub device: DeviceKind,

    /// Default: 44100
    #[serde(default = "AudioConfig::default_sample_rate")]
    pub sample_rate: u32,

    /// Output channel count. Default: 2
    #[serde(default = "AudioConfig::default_output_channels")]
    pub output_channels: u16,

    /// Frames per device callback. Default: 256
    #[serde(default = "AudioConfig::default_buffer_frames")]
    pub buffer_frames: usize,

    /// Hard bound on a single take. Default: 600 (10 minutes)
    #[serde(default = "AudioConfig::default_max_recording_secs")]
    pub max_recording_secs: u32,

    /// Output gain applied after mixing. Default: 1.0
    #[serde(default = "AudioConfig::default_master_gain")]
    pub master_gain: f32,

    #[serde(default)]
    pub playback: PlaybackMode,
}

impl AudioConfig {
    fn default_sample_rate() -> u32 {
        44_100
    }

    fn default_output_channels() -> u16 {
        2
    }

    fn default_buffer_frames() -> usize {
        256
    }

    fn default_max_recording_secs() -> u32 {
        600
    }

    fn default_master_gain() -> f32 {
        1.0
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: DeviceKind::default(),
            sample_rate: Self::default_sample_rate(),
            output_channels: Self::default_output_channels(),
            buffer_frames: Self::default_buffer_frames(),
            max_recording_secs: Self::default_max_recording_secs(),
            master_gain: Self::default_master_gain(),
            playback: PlaybackMode::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorConfig {
    /// Default: 10
    #[serde(default = "MonitorConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default)]
    pub trigger: TriggerMode,
}

impl MonitorConfig {
    fn default_poll_interval_ms() -> u64 {
        10
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: Self::default_poll_interval_ms(),
            trigger: TriggerMode::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CalibrationConfig {
    /// Fraction of the stream peak that counts as the transient. Default: 0.6
    #[serde(default = "CalibrationConfig::default_threshold_ratio")]
    pub threshold_ratio: f64,

    #[serde(default)]
    pub converter: ConverterKind,

    /// ffmpeg binary used by the `ffmpeg` converter. Default: ffmpeg (from PATH)
    #[serde(default = "CalibrationConfig::default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
}

impl CalibrationConfig {
    fn default_threshold_ratio() -> f64 {
        0.6
    }

    fn default_ffmpeg_path() -> PathBuf {
        PathBuf::from("ffmpeg")
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            threshold_ratio: Self::default_threshold_ratio(),
            converter: ConverterKind::default(),
            ffmpeg_path: Self::default_ffmpeg_path(),
        }
    }
}
