//! Round-trip latency calibration
//!
//! A reference click and its re-recording are converted to mono 16-bit PCM,
//! the first transient of each is located, and the offset between the two
//! is the device's round-trip latency.
//!
//! Intermediate files live in a temporary directory that is removed when
//! the measurement returns, successfully or not.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::primitives::{RECORDING_BITS, RECORDING_CHANNELS, SAMPLE_RATE};
use crate::recording::write_wav;
use crate::storage::{ObjectStore, StorageError, StorageKey};
use crate::transient::{detect_transient, Transient, DEFAULT_THRESHOLD_RATIO};

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("sample rates differ: reference {reference} Hz, test {test} Hz")]
    SampleRateMismatch { reference: u32, test: u32 },

    #[error("unsupported PCM format in {path}: {reason}")]
    UnsupportedFormat { path: PathBuf, reason: String },

    #[error("no local file for {0}")]
    NotLocal(String),

    #[error("failed to convert {path}: {reason}")]
    Convert { path: PathBuf, reason: String },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wav(#[from] hound::Error),
}

/// Mono 16-bit PCM ready for analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl PcmBuffer {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Read a WAV that must already be mono 16-bit integer PCM.
    pub fn read_wav(path: &Path) -> Result<Self, CalibrationError> {
        let reader = hound::WavReader::open(path)?;
        let spec = reader.spec();
        if spec.channels != RECORDING_CHANNELS
            || spec.bits_per_sample != RECORDING_BITS
            || spec.sample_format != hound::SampleFormat::Int
        {
            return Err(CalibrationError::UnsupportedFormat {
                path: path.to_path_buf(),
                reason: format!(
                    "{} ch, {} bit {:?}",
                    spec.channels, spec.bits_per_sample, spec.sample_format
                ),
            });
        }

        let samples = reader.into_samples::<i16>().collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(samples, spec.sample_rate))
    }

    pub fn duration_ms(&self) -> f64 {
        self.samples.len() as f64 * 1000.0 / self.sample_rate as f64
    }
}

/// Turns an arbitrary audio file into a mono 16-bit WAV.
pub trait PcmConverter: Send + Sync {
    fn name(&self) -> &str;

    fn convert(&self, input: &Path, output: &Path) -> Result<()>;
}

/// In-process conversion of WAV input: downmix to mono, requantize to
/// 16 bit, keep the sample rate.
#[derive(Debug, Clone, Copy, Default)]
pub struct WavConverter;

impl PcmConverter for WavConverter {
    fn name(&self) -> &str {
        "wav"
    }

    fn convert(&self, input: &Path, output: &Path) -> Result<()> {
        let reader = hound::WavReader::open(input)
            .with_context(|| format!("failed to open {}", input.display()))?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<Result<Vec<f32>, _>>()
                .context("failed to read float samples")?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<Vec<f32>, _>>()
                    .context("failed to read integer samples")?
            }
        };

        let mono: Vec<i16> = interleaved
            .chunks(channels)
            .map(|frame| {
                let mean = frame.iter().sum::<f32>() / frame.len() as f32;
                (mean.clamp(-1.0, 1.0) * 32767.0).round() as i16
            })
            .collect();

        write_wav(output, &mono, spec.sample_rate)
            .with_context(|| format!("failed to write {}", output.display()))?;
        Ok(())
    }
}

/// Conversion through an external `ffmpeg`, resampling to 44.1 kHz.
#[derive(Debug, Clone)]
pub struct FfmpegConverter {
    binary: PathBuf,
}

impl FfmpegConverter {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for FfmpegConverter {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl PcmConverter for FfmpegConverter {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    fn convert(&self, input: &Path, output: &Path) -> Result<()> {
        let result = Command::new(&self.binary)
            .args(["-y", "-nostdin", "-loglevel", "error", "-i"])
            .arg(input)
            .args(["-ac", "1", "-ar"])
            .arg(SAMPLE_RATE.to_string())
            .args(["-c:a", "pcm_s16le"])
            .arg(output)
            .output();

        let out = match result {
            Ok(out) => out,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                bail!("{} not found on PATH", self.binary.display())
            }
            Err(e) => return Err(e).context("failed to run ffmpeg"),
        };

        if !out.status.success() {
            bail!(
                "ffmpeg exited with {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Converter selected by `[calibration] converter`.
pub fn converter_for(config: &duetconf::CalibrationConfig) -> Box<dyn PcmConverter> {
    match config.converter {
        duetconf::ConverterKind::Wav => Box::new(WavConverter),
        duetconf::ConverterKind::Ffmpeg => Box::new(FfmpegConverter::new(&config.ffmpeg_path)),
    }
}

/// Offset of `test`'s first transient after `reference`'s, in ms.
pub fn offset_ms(
    reference: &PcmBuffer,
    test: &PcmBuffer,
    threshold_ratio: f64,
) -> Result<f64, CalibrationError> {
    if reference.sample_rate != test.sample_rate {
        return Err(CalibrationError::SampleRateMismatch {
            reference: reference.sample_rate,
            test: test.sample_rate,
        });
    }

    let reference_onset = detect_transient(&reference.samples, threshold_ratio);
    let test_onset = detect_transient(&test.samples, threshold_ratio);
    Ok(onset_delta_ms(reference_onset, test_onset, reference.sample_rate))
}

fn onset_delta_ms(reference: Transient, test: Transient, sample_rate: u32) -> f64 {
    (test.index as f64 - reference.index as f64) / sample_rate as f64 * 1000.0
}

/// Full result of one measurement.
#[derive(Debug, Clone, Serialize)]
pub struct CalibrationReport {
    pub offset_ms: f64,
    pub sample_rate: u32,
    pub threshold_ratio: f64,
    pub reference: Transient,
    pub test: Transient,
}

pub struct Calibrator {
    store: Option<Arc<dyn ObjectStore>>,
    converter: Box<dyn PcmConverter>,
    threshold_ratio: f64,
    temp_root: Option<PathBuf>,
}

impl Calibrator {
    pub fn new(converter: Box<dyn PcmConverter>) -> Self {
        Self {
            store: None,
            converter,
            threshold_ratio: DEFAULT_THRESHOLD_RATIO,
            temp_root: None,
        }
    }

    pub fn from_config(config: &duetconf::CalibrationConfig) -> Self {
        Self::new(converter_for(config)).with_threshold_ratio(config.threshold_ratio)
    }

    /// Resolve keys through `store` for [`measure_offset_ms`](Self::measure_offset_ms).
    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_threshold_ratio(mut self, ratio: f64) -> Self {
        self.threshold_ratio = ratio;
        self
    }

    /// Create scratch directories under `dir` instead of the system temp dir.
    pub fn with_temp_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_root = Some(dir.into());
        self
    }

    /// Round-trip latency between two stored recordings, in ms.
    pub fn measure_offset_ms(
        &self,
        reference_key: &StorageKey,
        test_key: &StorageKey,
    ) -> Result<f64, CalibrationError> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| CalibrationError::NotLocal("no object store configured".into()))?;

        let reference = store.resolve_readable_location(reference_key)?;
        let test = store.resolve_readable_location(test_key)?;
        let reference_path = reference
            .local_path()
            .ok_or_else(|| CalibrationError::NotLocal(reference.uri.clone()))?;
        let test_path = test
            .local_path()
            .ok_or_else(|| CalibrationError::NotLocal(test.uri.clone()))?;

        let report = self.measure_files(&reference_path, &test_path)?;
        Ok(report.offset_ms)
    }

    pub fn measure_files(
        &self,
        reference_path: &Path,
        test_path: &Path,
    ) -> Result<CalibrationReport, CalibrationError> {
        let scratch = match &self.temp_root {
            Some(root) => tempfile::Builder::new()
                .prefix("duet-calibrate-")
                .tempdir_in(root)?,
            None => tempfile::Builder::new()
                .prefix("duet-calibrate-")
                .tempdir()?,
        };
        debug!(dir = %scratch.path().display(), converter = self.converter.name(), "calibration scratch");

        let reference = self.convert(reference_path, &scratch.path().join("reference.wav"))?;
        let test = self.convert(test_path, &scratch.path().join("test.wav"))?;

        let offset = offset_ms(&reference, &test, self.threshold_ratio)?;
        let report = CalibrationReport {
            offset_ms: offset,
            sample_rate: reference.sample_rate,
            threshold_ratio: self.threshold_ratio,
            reference: detect_transient(&reference.samples, self.threshold_ratio),
            test: detect_transient(&test.samples, self.threshold_ratio),
        };

        info!(
            offset_ms = report.offset_ms,
            reference_onset = report.reference.index,
            test_onset = report.test.index,
            "latency measured"
        );
        Ok(report)
    }

    fn convert(&self, input: &Path, output: &Path) -> Result<PcmBuffer, CalibrationError> {
        self.converter
            .convert(input, output)
            .map_err(|e| CalibrationError::Convert {
                path: input.to_path_buf(),
                reason: format!("{e:#}"),
            })?;
        PcmBuffer::read_wav(output)
    }
}
