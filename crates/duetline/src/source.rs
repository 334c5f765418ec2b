//! Segment audio sources
//!
//! Resolves a [`SourceLocation`] to bytes and decodes them into mono f32
//! ready for the mixer. WAV goes through hound; MP3/FLAC go through
//! symphonia when the `symphonia-decode` feature is enabled.
//!
//! Decoding happens on `load_tracks`, never on the render thread.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Context, Result};
use thiserror::Error;

use crate::primitives::SourceLocation;
use crate::storage::{ObjectStore, StorageKey};

/// Why a track could not be bound to the engine.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("could not resolve {location}: {reason}")]
    Resolve { location: String, reason: String },

    #[error("could not decode {location}: {reason}")]
    Decode { location: String, reason: String },

    #[error("{location} is {found} Hz, engine runs at {expected} Hz")]
    SampleRate {
        location: String,
        found: u32,
        expected: u32,
    },

    #[error("{0} contains no audio")]
    Empty(String),
}

/// Decoded audio ready for playback
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    /// Interleaved samples (L, R, L, R, ...)
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Number of channels (1 = mono, 2 = stereo)
    pub channels: u8,
}

impl DecodedAudio {
    /// Total number of frames (samples per channel)
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }

    pub fn duration_seconds(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Average all channels down to one.
    pub fn into_mono(self) -> Vec<f32> {
        let channels = self.channels.max(1) as usize;
        if channels == 1 {
            return self.samples;
        }
        self.samples
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    }
}

/// How to fetch the bytes behind a source location
pub trait SourceResolver: Send + Sync {
    fn resolve(&self, location: &SourceLocation) -> Result<Vec<u8>>;
}

/// Plain filesystem paths and `file://` URIs, optionally relative to a base.
#[derive(Debug, Clone, Default)]
pub struct FileResolver {
    base_path: Option<PathBuf>,
}

impl FileResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: Some(base_path.into()),
        }
    }
}

impl SourceResolver for FileResolver {
    fn resolve(&self, location: &SourceLocation) -> Result<Vec<u8>> {
        let path = location
            .as_path()
            .ok_or_else(|| anyhow!("not a local path: {}", location))?;
        let path = match &self.base_path {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        };
        std::fs::read(&path).with_context(|| format!("read failed: {}", path.display()))
    }
}

/// In-memory resolver for testing
#[derive(Default)]
pub struct MemoryResolver {
    content: RwLock<HashMap<SourceLocation, Arc<Vec<u8>>>>,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, location: impl Into<SourceLocation>, data: Vec<u8>) {
        if let Ok(mut content) = self.content.write() {
            content.insert(location.into(), Arc::new(data));
        }
    }
}

impl SourceResolver for MemoryResolver {
    fn resolve(&self, location: &SourceLocation) -> Result<Vec<u8>> {
        let content = self
            .content
            .read()
            .map_err(|_| anyhow!("memory resolver lock poisoned"))?;
        content
            .get(location)
            .map(|data| data.as_ref().clone())
            .ok_or_else(|| anyhow!("content not found: {}", location))
    }
}

/// Treats locations as object store keys and reads through a readable location.
pub struct StoreResolver {
    store: Arc<dyn ObjectStore>,
}

impl StoreResolver {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

impl SourceResolver for StoreResolver {
    fn resolve(&self, location: &SourceLocation) -> Result<Vec<u8>> {
        let key = StorageKey::new(location.as_str());
        let readable = self
            .store
            .resolve_readable_location(&key)
            .with_context(|| format!("no readable location for {key}"))?;
        let path = readable
            .local_path()
            .ok_or_else(|| anyhow!("unsupported location scheme: {}", readable.uri))?;
        std::fs::read(&path).with_context(|| format!("read failed: {}", path.display()))
    }
}

/// Decode WAV audio using hound (always available)
pub fn decode_wav(data: &[u8]) -> Result<DecodedAudio> {
    let reader = hound::WavReader::new(Cursor::new(data)).context("failed to parse WAV header")?;

    let spec = reader.spec();
    let channels = spec.channels as u8;
    let sample_rate = spec.sample_rate;

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .context("failed to read float samples")?,
        hound::SampleFormat::Int => {
            let bits = spec.bits_per_sample;
            let max_val = (1u32 << (bits - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<Result<Vec<_>, _>>()
                .context("failed to read int samples")?
        }
    };

    Ok(DecodedAudio {
        samples,
        sample_rate,
        channels,
    })
}

/// Decode audio using symphonia (MP3, FLAC, OGG, etc.)
#[cfg(feature = "symphonia-decode")]
pub fn decode_audio_symphonia(data: &[u8]) -> Result<DecodedAudio> {
    use symphonia::core::audio::SampleBuffer;
    use symphonia::core::codecs::DecoderOptions;
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;

    let cursor = Cursor::new(data.to_vec());
    let mss = MediaSourceStream::new(Box::new(cursor), Default::default());

    let probed = symphonia::default::get_probe()
        .format(
            &Hint::new(),
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .context("failed to probe audio format")?;

    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| anyhow!("no audio track found"))?;

    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| anyhow!("no sample rate"))?;
    let channels = track
        .codec_params
        .channels
        .map(|c| c.count() as u8)
        .unwrap_or(1);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .context("failed to create decoder")?;

    let track_id = track.id;
    let mut samples: Vec<f32> = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(symphonia::core::errors::Error::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => return Err(e).context("failed to read packet"),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = decoder.decode(&packet).context("failed to decode packet")?;
        let spec = *decoded.spec();
        let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        sample_buf.copy_interleaved_ref(decoded);
        samples.extend(sample_buf.samples());
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
        channels,
    })
}

/// Decode audio from raw bytes
///
/// Tries WAV first (hound), then symphonia formats if feature is enabled.
pub fn decode_audio(data: &[u8]) -> Result<DecodedAudio> {
    if data.len() >= 4 && &data[0..4] == b"RIFF" {
        return decode_wav(data);
    }

    #[cfg(feature = "symphonia-decode")]
    {
        return decode_audio_symphonia(data);
    }

    #[cfg(not(feature = "symphonia-decode"))]
    {
        Err(anyhow!(
            "unsupported audio format (enable symphonia-decode feature for MP3/FLAC)"
        ))
    }
}

/// Resolve, decode and downmix one source for the engine.
pub fn load_mono(
    resolver: &dyn SourceResolver,
    location: &SourceLocation,
    expected_rate: u32,
) -> Result<Arc<[f32]>, SourceError> {
    let data = resolver
        .resolve(location)
        .map_err(|e| SourceError::Resolve {
            location: location.to_string(),
            reason: format!("{e:#}"),
        })?;

    let decoded = decode_audio(&data).map_err(|e| SourceError::Decode {
        location: location.to_string(),
        reason: format!("{e:#}"),
    })?;

    if decoded.sample_rate != expected_rate {
        return Err(SourceError::SampleRate {
            location: location.to_string(),
            found: decoded.sample_rate,
            expected: expected_rate,
        });
    }

    tracing::debug!(
        source = %location,
        frames = decoded.frames(),
        channels = decoded.channels,
        "source decoded"
    );

    let mono = decoded.into_mono();
    if mono.is_empty() {
        return Err(SourceError::Empty(location.to_string()));
    }
    Ok(mono.into())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::primitives::SAMPLE_RATE;

    /// Mono 16-bit WAV bytes.
    pub(crate) fn wav_bytes(samples: &[i16], sample_rate: u32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for &s in samples {
                writer.write_sample(s).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    fn stereo_float_wav(frames: &[(f32, f32)]) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for &(l, r) in frames {
                writer.write_sample(l).unwrap();
                writer.write_sample(r).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn test_decode_wav_int16_normalizes() {
        let decoded = decode_wav(&wav_bytes(&[16384, -32768, 0], SAMPLE_RATE)).unwrap();
        assert_eq!(decoded.channels, 1);
        assert_eq!(decoded.sample_rate, SAMPLE_RATE);
        assert_eq!(decoded.samples, vec![0.5, -1.0, 0.0]);
    }

    #[test]
    fn test_into_mono_averages_channels() {
        let decoded = decode_wav(&stereo_float_wav(&[(1.0, 0.0), (0.5, 0.5)])).unwrap();
        assert_eq!(decoded.frames(), 2);
        assert_eq!(decoded.into_mono(), vec![0.5, 0.5]);
    }

    #[test]
    fn test_decode_audio_rejects_unknown_bytes() {
        assert!(decode_audio(b"definitely not audio").is_err());
    }

    #[test]
    fn test_load_mono_from_memory() {
        let resolver = MemoryResolver::new();
        resolver.insert("a", wav_bytes(&[1000; 64], SAMPLE_RATE));

        let mono = load_mono(&resolver, &"a".into(), SAMPLE_RATE).unwrap();
        assert_eq!(mono.len(), 64);
    }

    #[test]
    fn test_load_mono_missing_source() {
        let resolver = MemoryResolver::new();
        let err = load_mono(&resolver, &"missing".into(), SAMPLE_RATE).unwrap_err();
        assert!(matches!(err, SourceError::Resolve { .. }));
    }

    #[test]
    fn test_load_mono_rejects_other_rates() {
        let resolver = MemoryResolver::new();
        resolver.insert("a", wav_bytes(&[1000; 64], 48_000));
        let err = load_mono(&resolver, &"a".into(), SAMPLE_RATE).unwrap_err();
        assert!(matches!(
            err,
            SourceError::SampleRate {
                found: 48_000,
                expected: 44_100,
                ..
            }
        ));
    }

    #[test]
    fn test_file_resolver_with_base() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("take.wav"), wav_bytes(&[5; 8], SAMPLE_RATE)).unwrap();

        let resolver = FileResolver::with_base(dir.path());
        let bytes = resolver.resolve(&"take.wav".into()).unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");
    }
}
