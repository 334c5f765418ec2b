//! Audio device abstraction
//!
//! The engine renders and captures through an [`AudioDevice`]. A device owns
//! one output stream (interleaved f32) and one mono capture stream (i16) and
//! calls back into the engine from its own threads:
//!
//! ```text
//! device output thread ──► RenderCallback(&mut [f32])   mixer + clock
//! device input thread  ──► CaptureCallback(&[i16])      recording tap
//! ```
//!
//! Callbacks run on real-time threads: they must not block, allocate or log.
//!
//! Backends:
//! - [`VirtualDevice`]: paced software threads, no hardware needed
//! - [`ManualDevice`]: driven block by block from a [`ManualDriver`]
//! - `PipeWireDevice`: real streams, behind the `pipewire` feature

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use portable_atomic::AtomicF32;

mod manual;
#[cfg(feature = "pipewire")]
mod pipewire_device;
mod virtual_device;

pub use manual::{ManualDevice, ManualDriver};
#[cfg(feature = "pipewire")]
pub use pipewire_device::PipeWireDevice;
pub use virtual_device::VirtualDevice;

/// Fills one block of interleaved output.
pub type RenderCallback = Box<dyn FnMut(&mut [f32]) + Send + 'static>;

/// Receives one block of mono input.
pub type CaptureCallback = Box<dyn FnMut(&[i16]) + Send + 'static>;

/// Stream format requested when the session opens.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub name: String,
    pub sample_rate: u32,
    pub output_channels: u16,
    /// Frames per callback
    pub buffer_frames: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: "duetline".to_string(),
            sample_rate: crate::primitives::SAMPLE_RATE,
            output_channels: 2,
            buffer_frames: 256,
        }
    }
}

impl StreamConfig {
    pub fn latency_ms(&self) -> f64 {
        self.buffer_frames as f64 / self.sample_rate as f64 * 1000.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("audio device unavailable: {0}")]
    Unavailable(String),

    #[error("audio session is not open")]
    NotOpen,

    #[error("failed to spawn audio thread: {0}")]
    ThreadSpawn(String),

    #[error("stream error: {0}")]
    Stream(String),
}

/// Counters updated from the device callbacks.
#[derive(Debug, Default)]
pub struct DeviceStats {
    pub output_callbacks: AtomicU64,
    pub input_callbacks: AtomicU64,
    pub frames_rendered: AtomicU64,
    pub frames_captured: AtomicU64,
    /// Absolute peak of the most recent output block
    pub output_peak: AtomicF32,
}

impl DeviceStats {
    #[inline]
    pub(crate) fn record_output(&self, block: &[f32], channels: usize) {
        self.output_callbacks.fetch_add(1, Ordering::Relaxed);
        self.frames_rendered
            .fetch_add((block.len() / channels.max(1)) as u64, Ordering::Relaxed);
        let peak = block.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
        self.output_peak.store(peak, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_input(&self, frames: usize) {
        self.input_callbacks.fetch_add(1, Ordering::Relaxed);
        self.frames_captured.fetch_add(frames as u64, Ordering::Relaxed);
    }
}

/// One duplex audio session.
pub trait AudioDevice: Send {
    fn name(&self) -> &str;

    /// Whether this backend talks to shared hardware. Only one engine per
    /// process may hold an exclusive device open.
    fn is_exclusive(&self) -> bool {
        true
    }

    fn open(&mut self, config: &StreamConfig) -> Result<(), DeviceError>;

    fn is_open(&self) -> bool;

    fn start_output(&mut self, render: RenderCallback) -> Result<(), DeviceError>;

    /// Stop rendering. The render callback is dropped before this returns.
    fn stop_output(&mut self);

    fn start_input(&mut self, capture: CaptureCallback) -> Result<(), DeviceError>;

    /// Stop capturing. The capture callback is dropped before this returns.
    fn stop_input(&mut self);

    fn close(&mut self);

    fn stats(&self) -> Arc<DeviceStats>;
}

static SESSION_HELD: AtomicBool = AtomicBool::new(false);

/// Process-wide claim on the exclusive audio session.
#[derive(Debug)]
pub struct SessionLease {
    _private: (),
}

impl SessionLease {
    /// `None` while another lease is alive.
    pub fn acquire() -> Option<Self> {
        SESSION_HELD
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { _private: () })
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        SESSION_HELD.store(false, Ordering::Release);
    }
}

/// Synthetic microphone input for the software devices.
#[derive(Debug, Clone, Default)]
pub enum InputSignal {
    #[default]
    Silence,
    /// Played once from the start of capture, then silence.
    Samples(Arc<[i16]>),
    /// Continuous sine.
    Tone { frequency: f32, amplitude: i16 },
}

/// Stateful reader over an [`InputSignal`].
#[derive(Debug, Clone)]
pub struct SignalGenerator {
    signal: InputSignal,
    sample_rate: u32,
    cursor: u64,
}

impl SignalGenerator {
    pub fn new(signal: InputSignal, sample_rate: u32) -> Self {
        Self {
            signal,
            sample_rate,
            cursor: 0,
        }
    }

    pub fn fill(&mut self, out: &mut [i16]) {
        match &self.signal {
            InputSignal::Silence => out.fill(0),
            InputSignal::Samples(samples) => {
                let start = (self.cursor as usize).min(samples.len());
                let n = (samples.len() - start).min(out.len());
                out[..n].copy_from_slice(&samples[start..start + n]);
                out[n..].fill(0);
            }
            InputSignal::Tone {
                frequency,
                amplitude,
            } => {
                let step = std::f64::consts::TAU * *frequency as f64 / self.sample_rate as f64;
                for (i, sample) in out.iter_mut().enumerate() {
                    let phase = (self.cursor + i as u64) as f64 * step;
                    *sample = (phase.sin() * *amplitude as f64) as i16;
                }
            }
        }
        self.cursor += out.len() as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_lease_is_exclusive() {
        let first = SessionLease::acquire().expect("first lease");
        assert!(SessionLease::acquire().is_none());
        drop(first);
        assert!(SessionLease::acquire().is_some());
    }

    #[test]
    fn test_samples_signal_plays_once() {
        let mut generator = SignalGenerator::new(InputSignal::Samples(Arc::from(vec![1i16, 2, 3])), 44_100);
        let mut block = [9i16; 2];
        generator.fill(&mut block);
        assert_eq!(block, [1, 2]);
        generator.fill(&mut block);
        assert_eq!(block, [3, 0]);
        generator.fill(&mut block);
        assert_eq!(block, [0, 0]);
    }

    #[test]
    fn test_tone_signal_is_bounded() {
        let mut generator = SignalGenerator::new(
            InputSignal::Tone {
                frequency: 440.0,
                amplitude: 1000,
            },
            44_100,
        );
        let mut block = [0i16; 512];
        generator.fill(&mut block);
        assert!(block.iter().all(|s| s.abs() <= 1000));
        assert!(block.iter().any(|s| s.abs() > 900));
    }

    #[test]
    fn test_stats_record_output_peak() {
        let stats = DeviceStats::default();
        stats.record_output(&[0.1, -0.7, 0.3, 0.2], 2);
        assert_eq!(stats.frames_rendered.load(Ordering::Relaxed), 2);
        assert_eq!(stats.output_peak.load(Ordering::Relaxed), 0.7);
    }
}
