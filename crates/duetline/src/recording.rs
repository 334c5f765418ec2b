//! Punch-in recording sessions
//!
//! A session is armed with a target frame and a hard capacity. The capture
//! callback owns the [`CaptureTap`] (ring producer); the engine keeps the
//! [`RecordingSession`] (ring consumer) and drains it once the take ends.
//!
//! ```text
//!            activate (CAS, once)           finalize
//!   Armed ─────────────────────────► Recording ─────► Finalized
//!     │                                  ▲
//!     └── cancel ──► Cancelled           └── capacity reached (tap)
//! ```
//!
//! Everything the tap touches is preallocated. Writes before activation and
//! past capacity are dropped.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use rtrb::{Consumer, Producer, RingBuffer};
use tracing::{debug, warn};

use crate::primitives::{frames_to_ms, Sample, SourceLocation, RECORDING_BITS, RECORDING_CHANNELS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionStatus {
    Armed = 0,
    Recording = 1,
    Finalized = 2,
    Cancelled = 3,
}

/// Transient state between winning activation and publishing the start.
const ACTIVATING: u8 = 4;

impl SessionStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 | ACTIVATING => Self::Armed,
            1 => Self::Recording,
            2 => Self::Finalized,
            _ => Self::Cancelled,
        }
    }
}

/// Session state shared between the engine, the monitor and the RT callbacks.
#[derive(Debug)]
pub struct SessionShared {
    status: AtomicU8,
    target: Sample,
    actual_start: AtomicU64,
    frames_written: AtomicU64,
    capacity: u64,
    capacity_reached: AtomicBool,
    sample_rate: u32,
}

impl SessionShared {
    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn target(&self) -> Sample {
        self.target
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Armed → Recording, stamping `at` as the actual start. Only the first
    /// caller wins.
    pub fn activate(&self, at: Sample) -> bool {
        let won = self
            .status
            .compare_exchange(
                SessionStatus::Armed as u8,
                ACTIVATING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if won {
            // start is visible before anyone can observe Recording
            self.actual_start.store(at.0, Ordering::Release);
            self.status
                .store(SessionStatus::Recording as u8, Ordering::Release);
        }
        won
    }

    /// Activation from the render callback: fires if the target falls
    /// inside the block `[position, position + frames)` or is already past.
    #[inline]
    pub fn activate_in_block(&self, position: Sample, frames: u64) -> bool {
        if self.status.load(Ordering::Acquire) != SessionStatus::Armed as u8 {
            return false;
        }
        if self.target.0 >= position.0 + frames {
            return false;
        }
        self.activate(Sample(position.0.max(self.target.0)))
    }

    /// Armed → Cancelled.
    pub fn cancel(&self) -> bool {
        self.status
            .compare_exchange(
                SessionStatus::Armed as u8,
                SessionStatus::Cancelled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Recording → Finalized. True when the session holds a finished take,
    /// whether this call or the capacity bound finalized it.
    pub fn finalize(&self) -> bool {
        match self.status.compare_exchange(
            SessionStatus::Recording as u8,
            SessionStatus::Finalized as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(current) => current == SessionStatus::Finalized as u8,
        }
    }

    /// Actual start frame, once activated.
    pub fn actual_start(&self) -> Option<Sample> {
        match self.status() {
            SessionStatus::Recording | SessionStatus::Finalized => {
                Some(Sample(self.actual_start.load(Ordering::Acquire)))
            }
            _ => None,
        }
    }

    pub fn actual_start_ms(&self) -> Option<f64> {
        self.actual_start()
            .map(|s| frames_to_ms(s.0, self.sample_rate))
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn capacity_reached(&self) -> bool {
        self.capacity_reached.load(Ordering::Acquire)
    }
}

/// Producer half, owned by the capture callback.
pub struct CaptureTap {
    shared: Arc<SessionShared>,
    producer: Producer<i16>,
}

impl CaptureTap {
    /// Append captured samples while the session is recording.
    ///
    /// RT-safe: no allocation, no locks. Returns the number of samples kept.
    #[inline]
    pub fn write(&mut self, input: &[i16]) -> usize {
        if self.shared.status.load(Ordering::Acquire) != SessionStatus::Recording as u8 {
            return 0;
        }

        let written = self.shared.frames_written.load(Ordering::Acquire);
        let remaining = self.shared.capacity.saturating_sub(written) as usize;
        let n = input.len().min(remaining).min(self.producer.slots());

        if n > 0 {
            if let Ok(chunk) = self.producer.write_chunk_uninit(n) {
                let stored = chunk.fill_from_iter(input[..n].iter().copied());
                self.shared
                    .frames_written
                    .fetch_add(stored as u64, Ordering::AcqRel);
            }
        }

        if self.shared.frames_written() >= self.shared.capacity {
            self.shared.capacity_reached.store(true, Ordering::Release);
            self.shared.finalize();
        }
        n
    }
}

/// Consumer half, owned by the engine.
pub struct RecordingSession {
    shared: Arc<SessionShared>,
    consumer: Consumer<i16>,
}

impl RecordingSession {
    /// Arm a session that starts at `target` and holds at most `capacity`
    /// mono frames.
    pub fn arm(target: Sample, capacity: u64, sample_rate: u32) -> (Self, CaptureTap) {
        let capacity = capacity.max(1);
        let (producer, consumer) = RingBuffer::new(capacity as usize);
        let shared = Arc::new(SessionShared {
            status: AtomicU8::new(SessionStatus::Armed as u8),
            target,
            actual_start: AtomicU64::new(0),
            frames_written: AtomicU64::new(0),
            capacity,
            capacity_reached: AtomicBool::new(false),
            sample_rate,
        });
        debug!(target_frame = target.0, capacity, "recording session armed");

        (
            Self {
                shared: Arc::clone(&shared),
                consumer,
            },
            CaptureTap { shared, producer },
        )
    }

    pub fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    /// Drain a finalized session. `None` unless the session was activated.
    pub fn finish(mut self) -> Option<CapturedAudio> {
        let start = self.shared.actual_start()?;
        let available = self.consumer.slots();
        let mut samples = Vec::with_capacity(available);
        if let Ok(chunk) = self.consumer.read_chunk(available) {
            let (first, second) = chunk.as_slices();
            samples.extend_from_slice(first);
            samples.extend_from_slice(second);
            chunk.commit_all();
        }

        let written = self.shared.frames_written() as usize;
        if samples.len() != written {
            warn!(
                drained = samples.len(),
                written, "capture ring and counter disagree"
            );
        }

        Some(CapturedAudio {
            samples,
            start,
            requested_start: self.shared.target,
            sample_rate: self.shared.sample_rate,
            truncated: self.shared.capacity_reached(),
        })
    }
}

/// Raw result of a finished session.
#[derive(Debug, Clone)]
pub struct CapturedAudio {
    pub samples: Vec<i16>,
    pub start: Sample,
    pub requested_start: Sample,
    pub sample_rate: u32,
    pub truncated: bool,
}

/// A finished take as handed back to callers.
#[derive(Debug, Clone)]
pub struct RecordedTake {
    /// WAV file the take was written to
    pub source: SourceLocation,
    /// Observed punch-in position on the chain (ms)
    pub start_time_ms: f64,
    pub requested_start_ms: f64,
    pub duration_ms: f64,
    /// True when the capacity bound cut the take short
    pub truncated: bool,
    pub sample_rate: u32,
    pub samples: Arc<[i16]>,
}

impl RecordedTake {
    pub fn from_captured(captured: CapturedAudio, source: SourceLocation) -> Self {
        let rate = captured.sample_rate;
        Self {
            source,
            start_time_ms: frames_to_ms(captured.start.0, rate),
            requested_start_ms: frames_to_ms(captured.requested_start.0, rate),
            duration_ms: frames_to_ms(captured.samples.len() as u64, rate),
            truncated: captured.truncated,
            sample_rate: rate,
            samples: captured.samples.into(),
        }
    }

    /// How late (positive) or early the take actually started.
    pub fn punch_in_drift_ms(&self) -> f64 {
        self.start_time_ms - self.requested_start_ms
    }

    pub fn duration_seconds(&self) -> f64 {
        self.duration_ms / 1000.0
    }
}

/// Write mono 16-bit PCM.
pub fn write_wav(path: &Path, samples: &[i16], sample_rate: u32) -> Result<(), hound::Error> {
    let spec = hound::WavSpec {
        channels: RECORDING_CHANNELS,
        sample_rate,
        bits_per_sample: RECORDING_BITS,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()
}
