//! Shared sample clock for transport position
//!
//! The render callback is the only writer while playing: it advances the
//! frame counter by the size of every block it renders. Everyone else reads
//! the counter, so "now" is whatever the audio device has actually consumed
//! rather than wall time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use portable_atomic::AtomicF64;

use crate::primitives::{frames_to_ms, ms_to_frames, Sample};

pub struct SampleClock {
    sample_rate: u32,

    /// Chain position of the next frame to render
    frames: AtomicU64,

    /// Position reported while stopped (the last play-from point, ms)
    parked_ms: AtomicF64,

    running: AtomicBool,
}

impl SampleClock {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            frames: AtomicU64::new(0),
            parked_ms: AtomicF64::new(0.0),
            running: AtomicBool::new(false),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Seek to `from_ms` and start running.
    pub fn start_at_ms(&self, from_ms: f64) -> Sample {
        let from = Sample(ms_to_frames(from_ms, self.sample_rate));
        self.parked_ms.store(from_ms.max(0.0), Ordering::Release);
        self.frames.store(from.0, Ordering::Release);
        self.running.store(true, Ordering::Release);
        from
    }

    /// Stop running; position falls back to the last start point.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Stop and forget the last start point.
    pub fn reset(&self) {
        self.running.store(false, Ordering::Release);
        self.frames.store(0, Ordering::Release);
        self.parked_ms.store(0.0, Ordering::Release);
    }

    /// Called from the render callback after each block.
    #[inline]
    pub fn advance(&self, frames: u64) {
        self.frames.fetch_add(frames, Ordering::AcqRel);
    }

    /// Frame counter, regardless of running state.
    #[inline]
    pub fn frames(&self) -> Sample {
        Sample(self.frames.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Current chain position, or the last start point when stopped.
    pub fn position(&self) -> Sample {
        if self.is_running() {
            self.frames()
        } else {
            Sample(ms_to_frames(self.parked_ms.load(Ordering::Acquire), self.sample_rate))
        }
    }

    pub fn position_ms(&self) -> f64 {
        if self.is_running() {
            frames_to_ms(self.frames().0, self.sample_rate)
        } else {
            self.parked_ms.load(Ordering::Acquire)
        }
    }
}
