//! Software device paced by the wall clock.
//!
//! Output and input each get a named thread that wakes once per block and
//! runs the callback, so the engine behaves as it would on hardware without
//! needing any. Rendered audio is discarded (only metered); input comes from
//! an [`InputSignal`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{
    AudioDevice, CaptureCallback, DeviceError, DeviceStats, InputSignal, RenderCallback,
    SignalGenerator, StreamConfig,
};

/// A thread that ticks once per block until stopped.
struct PacedThread {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PacedThread {
    fn spawn<F>(name: &str, block: Duration, mut tick: F) -> Result<Self, DeviceError>
    where
        F: FnMut() + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let running_for_thread = Arc::clone(&running);

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut deadline = Instant::now();
                while running_for_thread.load(Ordering::Acquire) {
                    tick();
                    deadline += block;
                    let now = Instant::now();
                    if deadline > now {
                        thread::sleep(deadline - now);
                    } else {
                        // fell behind, don't try to catch up with a burst
                        deadline = now;
                    }
                }
            })
            .map_err(|e| DeviceError::ThreadSpawn(e.to_string()))?;

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("virtual device thread panicked");
            }
        }
    }
}

impl Drop for PacedThread {
    fn drop(&mut self) {
        self.stop();
    }
}

pub struct VirtualDevice {
    config: Option<StreamConfig>,
    input_signal: InputSignal,
    output: Option<PacedThread>,
    input: Option<PacedThread>,
    stats: Arc<DeviceStats>,
}

impl VirtualDevice {
    pub fn new() -> Self {
        Self::with_input(InputSignal::Silence)
    }

    pub fn with_input(input_signal: InputSignal) -> Self {
        Self {
            config: None,
            input_signal,
            output: None,
            input: None,
            stats: Arc::new(DeviceStats::default()),
        }
    }

    fn block_duration(config: &StreamConfig) -> Duration {
        Duration::from_secs_f64(config.buffer_frames as f64 / config.sample_rate as f64)
    }

    fn config(&self) -> Result<&StreamConfig, DeviceError> {
        self.config.as_ref().ok_or(DeviceError::NotOpen)
    }
}

impl Default for VirtualDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioDevice for VirtualDevice {
    fn name(&self) -> &str {
        "virtual"
    }

    fn is_exclusive(&self) -> bool {
        false
    }

    fn open(&mut self, config: &StreamConfig) -> Result<(), DeviceError> {
        if config.sample_rate == 0 || config.buffer_frames == 0 || config.output_channels == 0 {
            return Err(DeviceError::Unavailable(format!(
                "unsupported stream format: {config:?}"
            )));
        }
        debug!(
            rate = config.sample_rate,
            frames = config.buffer_frames,
            latency_ms = config.latency_ms(),
            "virtual device opened"
        );
        self.config = Some(config.clone());
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.config.is_some()
    }

    fn start_output(&mut self, mut render: RenderCallback) -> Result<(), DeviceError> {
        self.stop_output();
        let config = self.config()?;
        let channels = config.output_channels as usize;
        let mut block = vec![0.0f32; config.buffer_frames * channels];
        let period = Self::block_duration(config);
        let stats = Arc::clone(&self.stats);

        let thread = PacedThread::spawn("virtual-output", period, move || {
            render(&mut block);
            stats.record_output(&block, channels);
        })?;
        self.output = Some(thread);
        Ok(())
    }

    fn stop_output(&mut self) {
        if let Some(mut thread) = self.output.take() {
            thread.stop();
        }
    }

    fn start_input(&mut self, mut capture: CaptureCallback) -> Result<(), DeviceError> {
        self.stop_input();
        let config = self.config()?;
        let mut block = vec![0i16; config.buffer_frames];
        let mut generator = SignalGenerator::new(self.input_signal.clone(), config.sample_rate);
        let period = Self::block_duration(config);
        let stats = Arc::clone(&self.stats);

        let thread = PacedThread::spawn("virtual-input", period, move || {
            generator.fill(&mut block);
            capture(&block);
            stats.record_input(block.len());
        })?;
        self.input = Some(thread);
        Ok(())
    }

    fn stop_input(&mut self) {
        if let Some(mut thread) = self.input.take() {
            thread.stop();
        }
    }

    fn close(&mut self) {
        self.stop_output();
        self.stop_input();
        self.config = None;
    }

    fn stats(&self) -> Arc<DeviceStats> {
        Arc::clone(&self.stats)
    }
}

impl Drop for VirtualDevice {
    fn drop(&mut self) {
        self.close();
    }
}
