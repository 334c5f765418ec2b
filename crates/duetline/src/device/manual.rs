//! Device driven explicitly, one block at a time.
//!
//! Nothing runs on its own: a [`ManualDriver`] calls the installed render and
//! capture callbacks when told to. Used for offline rendering and for tests
//! that need exact control over when the clock advances.

use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    AudioDevice, CaptureCallback, DeviceError, DeviceStats, InputSignal, RenderCallback,
    SignalGenerator, StreamConfig,
};

#[derive(Default)]
struct ManualState {
    config: Option<StreamConfig>,
    render: Option<RenderCallback>,
    capture: Option<CaptureCallback>,
    input: Option<SignalGenerator>,
    pending_signal: InputSignal,
    fail_open: Option<String>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<ManualState>,
    stats: Arc<DeviceStats>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ManualState> {
        // a panicking test callback must not wedge every later call
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct ManualDevice {
    shared: Arc<Shared>,
}

/// Test-side handle of a [`ManualDevice`].
#[derive(Clone)]
pub struct ManualDriver {
    shared: Arc<Shared>,
}

impl ManualDevice {
    pub fn new() -> (Self, ManualDriver) {
        let shared = Arc::new(Shared::default());
        (
            Self {
                shared: Arc::clone(&shared),
            },
            ManualDriver { shared },
        )
    }
}

impl AudioDevice for ManualDevice {
    fn name(&self) -> &str {
        "manual"
    }

    fn is_exclusive(&self) -> bool {
        false
    }

    fn open(&mut self, config: &StreamConfig) -> Result<(), DeviceError> {
        let mut state = self.shared.lock();
        if let Some(reason) = &state.fail_open {
            return Err(DeviceError::Unavailable(reason.clone()));
        }
        state.config = Some(config.clone());
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.shared.lock().config.is_some()
    }

    fn start_output(&mut self, render: RenderCallback) -> Result<(), DeviceError> {
        let mut state = self.shared.lock();
        if state.config.is_none() {
            return Err(DeviceError::NotOpen);
        }
        state.render = Some(render);
        Ok(())
    }

    fn stop_output(&mut self) {
        let render = self.shared.lock().render.take();
        drop(render);
    }

    fn start_input(&mut self, capture: CaptureCallback) -> Result<(), DeviceError> {
        let mut state = self.shared.lock();
        let rate = state
            .config
            .as_ref()
            .map(|c| c.sample_rate)
            .ok_or(DeviceError::NotOpen)?;
        state.input = Some(SignalGenerator::new(state.pending_signal.clone(), rate));
        state.capture = Some(capture);
        Ok(())
    }

    fn stop_input(&mut self) {
        let capture = {
            let mut state = self.shared.lock();
            state.input = None;
            state.capture.take()
        };
        drop(capture);
    }

    fn close(&mut self) {
        self.stop_output();
        self.stop_input();
        self.shared.lock().config = None;
    }

    fn stats(&self) -> Arc<DeviceStats> {
        Arc::clone(&self.shared.stats)
    }
}

impl ManualDriver {
    /// Make the next `open` fail as if the hardware were missing.
    pub fn fail_open(&self, reason: impl Into<String>) {
        self.shared.lock().fail_open = Some(reason.into());
    }

    /// Signal fed to capture by [`pump`](Self::pump), from the next `start_input`.
    pub fn set_input(&self, signal: InputSignal) {
        self.shared.lock().pending_signal = signal;
    }

    pub fn output_running(&self) -> bool {
        self.shared.lock().render.is_some()
    }

    pub fn input_running(&self) -> bool {
        self.shared.lock().capture.is_some()
    }

    /// Render `frames` frames. Returns the interleaved block, or `None` when
    /// output is stopped.
    pub fn render(&self, frames: usize) -> Option<Vec<f32>> {
        let mut state = self.shared.lock();
        let channels = state.config.as_ref()?.output_channels as usize;
        let render = state.render.as_mut()?;
        let mut block = vec![0.0f32; frames * channels];
        render(&mut block);
        self.shared.stats.record_output(&block, channels);
        Some(block)
    }

    /// Deliver `samples` to the capture callback. Returns false when input
    /// is stopped.
    pub fn capture(&self, samples: &[i16]) -> bool {
        let mut state = self.shared.lock();
        let Some(capture) = state.capture.as_mut() else {
            return false;
        };
        capture(samples);
        self.shared.stats.record_input(samples.len());
        true
    }

    /// One duplex cycle: render `frames`, then capture `frames` samples of
    /// the configured input signal.
    pub fn pump(&self, frames: usize) -> Option<Vec<f32>> {
        let output = self.render(frames);

        let mut guard = self.shared.lock();
        let state = &mut *guard;
        if let Some(generator) = state.input.as_mut() {
            let mut block = vec![0i16; frames];
            generator.fill(&mut block);
            if let Some(capture) = state.capture.as_mut() {
                capture(&block);
                self.shared.stats.record_input(frames);
            }
        }

        output
    }

    /// Pump in `block`-sized steps until `frames` have been rendered.
    pub fn run(&self, frames: usize, block: usize) -> Vec<f32> {
        let mut out = Vec::new();
        let mut remaining = frames;
        while remaining > 0 {
            let n = remaining.min(block.max(1));
            if let Some(rendered) = self.pump(n) {
                out.extend(rendered);
            }
            remaining -= n;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_open() {
        let (mut device, driver) = ManualDevice::new();
        driver.fail_open("no microphone permission");
        let err = device.open(&StreamConfig::default()).unwrap_err();
        assert!(matches!(err, DeviceError::Unavailable(reason) if reason.contains("permission")));
    }

    #[test]
    fn test_render_only_while_started() {
        let (mut device, driver) = ManualDevice::new();
        device.open(&StreamConfig::default()).unwrap();
        assert!(driver.render(4).is_none());

        device.start_output(Box::new(|out| out.fill(0.5))).unwrap();
        let block = driver.render(4).unwrap();
        assert_eq!(block.len(), 8);
        assert!(block.iter().all(|s| *s == 0.5));

        device.stop_output();
        assert!(!driver.output_running());
        assert!(driver.render(4).is_none());
    }

    #[test]
    fn test_pump_feeds_input_signal() {
        let (mut device, driver) = ManualDevice::new();
        driver.set_input(InputSignal::Samples(Arc::from(vec![3i16; 10])));
        device.open(&StreamConfig::default()).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        device
            .start_input(Box::new(move |input| {
                sink.lock().unwrap().extend_from_slice(input);
            }))
            .unwrap();

        driver.pump(6);
        driver.pump(6);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 12);
        assert_eq!(&seen[..10], &[3; 10]);
        assert_eq!(&seen[10..], &[0, 0]);
    }
}
