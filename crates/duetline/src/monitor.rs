//! Position monitor
//!
//! A named thread that watches the shared clock while playing. It detects the
//! punch-in point, activates the recording session exactly once and tells the
//! caller when recording actually started. It also feeds optional UI
//! position callbacks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::SampleClock;
use crate::primitives::{frames_to_ms, Sample};
use crate::recording::{SessionShared, SessionStatus};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Callback fired once with the actual recording start (ms on the chain).
pub type RecordingStartedCallback = Box<dyn FnOnce(f64) + Send + 'static>;

/// Callback fired on every poll with the current position (ms).
pub type PositionCallback = Arc<dyn Fn(f64) + Send + Sync + 'static>;

/// Where punch-in activation happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PunchInTrigger {
    /// The monitor activates on the first poll at or past the target.
    Poll { interval: Duration },
    /// The render callback activates sample-accurately; the monitor only
    /// reports it.
    RenderCallback,
}

impl PunchInTrigger {
    pub fn interval(&self) -> Duration {
        match self {
            Self::Poll { interval } => *interval,
            Self::RenderCallback => DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn activates_in_render(&self) -> bool {
        matches!(self, Self::RenderCallback)
    }
}

impl Default for PunchInTrigger {
    fn default() -> Self {
        Self::Poll {
            interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl From<&duetconf::MonitorConfig> for PunchInTrigger {
    fn from(config: &duetconf::MonitorConfig) -> Self {
        match config.trigger {
            duetconf::TriggerMode::Poll => Self::Poll {
                interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            },
            duetconf::TriggerMode::Callback => Self::RenderCallback,
        }
    }
}

/// Read side of the transport, as the monitor sees it.
pub trait PositionSource: Send + Sync {
    fn position(&self) -> Sample;

    fn sample_rate(&self) -> u32;

    fn is_playing(&self) -> bool;

    fn position_ms(&self) -> f64 {
        frames_to_ms(self.position().0, self.sample_rate())
    }
}

impl PositionSource for SampleClock {
    fn position(&self) -> Sample {
        SampleClock::position(self)
    }

    fn sample_rate(&self) -> u32 {
        SampleClock::sample_rate(self)
    }

    fn is_playing(&self) -> bool {
        self.is_running()
    }

    fn position_ms(&self) -> f64 {
        SampleClock::position_ms(self)
    }
}

/// An armed session the monitor should watch.
pub struct PunchIn {
    pub session: Arc<SessionShared>,
    pub on_started: Option<RecordingStartedCallback>,
}

impl PunchIn {
    pub fn new(session: Arc<SessionShared>, on_started: RecordingStartedCallback) -> Self {
        Self {
            session,
            on_started: Some(on_started),
        }
    }

    fn notify(&mut self, actual_ms: f64) {
        if let Some(callback) = self.on_started.take() {
            callback(actual_ms);
        }
    }
}

/// What one poll decided about the punch-in.
enum PunchStep {
    Waiting,
    Done,
}

fn poll_punch_in(
    punch: &mut PunchIn,
    position: Sample,
    activate: bool,
    sample_rate: u32,
) -> PunchStep {
    let session = &punch.session;
    match session.status() {
        SessionStatus::Armed => {
            if !activate || position < session.target() {
                return PunchStep::Waiting;
            }
            if session.activate(position) {
                let actual_ms = frames_to_ms(position.0, sample_rate);
                info!(
                    actual_ms,
                    requested_ms = frames_to_ms(session.target().0, sample_rate),
                    "recording started"
                );
                punch.notify(actual_ms);
                PunchStep::Done
            } else {
                // lost to cancel or another activator; look again next poll
                PunchStep::Waiting
            }
        }
        SessionStatus::Recording | SessionStatus::Finalized => {
            if let Some(actual_ms) = session.actual_start_ms() {
                info!(actual_ms, "recording started");
                punch.notify(actual_ms);
            }
            PunchStep::Done
        }
        SessionStatus::Cancelled => {
            debug!("punch-in cancelled");
            PunchStep::Done
        }
    }
}

pub struct PositionMonitor {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PositionMonitor {
    pub fn spawn(
        trigger: PunchInTrigger,
        source: Arc<dyn PositionSource>,
        punch_in: Option<PunchIn>,
        on_position: Option<PositionCallback>,
    ) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let running_for_thread = Arc::clone(&running);
        let interval = trigger.interval();
        let activate = !trigger.activates_in_render();

        let handle = thread::Builder::new()
            .name("duet-monitor".to_string())
            .spawn(move || {
                let mut punch_in = punch_in;
                let sample_rate = source.sample_rate();

                while running_for_thread.load(Ordering::Acquire) {
                    if !source.is_playing() {
                        debug!("playback stopped, monitor exiting");
                        break;
                    }

                    let position = source.position();
                    if let Some(punch) = punch_in.as_mut() {
                        if let PunchStep::Done =
                            poll_punch_in(punch, position, activate, sample_rate)
                        {
                            punch_in = None;
                        }
                    }

                    match &on_position {
                        Some(callback) => callback(frames_to_ms(position.0, sample_rate)),
                        None if punch_in.is_none() => break,
                        None => {}
                    }

                    thread::sleep(interval);
                }

                // activated between the last poll and shutdown
                if let Some(mut punch) = punch_in {
                    if let Some(actual_ms) = punch.session.actual_start_ms() {
                        punch.notify(actual_ms);
                    }
                }
            })?;

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("position monitor panicked");
            }
        }
    }
}

impl Drop for PositionMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
