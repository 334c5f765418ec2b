//! Synchronized playback and punch-in recording
//!
//! `DuetEngine` owns one audio device session. Every loaded track is
//! scheduled against the same [`SampleClock`], which only the render callback
//! advances, so playback position, punch-in activation and reported take
//! offsets all agree on one notion of "now".
//!
//! ```text
//! Idle ──load──► Loaded ──play──► Playing ──► Armed ──► Recording
//!   ▲                               │                     │
//!   └──────────── cleanup ◄──── Stopped ◄─────── stop ────┘
//! ```

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::SampleClock;
use crate::device::{AudioDevice, DeviceError, DeviceStats, SessionLease, StreamConfig};
use crate::mixer::{LoadedTrack, MasterBus, PlaybackStrategy, RenderPlan};
use crate::monitor::{PositionCallback, PositionMonitor, PunchIn, PunchInTrigger};
use crate::primitives::{frames_to_ms, Sample, SourceLocation, SAMPLE_RATE};
use crate::recording::{write_wav, RecordedTake, RecordingSession, SessionStatus};
use crate::source::{load_mono, SourceResolver};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("audio hardware unavailable: {0}")]
    HardwareUnavailable(String),

    #[error("no active recording")]
    NoActiveRecording,

    #[error("a recording is already active")]
    RecordingActive,

    #[error("failed to start position monitor: {0}")]
    Monitor(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wav(#[from] hound::Error),
}

impl From<DeviceError> for EngineError {
    fn from(err: DeviceError) -> Self {
        Self::HardwareUnavailable(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Loaded,
    Playing,
    Armed,
    Recording,
    Stopped,
}

/// A track to load: where its audio lives and where it starts on the chain.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackSpec {
    pub id: String,
    pub source: SourceLocation,
    pub start_time_ms: f64,
}

impl TrackSpec {
    pub fn new(id: impl Into<String>, source: impl Into<SourceLocation>, start_time_ms: f64) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            start_time_ms,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub sample_rate: u32,
    pub output_channels: u16,
    pub buffer_frames: usize,
    pub max_recording_secs: u32,
    pub master_gain: f32,
    pub playback: PlaybackStrategy,
    pub trigger: PunchInTrigger,
    pub recordings_dir: PathBuf,
}

impl EngineConfig {
    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            name: "duetline".to_string(),
            sample_rate: self.sample_rate,
            output_channels: self.output_channels,
            buffer_frames: self.buffer_frames,
        }
    }

    pub fn capacity_frames(&self) -> u64 {
        self.max_recording_secs as u64 * self.sample_rate as u64
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            output_channels: 2,
            buffer_frames: 256,
            max_recording_secs: 600,
            master_gain: 1.0,
            playback: PlaybackStrategy::Overlapping,
            trigger: PunchInTrigger::default(),
            recordings_dir: std::env::temp_dir().join("duetline-takes"),
        }
    }
}

impl From<&duetconf::DuetConfig> for EngineConfig {
    fn from(config: &duetconf::DuetConfig) -> Self {
        Self {
            sample_rate: config.audio.sample_rate,
            output_channels: config.audio.output_channels,
            buffer_frames: config.audio.buffer_frames,
            max_recording_secs: config.audio.max_recording_secs,
            master_gain: config.audio.master_gain,
            playback: config.audio.playback.into(),
            trigger: PunchInTrigger::from(&config.monitor),
            recordings_dir: config.paths.recordings_dir.clone(),
        }
    }
}

pub struct DuetEngine {
    config: EngineConfig,
    device: Box<dyn AudioDevice>,
    resolver: Arc<dyn SourceResolver>,
    clock: Arc<SampleClock>,
    master: MasterBus,
    tracks: Vec<LoadedTrack>,
    session: Option<RecordingSession>,
    monitor: Option<PositionMonitor>,
    position_listener: Option<PositionCallback>,
    lease: Option<SessionLease>,
    playing: bool,
    stopped: bool,
}

impl DuetEngine {
    pub fn new(
        config: EngineConfig,
        device: Box<dyn AudioDevice>,
        resolver: Arc<dyn SourceResolver>,
    ) -> Self {
        let clock = Arc::new(SampleClock::new(config.sample_rate));
        let master = MasterBus::new(config.master_gain);
        Self {
            config,
            device,
            resolver,
            clock,
            master,
            tracks: Vec::new(),
            session: None,
            monitor: None,
            position_listener: None,
            lease: None,
            playing: false,
            stopped: false,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        match self.session.as_ref().map(|s| s.status()) {
            Some(SessionStatus::Recording) => return EngineState::Recording,
            Some(SessionStatus::Armed) if self.playing => return EngineState::Armed,
            _ => {}
        }
        if self.playing {
            EngineState::Playing
        } else if self.stopped {
            EngineState::Stopped
        } else if !self.tracks.is_empty() || self.device.is_open() {
            EngineState::Loaded
        } else {
            EngineState::Idle
        }
    }

    /// Open the audio session. Safe to call repeatedly.
    pub fn initialize(&mut self) -> Result<(), EngineError> {
        if self.device.is_open() {
            return Ok(());
        }

        let lease = if self.device.is_exclusive() {
            Some(SessionLease::acquire().ok_or_else(|| {
                EngineError::HardwareUnavailable(
                    "another engine holds the audio session".to_string(),
                )
            })?)
        } else {
            None
        };

        let stream = self.config.stream_config();
        self.device.open(&stream)?;
        self.lease = lease;

        info!(
            device = self.device.name(),
            rate = stream.sample_rate,
            buffer = stream.buffer_frames,
            latency_ms = stream.latency_ms(),
            "audio session initialized"
        );
        Ok(())
    }

    /// Replace the loaded tracks. Tracks whose source can't be resolved or
    /// decoded are skipped. Returns how many loaded.
    pub fn load_tracks(&mut self, specs: &[TrackSpec]) -> usize {
        if self.playing {
            self.stop();
        }
        self.tracks.clear();

        let rate = self.config.sample_rate;
        for spec in specs {
            match load_mono(self.resolver.as_ref(), &spec.source, rate) {
                Ok(samples) => {
                    let start = Sample::from_millis(spec.start_time_ms, rate);
                    debug!(
                        track = %spec.id,
                        start_ms = spec.start_time_ms,
                        frames = samples.len(),
                        "track loaded"
                    );
                    self.tracks.push(LoadedTrack {
                        id: spec.id.clone(),
                        source: spec.source.clone(),
                        start,
                        samples,
                    });
                }
                Err(e) => {
                    warn!(track = %spec.id, error = %e, "SourceUnresolvable: skipping track");
                }
            }
        }

        self.stopped = false;
        info!(
            requested = specs.len(),
            loaded = self.tracks.len(),
            "tracks loaded"
        );
        self.tracks.len()
    }

    pub fn tracks(&self) -> &[LoadedTrack] {
        &self.tracks
    }

    pub fn loaded_track_count(&self) -> usize {
        self.tracks.len()
    }

    /// End of the last track under the current playback strategy.
    pub fn chain_end_ms(&self) -> f64 {
        let plan = RenderPlan::build(&self.tracks, self.config.playback, 1, self.master.clone());
        frames_to_ms(plan.end().0, self.config.sample_rate)
    }

    /// Start every loaded track from `play_from_ms` on one clock snapshot.
    pub fn play(&mut self, play_from_ms: f64) -> Result<(), EngineError> {
        self.initialize()?;
        self.stop();
        self.start_playback(play_from_ms, None)
    }

    /// Play and punch in at `record_start_ms`. `on_recording_started` gets
    /// the observed start once recording actually begins.
    pub fn play_and_record<F>(
        &mut self,
        play_from_ms: f64,
        record_start_ms: f64,
        on_recording_started: F,
    ) -> Result<(), EngineError>
    where
        F: FnOnce(f64) + Send + 'static,
    {
        if let Some(session) = &self.session {
            if matches!(
                session.status(),
                SessionStatus::Recording | SessionStatus::Finalized
            ) {
                return Err(EngineError::RecordingActive);
            }
        }

        self.initialize()?;
        self.stop();
        self.discard_session();

        let rate = self.config.sample_rate;
        let target = Sample::from_millis(record_start_ms, rate);
        let (session, mut tap) =
            RecordingSession::arm(target, self.config.capacity_frames(), rate);
        let shared = Arc::clone(session.shared());

        self.device
            .start_input(Box::new(move |input: &[i16]| {
                tap.write(input);
            }))?;
        self.session = Some(session);

        let punch_in = PunchIn::new(shared, Box::new(on_recording_started));
        if let Err(e) = self.start_playback(play_from_ms, Some(punch_in)) {
            self.discard_session();
            return Err(e);
        }

        info!(play_from_ms, record_start_ms, "punch-in armed");
        Ok(())
    }

    fn start_playback(
        &mut self,
        play_from_ms: f64,
        punch_in: Option<PunchIn>,
    ) -> Result<(), EngineError> {
        let channels = self.config.output_channels as usize;
        let plan = RenderPlan::build(
            &self.tracks,
            self.config.playback,
            channels,
            self.master.clone(),
        );
        let render_activation = if self.config.trigger.activates_in_render() {
            punch_in.as_ref().map(|p| Arc::clone(&p.session))
        } else {
            None
        };

        let from = self.clock.start_at_ms(play_from_ms);
        let clock = Arc::clone(&self.clock);
        let render = Box::new(move |out: &mut [f32]| {
            let position = clock.frames();
            plan.render(position, out);
            let frames = (out.len() / channels) as u64;
            if let Some(session) = &render_activation {
                session.activate_in_block(position, frames);
            }
            clock.advance(frames);
        });

        if let Err(e) = self.device.start_output(render) {
            self.clock.stop();
            return Err(e.into());
        }

        if punch_in.is_some() || self.position_listener.is_some() {
            let monitor = PositionMonitor::spawn(
                self.config.trigger,
                self.clock.clone(),
                punch_in,
                self.position_listener.clone(),
            );
            match monitor {
                Ok(monitor) => self.monitor = Some(monitor),
                Err(e) => {
                    self.device.stop_output();
                    self.clock.stop();
                    return Err(EngineError::Monitor(e.to_string()));
                }
            }
        }

        self.playing = true;
        self.stopped = false;
        info!(
            play_from_ms,
            from_frame = from.0,
            tracks = self.tracks.len(),
            "playback started"
        );
        Ok(())
    }

    /// Chain position of the clock; the last play-from point while stopped.
    pub fn current_position_ms(&self) -> f64 {
        self.clock.position_ms()
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn is_recording(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.status() == SessionStatus::Recording)
    }

    /// Halt playback. An armed punch-in that never triggered is cancelled;
    /// a recording already running keeps capturing.
    pub fn stop(&mut self) {
        let cancelled = self
            .session
            .as_ref()
            .is_some_and(|s| s.shared().cancel());
        if cancelled {
            debug!("armed punch-in cancelled");
            self.discard_session();
        }

        if let Some(mut monitor) = self.monitor.take() {
            monitor.stop();
        }

        if self.playing {
            self.device.stop_output();
            self.clock.stop();
            self.playing = false;
            self.stopped = true;
            info!(position_ms = self.clock.position_ms(), "playback stopped");
        }
    }

    /// Finish the running take and write it as mono 16-bit WAV.
    pub fn stop_recording(&mut self) -> Result<RecordedTake, EngineError> {
        let finalized = self
            .session
            .as_ref()
            .is_some_and(|s| s.shared().finalize());
        if !finalized {
            return Err(EngineError::NoActiveRecording);
        }

        self.device.stop_input();
        let captured = self
            .session
            .take()
            .and_then(RecordingSession::finish)
            .ok_or(EngineError::NoActiveRecording)?;

        fs::create_dir_all(&self.config.recordings_dir)?;
        let path = self
            .config
            .recordings_dir
            .join(format!("take-{}.wav", Uuid::new_v4().simple()));
        write_wav(&path, &captured.samples, captured.sample_rate)?;

        let take = RecordedTake::from_captured(captured, SourceLocation::from(path));
        info!(
            source = %take.source,
            start_ms = take.start_time_ms,
            drift_ms = take.punch_in_drift_ms(),
            duration_ms = take.duration_ms,
            truncated = take.truncated,
            "recording finished"
        );
        Ok(take)
    }

    /// Release everything and go back to idle.
    pub fn cleanup(&mut self) {
        self.stop();
        if let Some(session) = &self.session {
            session.shared().cancel();
        }
        self.discard_session();
        self.tracks.clear();
        if self.device.is_open() {
            self.device.close();
            debug!(device = self.device.name(), "audio session closed");
        }
        self.lease = None;
        self.clock.reset();
        self.stopped = false;
    }

    pub fn set_master_gain(&self, gain: f32) {
        self.master.set_gain(gain);
    }

    pub fn master_gain(&self) -> f32 {
        self.master.gain()
    }

    /// Silence the output without touching the transport or an active take.
    pub fn set_master_mute(&self, mute: bool) {
        self.master.set_mute(mute);
    }

    pub fn is_master_muted(&self) -> bool {
        self.master.is_muted()
    }

    /// Receive the playback position on every monitor poll, from the next
    /// `play` on.
    pub fn set_position_listener<F>(&mut self, listener: F)
    where
        F: Fn(f64) + Send + Sync + 'static,
    {
        self.position_listener = Some(Arc::new(listener));
    }

    pub fn clear_position_listener(&mut self) {
        self.position_listener = None;
    }

    pub fn device_stats(&self) -> Arc<DeviceStats> {
        self.device.stats()
    }

    fn discard_session(&mut self) {
        if self.session.take().is_some() {
            self.device.stop_input();
        }
    }
}

impl Drop for DuetEngine {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{InputSignal, ManualDevice, ManualDriver};
    use crate::source::tests::wav_bytes;
    use crate::source::MemoryResolver;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    fn engine_with(
        trigger: PunchInTrigger,
        dir: &std::path::Path,
    ) -> (DuetEngine, ManualDriver, Arc<MemoryResolver>) {
        let (device, driver) = ManualDevice::new();
        let resolver = Arc::new(MemoryResolver::new());
        let config = EngineConfig {
            output_channels: 1,
            buffer_frames: 64,
            max_recording_secs: 1,
            trigger,
            recordings_dir: dir.to_path_buf(),
            ..EngineConfig::default()
        };
        let engine = DuetEngine::new(config, Box::new(device), resolver.clone());
        (engine, driver, resolver)
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_state_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _driver, resolver) = engine_with(PunchInTrigger::default(), dir.path());
        assert_eq!(engine.state(), EngineState::Idle);

        resolver.insert("a.wav", wav_bytes(&[1000; 441], SAMPLE_RATE));
        assert_eq!(engine.load_tracks(&[TrackSpec::new("a", "a.wav", 0.0)]), 1);
        assert_eq!(engine.state(), EngineState::Loaded);

        engine.play(0.0).unwrap();
        assert_eq!(engine.state(), EngineState::Playing);

        engine.stop();
        assert_eq!(engine.state(), EngineState::Stopped);

        engine.cleanup();
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(engine.loaded_track_count(), 0);
    }

    #[test]
    fn test_unresolvable_tracks_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _driver, resolver) = engine_with(PunchInTrigger::default(), dir.path());
        resolver.insert("ok.wav", wav_bytes(&[1; 100], SAMPLE_RATE));
        resolver.insert("wrong-rate.wav", wav_bytes(&[1; 100], 48_000));

        let loaded = engine.load_tracks(&[
            TrackSpec::new("ok", "ok.wav", 0.0),
            TrackSpec::new("missing", "missing.wav", 0.0),
            TrackSpec::new("rate", "wrong-rate.wav", 0.0),
        ]);
        assert_eq!(loaded, 1);
        assert_eq!(engine.tracks()[0].id, "ok");
    }

    #[test]
    fn test_initialize_failure_is_hardware_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, driver, _resolver) = engine_with(PunchInTrigger::default(), dir.path());
        driver.fail_open("no device");
        assert!(matches!(
            engine.play(0.0),
            Err(EngineError::HardwareUnavailable(_))
        ));
    }

    #[test]
    fn test_position_parks_at_play_from_when_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, driver, _resolver) = engine_with(PunchInTrigger::default(), dir.path());
        assert_eq!(engine.current_position_ms(), 0.0);

        engine.play(1500.0).unwrap();
        driver.run(4410, 64);
        assert!((engine.current_position_ms() - 1600.0).abs() < 0.01);

        engine.stop();
        assert_eq!(engine.current_position_ms(), 1500.0);
    }

    #[test]
    fn test_stop_recording_without_session() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _driver, _resolver) = engine_with(PunchInTrigger::default(), dir.path());
        assert!(matches!(
            engine.stop_recording(),
            Err(EngineError::NoActiveRecording)
        ));
    }

    #[test]
    fn test_render_trigger_records_from_target_frame() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, driver, _resolver) =
            engine_with(PunchInTrigger::RenderCallback, dir.path());
        driver.set_input(InputSignal::Tone {
            frequency: 440.0,
            amplitude: 8000,
        });

        let started = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&started);
        engine
            .play_and_record(0.0, 10.0, move |ms| *sink.lock().unwrap() = Some(ms))
            .unwrap();
        assert_eq!(engine.state(), EngineState::Armed);

        // 10 ms = 441 frames; blocks of 64 cross it inside the 7th block
        driver.run(441 + 64, 64);
        assert!(engine.is_recording());
        assert!(wait_until(|| started.lock().unwrap().is_some()));
        assert_eq!(*started.lock().unwrap(), Some(10.0));

        driver.run(4410, 64);
        let take = engine.stop_recording().unwrap();
        assert_eq!(take.start_time_ms, 10.0);
        assert_eq!(take.requested_start_ms, 10.0);
        assert!(!take.truncated);
        assert!(take.samples.iter().any(|s| *s != 0));
        assert!(take.source.as_path().unwrap().exists());
    }

    #[test]
    fn test_second_session_rejected_while_recording() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, driver, _resolver) =
            engine_with(PunchInTrigger::RenderCallback, dir.path());
        engine.play_and_record(0.0, 0.0, |_| {}).unwrap();
        driver.run(64, 64);
        assert!(engine.is_recording());

        assert!(matches!(
            engine.play_and_record(0.0, 0.0, |_| {}),
            Err(EngineError::RecordingActive)
        ));
    }

    #[test]
    fn test_stop_cancels_armed_session() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, driver, _resolver) =
            engine_with(PunchInTrigger::RenderCallback, dir.path());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        engine
            .play_and_record(0.0, 60_000.0, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        driver.run(640, 64);
        engine.stop();

        assert!(!driver.input_running());
        assert!(matches!(
            engine.stop_recording(),
            Err(EngineError::NoActiveRecording)
        ));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stop_keeps_active_recording() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, driver, _resolver) =
            engine_with(PunchInTrigger::RenderCallback, dir.path());
        engine.play_and_record(0.0, 0.0, |_| {}).unwrap();
        driver.run(128, 64);
        engine.stop();

        assert!(engine.is_recording());
        assert!(driver.input_running());
        let take = engine.stop_recording().unwrap();
        assert_eq!(take.start_time_ms, 0.0);
    }

    #[test]
    fn test_capacity_truncates_take() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, driver, _resolver) =
            engine_with(PunchInTrigger::RenderCallback, dir.path());
        driver.set_input(InputSignal::Tone {
            frequency: 220.0,
            amplitude: 4000,
        });
        engine.play_and_record(0.0, 0.0, |_| {}).unwrap();

        // 1 s capacity, run 1.5 s
        driver.run(SAMPLE_RATE as usize * 3 / 2, 64);
        assert!(!engine.is_recording());

        let take = engine.stop_recording().unwrap();
        assert!(take.truncated);
        assert_eq!(take.samples.len(), SAMPLE_RATE as usize);
        assert_eq!(take.duration_ms, 1000.0);
    }

    #[test]
    fn test_master_gain_applies_during_playback() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, driver, resolver) = engine_with(PunchInTrigger::default(), dir.path());
        resolver.insert("a.wav", wav_bytes(&[16384; 512], SAMPLE_RATE));
        engine.load_tracks(&[TrackSpec::new("a", "a.wav", 0.0)]);
        engine.play(0.0).unwrap();

        let loud = driver.render(64).unwrap();
        engine.set_master_gain(0.5);
        let quiet = driver.render(64).unwrap();
        assert!((loud[0] - 0.5).abs() < 1e-3);
        assert!((quiet[0] - 0.25).abs() < 1e-3);
    }

    #[test]
    fn test_mute_silences_output_but_keeps_recording() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, driver, resolver) =
            engine_with(PunchInTrigger::RenderCallback, dir.path());
        driver.set_input(InputSignal::Tone {
            frequency: 440.0,
            amplitude: 8000,
        });
        resolver.insert("a.wav", wav_bytes(&[16384; 512], SAMPLE_RATE));
        engine.load_tracks(&[TrackSpec::new("a", "a.wav", 0.0)]);
        engine.play_and_record(0.0, 0.0, |_| {}).unwrap();

        engine.set_master_mute(true);
        assert!(engine.is_master_muted());
        let muted = driver.run(128, 64);
        assert!(muted.iter().all(|s| *s == 0.0));
        assert!(engine.is_playing());

        engine.set_master_mute(false);
        let audible = driver.run(64, 64);
        assert!((audible[0] - 0.5).abs() < 1e-3);

        let take = engine.stop_recording().unwrap();
        assert_eq!(take.samples.len(), 192);
        assert!(take.samples.iter().any(|s| *s != 0));
    }
}
