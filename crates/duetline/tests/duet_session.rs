//! Integration tests for a full duet session
//!
//! Drives the engine block by block through a ManualDevice so every
//! position, punch-in and take length is exact.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use duetline::{
    commit_take, compute_timeline, load_chain, DuetEngine, EngineConfig, FileObjectStore,
    FileSegmentRepository, InputSignal, ManualDevice, ManualDriver, MemoryResolver,
    PlaybackStrategy, PunchInTrigger, Second, SegmentRepository, StoreResolver, TrackSpec,
    VirtualDevice, SAMPLE_RATE,
};

const BLOCK: usize = 64;
const HALF_SECOND: usize = SAMPLE_RATE as usize / 2;

fn config(dir: &std::path::Path, trigger: PunchInTrigger) -> EngineConfig {
    EngineConfig {
        output_channels: 1,
        buffer_frames: BLOCK,
        max_recording_secs: 2,
        trigger,
        recordings_dir: dir.join("takes"),
        ..EngineConfig::default()
    }
}

fn wav_bytes(samples: &[i16]) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

struct Studio {
    _dir: tempfile::TempDir,
    store: Arc<FileObjectStore>,
    repo: FileSegmentRepository,
    engine: DuetEngine,
    driver: ManualDriver,
}

impl Studio {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileObjectStore::new(dir.path().join("store")).unwrap());
        let repo = FileSegmentRepository::open(dir.path().join("segments.json")).unwrap();
        let (device, driver) = ManualDevice::new();
        driver.set_input(InputSignal::Tone {
            frequency: 330.0,
            amplitude: 6000,
        });
        let engine = DuetEngine::new(
            config(dir.path(), PunchInTrigger::RenderCallback),
            Box::new(device),
            Arc::new(StoreResolver::new(store.clone())),
        );
        Self {
            _dir: dir,
            store,
            repo,
            engine,
            driver,
        }
    }

    /// Punch in where the chain says, record `frames`, commit.
    fn record_take(&mut self, parent: Option<duetline::SegmentId>, frames: usize) -> (duetline::SegmentId, f64, Vec<f32>) {
        let punch_in_ms = match parent {
            Some(leaf) => {
                let layout = load_chain(&self.repo, leaf).unwrap();
                let loaded = self.engine.load_tracks(&layout.track_specs());
                assert_eq!(loaded, layout.segments.len());
                layout.next_start_time().as_millis()
            }
            None => 0.0,
        };

        let started = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&started);
        self.engine
            .play_and_record(0.0, punch_in_ms, move |ms| sink.lock().unwrap().push(ms))
            .unwrap();

        let lead_in = duetline::ms_to_frames(punch_in_ms, SAMPLE_RATE) as usize;
        let output = self.driver.run(lead_in + frames, BLOCK);

        let take = self.engine.stop_recording().unwrap();
        self.engine.stop();
        assert_eq!(take.requested_start_ms, punch_in_ms);
        assert_eq!(take.start_time_ms, punch_in_ms);

        let deadline = Instant::now() + Duration::from_secs(2);
        while started.lock().unwrap().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(*started.lock().unwrap(), vec![punch_in_ms]);

        let recorded = take.source.as_path().unwrap().to_path_buf();
        assert!(recorded.exists());
        let id = commit_take(&self.repo, self.store.as_ref(), parent, &take).unwrap();
        // the take file moved into the store
        assert!(!recorded.exists());
        (id, take.duration_ms, output)
    }
}

#[test]
fn three_takes_cascade() {
    let mut studio = Studio::new();

    let (a, a_ms, _) = studio.record_take(None, HALF_SECOND);
    assert_eq!(a_ms, 500.0);

    // second take overlaps the first from the top
    let (b, b_ms, output) = studio.record_take(Some(a), 2 * HALF_SECOND);
    assert_eq!(b_ms, 1000.0);
    assert!(output[..HALF_SECOND].iter().any(|s| s.abs() > 0.05));
    assert!(output[HALF_SECOND + BLOCK..].iter().all(|s| *s == 0.0));

    // third take starts when the first one ends
    let (c, c_ms, output) = studio.record_take(Some(b), HALF_SECOND);
    assert!(output[HALF_SECOND..2 * HALF_SECOND].iter().any(|s| s.abs() > 0.05));

    let layout = load_chain(&studio.repo, c).unwrap();
    assert_eq!(
        layout.timeline.start_times(),
        vec![Second(0.0), Second(0.0), Second(0.5)]
    );
    // the punch-in block is captured whole, so c runs slightly past 1 s
    let end = layout.total_duration().0;
    assert!((end - (0.5 + c_ms / 1000.0)).abs() < 1e-9);
    assert!(end > 1.0);
    assert_eq!(studio.repo.list_leaf_chains().unwrap(), vec![c]);
}

#[test]
fn repository_survives_reopen() {
    let mut studio = Studio::new();
    let (a, _, _) = studio.record_take(None, BLOCK * 10);

    let path = studio._dir.path().join("segments.json");
    let reopened = FileSegmentRepository::open(&path).unwrap();
    let record = reopened.get(a).unwrap();
    assert_eq!(record.parent, None);
    assert_eq!(record.start_offset_seconds, Some(0.0));
    assert!((record.duration_seconds - (BLOCK * 10) as f64 / SAMPLE_RATE as f64).abs() < 1e-12);
}

#[test]
fn sequential_strategy_plays_back_to_back() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = Arc::new(MemoryResolver::new());
    resolver.insert("a.wav", wav_bytes(&[8192; 128]));
    resolver.insert("b.wav", wav_bytes(&[16384; 128]));

    let (device, driver) = ManualDevice::new();
    let mut engine = DuetEngine::new(
        EngineConfig {
            playback: PlaybackStrategy::Sequential,
            ..config(dir.path(), PunchInTrigger::default())
        },
        Box::new(device),
        resolver,
    );
    engine.load_tracks(&[
        TrackSpec::new("a", "a.wav", 0.0),
        TrackSpec::new("b", "b.wav", 0.0),
    ]);
    assert!((engine.chain_end_ms() - 256.0 * 1000.0 / SAMPLE_RATE as f64).abs() < 1e-9);

    engine.play(0.0).unwrap();
    let output = driver.run(256, BLOCK);
    assert!((output[0] - 0.25).abs() < 1e-3);
    assert!((output[200] - 0.5).abs() < 1e-3);
}

#[test]
fn overlapping_tracks_sum() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = Arc::new(MemoryResolver::new());
    resolver.insert("a.wav", wav_bytes(&[8192; 128]));
    resolver.insert("b.wav", wav_bytes(&[8192; 128]));

    let (device, driver) = ManualDevice::new();
    let mut engine = DuetEngine::new(
        config(dir.path(), PunchInTrigger::default()),
        Box::new(device),
        resolver,
    );
    // b enters 64 frames in
    let b_start = 64.0 * 1000.0 / SAMPLE_RATE as f64;
    engine.load_tracks(&[
        TrackSpec::new("a", "a.wav", 0.0),
        TrackSpec::new("b", "b.wav", b_start),
    ]);

    engine.play(0.0).unwrap();
    let output = driver.run(256, BLOCK);
    assert!((output[10] - 0.25).abs() < 1e-3);
    assert!((output[100] - 0.5).abs() < 1e-3);
    assert!((output[150] - 0.25).abs() < 1e-3);
    assert_eq!(output[200], 0.0);
}

#[test]
fn play_from_mid_chain_starts_tracks_mid_file() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = Arc::new(MemoryResolver::new());
    let ramp: Vec<i16> = (0..1000).map(|i| i as i16 * 16).collect();
    resolver.insert("ramp.wav", wav_bytes(&ramp));

    let (device, driver) = ManualDevice::new();
    let mut engine = DuetEngine::new(
        config(dir.path(), PunchInTrigger::default()),
        Box::new(device),
        resolver,
    );
    engine.load_tracks(&[TrackSpec::new("ramp", "ramp.wav", 0.0)]);

    // 500 frames in
    let from_ms = 500.0 * 1000.0 / SAMPLE_RATE as f64;
    engine.play(from_ms).unwrap();
    let output = driver.run(BLOCK, BLOCK);
    assert!((output[0] - 500.0 * 16.0 / 32768.0).abs() < 1e-4);
}

#[test]
fn virtual_device_polls_punch_in() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = DuetEngine::new(
        EngineConfig {
            buffer_frames: 256,
            ..config(
                dir.path(),
                PunchInTrigger::Poll {
                    interval: Duration::from_millis(2),
                },
            )
        },
        Box::new(VirtualDevice::with_input(InputSignal::Tone {
            frequency: 440.0,
            amplitude: 3000,
        })),
        Arc::new(MemoryResolver::new()),
    );

    let started = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&started);
    engine
        .play_and_record(0.0, 50.0, move |ms| *sink.lock().unwrap() = Some(ms))
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(3);
    while started.lock().unwrap().is_none() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    let actual = started.lock().unwrap().expect("punch-in fired");
    assert!(actual >= 50.0);

    std::thread::sleep(Duration::from_millis(50));
    let take = engine.stop_recording().unwrap();
    assert_eq!(take.start_time_ms, actual);
    assert!(take.punch_in_drift_ms() >= 0.0);
    assert!(take.duration_ms > 0.0);

    engine.cleanup();
    assert_eq!(engine.current_position_ms(), 0.0);
}

#[test]
fn timeline_matches_documented_example() {
    let summary = compute_timeline(&[10.0, 15.0, 10.0, 10.0]);
    assert_eq!(summary.start_times, vec![0.0, 0.0, 10.0, 15.0]);
    assert_eq!(summary.total_duration, 25.0);
}
