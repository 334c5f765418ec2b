//! Duetline: duet timeline and synchronized audio engine
//!
//! Builds a song out of a chain of recorded segments. Each take is recorded
//! while the earlier takes play back, and its start is placed by the
//! cascading rule, so two performers can alternate without being in the
//! same room.
//!
//! - **timeline**: where every segment of a chain starts
//! - **engine**: sample-synchronized playback with punch-in recording
//! - **calibration**: round-trip latency from a click and its re-recording
//! - **storage** / **chain**: segment metadata, audio objects and the
//!   workflows that connect them to the engine
//!
//! All timing derives from one sample clock that only the audio render
//! callback advances.

pub mod calibration;
pub mod chain;
pub mod clock;
pub mod device;
pub mod engine;
pub mod mixer;
pub mod monitor;
pub mod primitives;
pub mod recording;
pub mod source;
pub mod storage;
pub mod timeline;
pub mod transient;

pub use calibration::{
    converter_for, offset_ms, CalibrationError, CalibrationReport, Calibrator, FfmpegConverter,
    PcmBuffer, PcmConverter, WavConverter,
};
pub use chain::{commit_take, delete_chain, load_chain, ChainError};
pub use clock::SampleClock;
pub use device::{
    AudioDevice, DeviceError, DeviceStats, InputSignal, ManualDevice, ManualDriver, StreamConfig,
    VirtualDevice,
};
#[cfg(feature = "pipewire")]
pub use device::PipeWireDevice;
pub use engine::{DuetEngine, EngineConfig, EngineError, EngineState, TrackSpec};
pub use mixer::{LoadedTrack, MasterBus, PlaybackStrategy};
pub use monitor::{PositionMonitor, PositionSource, PunchIn, PunchInTrigger};
pub use primitives::*;
pub use recording::{RecordedTake, RecordingSession, SessionStatus};
pub use source::{
    decode_audio, decode_wav, DecodedAudio, FileResolver, MemoryResolver, SourceError,
    SourceResolver, StoreResolver,
};
pub use storage::{
    FileObjectStore, FileSegmentRepository, MemorySegmentRepository, ObjectStore,
    ReadableLocation, SegmentRecord, SegmentRepository, StorageError, StorageKey,
    WritableLocation,
};
pub use timeline::{
    compute_timeline, order_chain, ChainLayout, Timeline, TimelineEntry, TimelineError,
    TimelineSummary,
};
pub use transient::{detect_transient, Transient};
