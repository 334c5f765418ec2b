//! Track layout and RT mixing
//!
//! The mixer separates concerns:
//! - **PlaybackStrategy**: where each loaded track sits on the shared clock
//! - **RenderPlan**: immutable snapshot of the laid-out tracks for one `play`
//! - **MasterBus**: output controls shared with the render callback (atomics)
//!
//! `RenderPlan::render` is the RT-safe part: pure math over preloaded
//! samples, no allocation, no locks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use portable_atomic::AtomicF32;

use crate::primitives::{Sample, SourceLocation};

/// A decoded mono track bound to the engine.
#[derive(Debug, Clone)]
pub struct LoadedTrack {
    pub id: String,
    pub source: SourceLocation,
    /// Scheduled start on the chain clock
    pub start: Sample,
    pub samples: Arc<[f32]>,
}

impl LoadedTrack {
    pub fn frames(&self) -> u64 {
        self.samples.len() as u64
    }
}

/// How loaded tracks are placed when playback starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackStrategy {
    /// Every track at its scheduled start; overlapping tracks sound together.
    #[default]
    Overlapping,
    /// Tracks back to back in start order from the earliest start, ignoring
    /// overlap. Fallback for outputs that cannot mix.
    Sequential,
}

impl PlaybackStrategy {
    /// Start frame of each track, in the order given.
    pub fn layout(&self, tracks: &[LoadedTrack]) -> Vec<Sample> {
        match self {
            Self::Overlapping => tracks.iter().map(|t| t.start).collect(),
            Self::Sequential => {
                let mut order: Vec<usize> = (0..tracks.len()).collect();
                order.sort_by_key(|&i| (tracks[i].start, i));

                let mut starts = vec![Sample::zero(); tracks.len()];
                let mut cursor = order.first().map_or(Sample::zero(), |&i| tracks[i].start);
                for i in order {
                    starts[i] = cursor;
                    cursor = Sample(cursor.0 + tracks[i].frames());
                }
                starts
            }
        }
    }
}

impl From<duetconf::PlaybackMode> for PlaybackStrategy {
    fn from(mode: duetconf::PlaybackMode) -> Self {
        match mode {
            duetconf::PlaybackMode::Overlapping => Self::Overlapping,
            duetconf::PlaybackMode::Sequential => Self::Sequential,
        }
    }
}

/// Master output controls, adjustable while playing.
#[derive(Debug, Clone)]
pub struct MasterBus {
    pub gain: Arc<AtomicF32>,
    pub mute: Arc<AtomicBool>,
}

impl MasterBus {
    pub fn new(gain: f32) -> Self {
        Self {
            gain: Arc::new(AtomicF32::new(gain.clamp(0.0, 2.0))),
            mute: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set gain (clamped to 0.0-2.0)
    pub fn set_gain(&self, value: f32) {
        self.gain.store(value.clamp(0.0, 2.0), Ordering::Relaxed);
    }

    pub fn gain(&self) -> f32 {
        self.gain.load(Ordering::Relaxed)
    }

    pub fn set_mute(&self, mute: bool) {
        self.mute.store(mute, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.mute.load(Ordering::Relaxed)
    }

    fn effective_gain(&self) -> f32 {
        if self.mute.load(Ordering::Relaxed) {
            0.0
        } else {
            self.gain.load(Ordering::Relaxed)
        }
    }
}

impl Default for MasterBus {
    fn default() -> Self {
        Self::new(1.0)
    }
}

#[derive(Debug, Clone)]
struct PlannedTrack {
    start: u64,
    samples: Arc<[f32]>,
}

/// Tracks laid out for one playback run.
#[derive(Debug, Clone)]
pub struct RenderPlan {
    tracks: Arc<[PlannedTrack]>,
    channels: usize,
    master: MasterBus,
}

impl RenderPlan {
    pub fn build(
        tracks: &[LoadedTrack],
        strategy: PlaybackStrategy,
        channels: usize,
        master: MasterBus,
    ) -> Self {
        let planned: Vec<PlannedTrack> = strategy
            .layout(tracks)
            .into_iter()
            .zip(tracks)
            .map(|(start, track)| PlannedTrack {
                start: start.0,
                samples: Arc::clone(&track.samples),
            })
            .collect();

        Self {
            tracks: planned.into(),
            channels: channels.max(1),
            master,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Frame after the last sample of the last track.
    pub fn end(&self) -> Sample {
        Sample(
            self.tracks
                .iter()
                .map(|t| t.start + t.samples.len() as u64)
                .max()
                .unwrap_or(0),
        )
    }

    /// Mix the block starting at chain frame `position` into `out`
    /// (interleaved, `channels` wide). Mono tracks go to every channel.
    #[inline]
    pub fn render(&self, position: Sample, out: &mut [f32]) {
        out.fill(0.0);
        let frames = (out.len() / self.channels) as u64;
        let block_start = position.0;
        let block_end = block_start + frames;
        let gain = self.master.effective_gain();

        for track in self.tracks.iter() {
            let track_end = track.start + track.samples.len() as u64;
            if track.start >= block_end || track_end <= block_start {
                continue;
            }

            // overlap of [block_start, block_end) and [track.start, track_end)
            let from = block_start.max(track.start);
            let to = block_end.min(track_end);
            for frame in from..to {
                let sample = track.samples[(frame - track.start) as usize] * gain;
                let base = (frame - block_start) as usize * self.channels;
                for slot in &mut out[base..base + self.channels] {
                    *slot += sample;
                }
            }
        }

        for slot in out.iter_mut() {
            *slot = soft_clip(*slot);
        }
    }
}

/// Leaves [-1, 1] untouched and bends anything beyond it with `tanh`.
#[inline]
pub fn soft_clip(sample: f32) -> f32 {
    if sample > 1.0 || sample < -1.0 {
        sample.tanh()
    } else {
        sample
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(id: &str, start: u64, samples: Vec<f32>) -> LoadedTrack {
        LoadedTrack {
            id: id.to_string(),
            source: SourceLocation::new(id),
            start: Sample(start),
            samples: samples.into(),
        }
    }

    #[test]
    fn test_overlapping_layout_keeps_scheduled_starts() {
        let tracks = vec![track("a", 0, vec![0.1; 10]), track("b", 5, vec![0.1; 10])];
        assert_eq!(
            PlaybackStrategy::Overlapping.layout(&tracks),
            vec![Sample(0), Sample(5)]
        );
    }

    #[test]
    fn test_sequential_layout_chains_in_start_order() {
        let tracks = vec![
            track("late", 100, vec![0.0; 4]),
            track("early", 0, vec![0.0; 10]),
            track("mid", 0, vec![0.0; 3]),
        ];
        assert_eq!(
            PlaybackStrategy::Sequential.layout(&tracks),
            vec![Sample(13), Sample(0), Sample(10)]
        );
    }

    #[test]
    fn test_sequential_layout_keeps_earliest_start() {
        let tracks = vec![
            track("b", 300, vec![0.0; 20]),
            track("a", 200, vec![0.0; 50]),
        ];
        assert_eq!(
            PlaybackStrategy::Sequential.layout(&tracks),
            vec![Sample(250), Sample(200)]
        );
        assert!(PlaybackStrategy::Sequential.layout(&[]).is_empty());
    }

    #[test]
    fn test_render_mid_track_start() {
        let samples: Vec<f32> = (0..8).map(|i| i as f32 / 10.0).collect();
        let plan = RenderPlan::build(
            &[track("a", 0, samples)],
            PlaybackStrategy::Overlapping,
            2,
            MasterBus::default(),
        );

        let mut out = vec![0.0; 4];
        plan.render(Sample(3), &mut out);
        assert_eq!(out, vec![0.3, 0.3, 0.4, 0.4]);
    }

    #[test]
    fn test_render_track_enters_inside_block() {
        let plan = RenderPlan::build(
            &[track("a", 2, vec![0.5; 4])],
            PlaybackStrategy::Overlapping,
            1,
            MasterBus::default(),
        );

        let mut out = vec![9.0; 4];
        plan.render(Sample(0), &mut out);
        assert_eq!(out, vec![0.0, 0.0, 0.5, 0.5]);

        plan.render(Sample(4), &mut out);
        assert_eq!(out, vec![0.5, 0.5, 0.0, 0.0]);
    }

    #[test]
    fn test_render_sums_and_soft_clips() {
        let plan = RenderPlan::build(
            &[track("a", 0, vec![0.8; 2]), track("b", 0, vec![0.8; 2])],
            PlaybackStrategy::Overlapping,
            1,
            MasterBus::default(),
        );

        let mut out = vec![0.0; 2];
        plan.render(Sample(0), &mut out);
        assert!((out[0] - 1.6f32.tanh()).abs() < 1e-6);
        assert!(out[0] < 1.0);
    }

    #[test]
    fn test_soft_clip_passes_in_range() {
        assert_eq!(soft_clip(0.99), 0.99);
        assert_eq!(soft_clip(-1.0), -1.0);
        assert!(soft_clip(3.0) < 1.0);
        assert!(soft_clip(-3.0) > -1.0);
    }

    #[test]
    fn test_master_gain_applies_live() {
        let master = MasterBus::default();
        let plan = RenderPlan::build(
            &[track("a", 0, vec![0.5; 4])],
            PlaybackStrategy::Overlapping,
            1,
            master.clone(),
        );

        let mut out = vec![0.0; 2];
        master.set_gain(0.5);
        plan.render(Sample(0), &mut out);
        assert_eq!(out, vec![0.25, 0.25]);

        master.set_mute(true);
        plan.render(Sample(2), &mut out);
        assert_eq!(out, vec![0.0, 0.0]);
    }

    #[test]
    fn test_plan_end_follows_strategy() {
        let tracks = [track("a", 0, vec![0.1; 10]), track("b", 4, vec![0.1; 15])];
        let overlapping =
            RenderPlan::build(&tracks, PlaybackStrategy::Overlapping, 2, MasterBus::default());
        let sequential =
            RenderPlan::build(&tracks, PlaybackStrategy::Sequential, 2, MasterBus::default());
        assert_eq!(overlapping.end(), Sample(19));
        assert_eq!(sequential.end(), Sample(25));
        assert_eq!(
            RenderPlan::build(&[], PlaybackStrategy::Overlapping, 1, MasterBus::default()).end(),
            Sample(0)
        );
    }
}
