//! Cascading timeline scheduler
//!
//! Places the segments of a chain on one shared time axis. The first two
//! segments start together at zero; every later segment starts when the
//! `(i-1)`-th earliest of the previously placed segments has finished, which
//! keeps at most two layers sounding at once in a well-formed chain.
//!
//! Everything here is pure and allocation-light; the engine consumes the
//! results as absolute track offsets.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::primitives::{Second, Segment, SegmentId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimelineError {
    #[error("segment {child} references missing parent {parent}")]
    BrokenChain { child: SegmentId, parent: SegmentId },

    #[error("parent links form a cycle through {0}")]
    Cycle(SegmentId),

    #[error("segment {0} has more than one child")]
    Branching(SegmentId),

    #[error("chain has {0} root segments, expected one")]
    Roots(usize),
}

/// One placed segment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub index: usize,
    pub start: Second,
    pub duration: Second,
}

impl TimelineEntry {
    pub fn end(&self) -> Second {
        Second(self.start.0 + self.duration.0)
    }
}

/// Start offsets for an ordered chain, extendable one segment at a time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Timeline {
    entries: Vec<TimelineEntry>,
    /// End times sorted ascending, ties broken by entry index.
    ends: Vec<(Second, usize)>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Batch placement of `durations` in chain order.
    pub fn compute(durations: &[Second]) -> Self {
        let mut timeline = Self::new();
        for &duration in durations {
            timeline.push(duration);
        }
        timeline
    }

    /// Start offset the next appended segment would receive.
    pub fn next_start_time(&self) -> Second {
        let i = self.entries.len();
        if i < 2 {
            return Second::zero();
        }
        // (i-1)-th smallest end, 1-indexed
        self.ends[i - 2].0
    }

    /// Append a segment using the cascading rule; returns its start.
    pub fn push(&mut self, duration: Second) -> Second {
        let start = self.next_start_time();
        self.insert(start, duration);
        start
    }

    /// Append a segment whose start was observed rather than computed.
    ///
    /// Later segments cascade from the observed end.
    pub fn push_observed(&mut self, duration: Second, start: Second) {
        self.insert(Second(start.0.max(0.0)), duration);
    }

    fn insert(&mut self, start: Second, duration: Second) {
        let duration = sanitize(duration, self.entries.len());
        let index = self.entries.len();
        let entry = TimelineEntry {
            index,
            start,
            duration,
        };
        let end = entry.end();
        let at = self
            .ends
            .partition_point(|(e, i)| e.0.total_cmp(&end.0).then(i.cmp(&index)).is_lt());
        self.ends.insert(at, (end, index));
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn start_times(&self) -> Vec<Second> {
        self.entries.iter().map(|e| e.start).collect()
    }

    /// Latest end over all segments; zero for an empty chain.
    pub fn total_duration(&self) -> Second {
        self.ends.last().map(|(end, _)| *end).unwrap_or_default()
    }

    /// How many segments are sounding at `at`.
    pub fn active_at(&self, at: Second) -> usize {
        self.entries
            .iter()
            .filter(|e| e.start.0 <= at.0 && at.0 < e.end().0)
            .count()
    }
}

fn sanitize(duration: Second, index: usize) -> Second {
    if duration.0.is_finite() && duration.0 >= 0.0 {
        duration
    } else {
        tracing::warn!(index, duration = duration.0, "invalid segment duration, using 0");
        Second::zero()
    }
}

/// Plain-number result for callers outside the crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineSummary {
    pub start_times: Vec<f64>,
    pub total_duration: f64,
}

/// Start times (seconds) and total length for durations in chain order.
pub fn compute_timeline(durations: &[f64]) -> TimelineSummary {
    let durations: Vec<Second> = durations.iter().copied().map(Second).collect();
    let timeline = Timeline::compute(&durations);
    TimelineSummary {
        start_times: timeline.entries.iter().map(|e| e.start.0).collect(),
        total_duration: timeline.total_duration().0,
    }
}

/// Orders segments root-first by following parent links.
///
/// Every segment except the root must name a parent in the set, and each
/// parent may have at most one child.
pub fn order_chain(segments: Vec<Segment>) -> Result<Vec<Segment>, TimelineError> {
    if segments.is_empty() {
        return Ok(segments);
    }

    let ids: HashSet<SegmentId> = segments.iter().map(|s| s.id).collect();
    let mut child_of: HashMap<SegmentId, usize> = HashMap::new();
    let mut roots = Vec::new();

    for (idx, segment) in segments.iter().enumerate() {
        match segment.parent {
            None => roots.push(idx),
            Some(parent) if !ids.contains(&parent) => {
                return Err(TimelineError::BrokenChain {
                    child: segment.id,
                    parent,
                })
            }
            Some(parent) => {
                if child_of.insert(parent, idx).is_some() {
                    return Err(TimelineError::Branching(parent));
                }
            }
        }
    }

    let root = match roots.as_slice() {
        [root] => *root,
        // every segment has a parent inside the set
        [] => return Err(TimelineError::Cycle(segments[0].id)),
        many => return Err(TimelineError::Roots(many.len())),
    };

    let mut slots: Vec<Option<Segment>> = segments.into_iter().map(Some).collect();
    let mut ordered = Vec::with_capacity(slots.len());
    let mut cursor = Some(root);

    while let Some(idx) = cursor {
        let Some(segment) = slots[idx].take() else {
            break;
        };
        cursor = child_of.get(&segment.id).copied();
        ordered.push(segment);
    }

    if let Some(left) = slots.iter().flatten().next() {
        // unreachable from the root, so the rest loops on itself
        return Err(TimelineError::Cycle(left.id));
    }

    Ok(ordered)
}

/// An ordered chain together with its placement.
#[derive(Debug, Clone)]
pub struct ChainLayout {
    pub segments: Vec<Segment>,
    pub timeline: Timeline,
}

impl ChainLayout {
    /// Orders `segments` and places them, preferring observed start offsets
    /// where a take recorded one.
    pub fn from_segments(segments: Vec<Segment>) -> Result<Self, TimelineError> {
        let segments = order_chain(segments)?;
        Ok(Self::from_ordered(segments))
    }

    /// Places segments already in chain order.
    pub fn from_ordered(segments: Vec<Segment>) -> Self {
        let mut timeline = Timeline::new();
        for segment in &segments {
            match segment.recorded_start {
                Some(start) => timeline.push_observed(segment.duration, start),
                None => {
                    timeline.push(segment.duration);
                }
            }
        }
        Self { segments, timeline }
    }

    /// Where the next take in this chain should punch in.
    pub fn next_start_time(&self) -> Second {
        self.timeline.next_start_time()
    }

    pub fn total_duration(&self) -> Second {
        self.timeline.total_duration()
    }

    pub fn leaf(&self) -> Option<&Segment> {
        self.segments.last()
    }

    /// Engine track bindings, one per segment.
    pub fn track_specs(&self) -> Vec<crate::engine::TrackSpec> {
        self.segments
            .iter()
            .zip(self.timeline.entries())
            .map(|(segment, entry)| crate::engine::TrackSpec {
                id: segment.id.to_string(),
                source: segment.source.clone(),
                start_time_ms: entry.start.as_millis(),
            })
            .collect()
    }
}
