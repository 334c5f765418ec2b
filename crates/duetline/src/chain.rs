//! Chain workflows over the storage collaborators
//!
//! Glue between persisted segments and the engine: load a chain for
//! playback, commit a finished take as the chain's new tip, and delete a
//! chain together with the audio nobody else uses.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use thiserror::Error;
use tracing::{info, warn};

use crate::primitives::SegmentId;
use crate::recording::{write_wav, RecordedTake};
use crate::storage::{ObjectStore, SegmentRepository, StorageError, StorageKey};
use crate::timeline::{ChainLayout, TimelineError};

#[derive(Debug, Error)]
pub enum ChainError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Timeline(#[from] TimelineError),

    #[error("writable location {0} is not a local file")]
    NotLocal(String),

    #[error(transparent)]
    Wav(#[from] hound::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Walk from `leaf` to the root and lay the chain out for playback.
pub fn load_chain(
    repo: &dyn SegmentRepository,
    leaf: SegmentId,
) -> Result<ChainLayout, ChainError> {
    let mut records = Vec::new();
    let mut seen = HashSet::new();
    let mut cursor = Some(leaf);

    while let Some(id) = cursor {
        if !seen.insert(id) {
            return Err(TimelineError::Cycle(id).into());
        }
        let record = repo.get(id)?;
        cursor = record.parent;
        records.push(record);
    }
    records.reverse();

    let segments = records.iter().map(|r| r.to_segment()).collect();
    Ok(ChainLayout::from_ordered(segments))
}

/// Store `take` and append it to the chain ending at `parent` (or start a
/// new chain). The observed punch-in offset is kept with the segment.
///
/// A take file written by the engine is moved into the store, so nothing is
/// left behind in the recordings directory.
pub fn commit_take(
    repo: &dyn SegmentRepository,
    store: &dyn ObjectStore,
    parent: Option<SegmentId>,
    take: &RecordedTake,
) -> Result<SegmentId, ChainError> {
    let location = store.resolve_writable_location("take.wav")?;
    let path = location
        .local_path()
        .ok_or_else(|| ChainError::NotLocal(location.uri.clone()))?;

    match take.source.as_path().filter(|p| p.is_file()) {
        Some(recorded) => move_file(recorded, &path)?,
        None => write_wav(&path, &take.samples, take.sample_rate)?,
    }

    let id = match repo.create(parent, location.key.clone(), take.duration_seconds()) {
        Ok(id) => id,
        Err(e) => {
            if let Err(cleanup) = store.delete(&location.key) {
                warn!(key = %location.key, error = %cleanup, "failed to remove uncommitted take");
            }
            return Err(e.into());
        }
    };
    repo.set_start_offset(id, take.start_time_ms / 1000.0)?;

    info!(
        segment = %id,
        parent = ?parent,
        key = %location.key,
        start_ms = take.start_time_ms,
        duration_ms = take.duration_ms,
        "take committed"
    );
    Ok(id)
}

/// Rename, falling back to copy and remove across filesystems.
fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)
}

/// Delete the chain ending at `leaf` and the objects of the removed
/// segments. Returns the number of segments removed.
pub fn delete_chain(
    repo: &dyn SegmentRepository,
    store: &dyn ObjectStore,
    leaf: SegmentId,
) -> Result<usize, ChainError> {
    let removed = repo.delete(leaf)?;
    let keys: HashSet<&StorageKey> = removed.iter().map(|r| &r.source_key).collect();
    for key in keys {
        if let Err(e) = store.delete(key) {
            warn!(key = %key, error = %e, "failed to delete segment audio");
        }
    }
    info!(chain = %leaf, removed = removed.len(), "chain deleted");
    Ok(removed.len())
}
