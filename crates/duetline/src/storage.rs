//! Storage collaborators: segment metadata and audio objects.
//!
//! The engine only ever sees opaque locations. These traits are the seam to
//! whatever actually keeps the chain: a database and a bucket in production,
//! the filesystem and memory here.
//!
//! `FileObjectStore` layout:
//! ```text
//! {base_path}/
//! └── objects/
//!     ├── 3f/
//!     │   └── 3f2a...-take.wav
//!     └── a0/
//!         └── a09c...-reference.m4a
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::primitives::{Second, Segment, SegmentId, SourceLocation};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("segment not found: {0}")]
    SegmentNotFound(SegmentId),

    #[error("segment {0} has children and does not end a chain")]
    NotLeaf(SegmentId),

    #[error("object not found: {0}")]
    ObjectNotFound(StorageKey),

    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    #[error("storage lock poisoned")]
    Poisoned,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

// =============================================================================
// OBJECT STORE
// =============================================================================

/// Key of an object in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageKey(pub String);

impl StorageKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<StorageKey> for SourceLocation {
    fn from(key: StorageKey) -> Self {
        SourceLocation(key.0)
    }
}

/// Time-limited location an object can be read from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadableLocation {
    pub uri: String,
    pub expires_at: DateTime<Utc>,
}

impl ReadableLocation {
    /// Filesystem path for `file://` URIs.
    pub fn local_path(&self) -> Option<PathBuf> {
        file_uri_path(&self.uri)
    }
}

/// Time-limited location a new object can be written to, and the key it
/// will be known by afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WritableLocation {
    pub uri: String,
    pub key: StorageKey,
    pub expires_at: DateTime<Utc>,
}

impl WritableLocation {
    pub fn local_path(&self) -> Option<PathBuf> {
        file_uri_path(&self.uri)
    }
}

fn file_uri_path(uri: &str) -> Option<PathBuf> {
    uri.strip_prefix("file://").map(PathBuf::from)
}

/// Object storage for segment audio and calibration recordings.
pub trait ObjectStore: Send + Sync {
    fn resolve_readable_location(&self, key: &StorageKey) -> Result<ReadableLocation, StorageError>;

    /// Allocate a fresh key for `filename`.
    fn resolve_writable_location(&self, filename: &str) -> Result<WritableLocation, StorageError>;

    fn delete(&self, key: &StorageKey) -> Result<(), StorageError>;
}

/// Filesystem object store with sharded directories.
#[derive(Debug, Clone)]
pub struct FileObjectStore {
    base_path: PathBuf,
    link_ttl: Duration,
}

impl FileObjectStore {
    /// Create the store, making `{base}/objects` if needed.
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let base_path = base_path.into();
        fs::create_dir_all(base_path.join("objects"))?;
        Ok(Self {
            base_path,
            link_ttl: Duration::hours(1),
        })
    }

    pub fn with_link_ttl(mut self, ttl: Duration) -> Self {
        self.link_ttl = ttl;
        self
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn object_path(&self, key: &StorageKey) -> Result<PathBuf, StorageError> {
        let rel = Path::new(key.as_str());
        let well_formed = rel.starts_with("objects")
            && rel
                .components()
                .all(|c| matches!(c, std::path::Component::Normal(_)));
        if !well_formed {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.base_path.join(rel))
    }

    fn uri_for(path: &Path) -> String {
        format!("file://{}", path.display())
    }
}

impl ObjectStore for FileObjectStore {
    fn resolve_readable_location(&self, key: &StorageKey) -> Result<ReadableLocation, StorageError> {
        let path = self.object_path(key)?;
        if !path.is_file() {
            return Err(StorageError::ObjectNotFound(key.clone()));
        }
        Ok(ReadableLocation {
            uri: Self::uri_for(&path),
            expires_at: Utc::now() + self.link_ttl,
        })
    }

    fn resolve_writable_location(&self, filename: &str) -> Result<WritableLocation, StorageError> {
        let name: String = Path::new(filename)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| StorageError::InvalidKey(filename.to_string()))?;

        let id = Uuid::new_v4().simple().to_string();
        let key = StorageKey(format!("objects/{}/{}-{}", &id[..2], id, name));
        let path = self.object_path(&key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        Ok(WritableLocation {
            uri: Self::uri_for(&path),
            key,
            expires_at: Utc::now() + self.link_ttl,
        })
    }

    fn delete(&self, key: &StorageKey) -> Result<(), StorageError> {
        let path = self.object_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::ObjectNotFound(key.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

// =============================================================================
// SEGMENT REPOSITORY
// =============================================================================

/// Stored metadata for one segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub id: SegmentId,
    pub parent: Option<SegmentId>,
    pub source_key: StorageKey,
    pub duration_seconds: f64,
    #[serde(default)]
    pub start_offset_seconds: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl SegmentRecord {
    pub fn to_segment(&self) -> Segment {
        Segment {
            id: self.id,
            duration: Second(self.duration_seconds),
            source: self.source_key.clone().into(),
            parent: self.parent,
            created_at: self.created_at,
            recorded_start: self.start_offset_seconds.map(Second),
        }
    }
}

pub trait SegmentRepository: Send + Sync {
    fn create(
        &self,
        parent: Option<SegmentId>,
        source_key: StorageKey,
        duration_seconds: f64,
    ) -> Result<SegmentId, StorageError>;

    fn get(&self, id: SegmentId) -> Result<SegmentRecord, StorageError>;

    /// Ids of segments nobody builds on; each one identifies a chain.
    fn list_leaf_chains(&self) -> Result<Vec<SegmentId>, StorageError>;

    /// Remove the chain ending at `chain` back to the first segment another
    /// chain still shares. Returns the removed records, leaf first.
    fn delete(&self, chain: SegmentId) -> Result<Vec<SegmentRecord>, StorageError>;

    /// Record the start offset a take was actually recorded at.
    fn set_start_offset(&self, id: SegmentId, offset_seconds: f64) -> Result<(), StorageError>;
}

/// In-memory repository, also the working set of [`FileSegmentRepository`].
#[derive(Debug, Default)]
pub struct MemorySegmentRepository {
    records: RwLock<HashMap<SegmentId, SegmentRecord>>,
}

impl MemorySegmentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn from_records(records: Vec<SegmentRecord>) -> Self {
        Self {
            records: RwLock::new(records.into_iter().map(|r| (r.id, r)).collect()),
        }
    }

    fn snapshot(&self) -> Result<Vec<SegmentRecord>, StorageError> {
        let records = self.records.read().map_err(|_| StorageError::Poisoned)?;
        let mut all: Vec<SegmentRecord> = records.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }
}

impl SegmentRepository for MemorySegmentRepository {
    fn create(
        &self,
        parent: Option<SegmentId>,
        source_key: StorageKey,
        duration_seconds: f64,
    ) -> Result<SegmentId, StorageError> {
        let mut records = self.records.write().map_err(|_| StorageError::Poisoned)?;
        if let Some(parent) = parent {
            if !records.contains_key(&parent) {
                return Err(StorageError::SegmentNotFound(parent));
            }
        }

        let id = SegmentId::new();
        records.insert(
            id,
            SegmentRecord {
                id,
                parent,
                source_key,
                duration_seconds,
                start_offset_seconds: None,
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    fn get(&self, id: SegmentId) -> Result<SegmentRecord, StorageError> {
        let records = self.records.read().map_err(|_| StorageError::Poisoned)?;
        records
            .get(&id)
            .cloned()
            .ok_or(StorageError::SegmentNotFound(id))
    }

    fn list_leaf_chains(&self) -> Result<Vec<SegmentId>, StorageError> {
        let all = self.snapshot()?;
        let parents: HashSet<SegmentId> = all.iter().filter_map(|r| r.parent).collect();
        Ok(all
            .iter()
            .filter(|r| !parents.contains(&r.id))
            .map(|r| r.id)
            .collect())
    }

    fn delete(&self, chain: SegmentId) -> Result<Vec<SegmentRecord>, StorageError> {
        let mut records = self.records.write().map_err(|_| StorageError::Poisoned)?;
        if !records.contains_key(&chain) {
            return Err(StorageError::SegmentNotFound(chain));
        }

        let mut children: HashMap<SegmentId, usize> = HashMap::new();
        for record in records.values() {
            if let Some(parent) = record.parent {
                *children.entry(parent).or_default() += 1;
            }
        }
        if children.contains_key(&chain) {
            return Err(StorageError::NotLeaf(chain));
        }

        let mut removed = Vec::new();
        let mut cursor = Some(chain);
        while let Some(id) = cursor {
            if children.get(&id).copied().unwrap_or(0) > 0 {
                break;
            }
            let Some(record) = records.remove(&id) else {
                break;
            };
            if let Some(parent) = record.parent {
                if let Some(count) = children.get_mut(&parent) {
                    *count -= 1;
                }
            }
            cursor = record.parent;
            removed.push(record);
        }

        Ok(removed)
    }

    fn set_start_offset(&self, id: SegmentId, offset_seconds: f64) -> Result<(), StorageError> {
        let mut records = self.records.write().map_err(|_| StorageError::Poisoned)?;
        let record = records
            .get_mut(&id)
            .ok_or(StorageError::SegmentNotFound(id))?;
        record.start_offset_seconds = Some(offset_seconds);
        Ok(())
    }
}

/// Repository persisted as one JSON document, rewritten after every change.
#[derive(Debug)]
pub struct FileSegmentRepository {
    path: PathBuf,
    inner: MemorySegmentRepository,
}

impl FileSegmentRepository {
    /// Open (or start) the repository at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let records: Vec<SegmentRecord> = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(path = %path.display(), segments = records.len(), "segment repository opened");
        Ok(Self {
            path,
            inner: MemorySegmentRepository::from_records(records),
        })
    }

    fn persist(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(&self.inner.snapshot()?)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl SegmentRepository for FileSegmentRepository {
    fn create(
        &self,
        parent: Option<SegmentId>,
        source_key: StorageKey,
        duration_seconds: f64,
    ) -> Result<SegmentId, StorageError> {
        let id = self.inner.create(parent, source_key, duration_seconds)?;
        self.persist()?;
        Ok(id)
    }

    fn get(&self, id: SegmentId) -> Result<SegmentRecord, StorageError> {
        self.inner.get(id)
    }

    fn list_leaf_chains(&self) -> Result<Vec<SegmentId>, StorageError> {
        self.inner.list_leaf_chains()
    }

    fn delete(&self, chain: SegmentId) -> Result<Vec<SegmentRecord>, StorageError> {
        let removed = self.inner.delete(chain)?;
        self.persist()?;
        Ok(removed)
    }

    fn set_start_offset(&self, id: SegmentId, offset_seconds: f64) -> Result<(), StorageError> {
        self.inner.set_start_offset(id, offset_seconds)?;
        self.persist()
    }
}
