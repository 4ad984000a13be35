use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use data_model::{Blob, BlobId, BlobOptions};

/// A blob plus the lock that serializes its writes. `id` and `location`
/// never change after insertion and are readable without the lock; the
/// record behind the lock is the mutable truth.
pub struct BlobEntry {
    pub id: BlobId,
    pub location: String,
    pub record: tokio::sync::RwLock<Blob>,
}

impl BlobEntry {
    pub fn new(id: BlobId, location: impl Into<String>, options: BlobOptions) -> Self {
        let location = location.into();
        Self {
            id,
            location: location.clone(),
            record: tokio::sync::RwLock::new(Blob::new(id, location, options)),
        }
    }

    pub fn from_record(blob: Blob) -> Self {
        Self {
            id: blob.id,
            location: blob.location.clone(),
            record: tokio::sync::RwLock::new(blob),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InsertError {
    #[error("location already indexed")]
    LocationExists,

    #[error("blob id already in use")]
    IdExists,
}

/// Live lookup table for blobs. Insertion is atomic across both keys, so
/// concurrent creates cannot double-book an id or a location.
pub trait BlobIndex: Send + Sync {
    fn insert(&self, entry: Arc<BlobEntry>) -> Result<(), InsertError>;

    fn by_id(&self, id: BlobId) -> Option<Arc<BlobEntry>>;

    fn by_location(&self, location: &str) -> Option<Arc<BlobEntry>>;

    fn contains_id(&self, id: BlobId) -> bool;

    /// Releases the location key so it can be created again. The id stays
    /// reserved until the blob's files are collected and the process
    /// restarts.
    fn remove_location(&self, location: &str) -> Option<Arc<BlobEntry>>;

    /// Number of blobs reachable by location.
    fn live_len(&self) -> usize;
}

#[derive(Default)]
pub struct InMemoryIndex {
    inner: RwLock<IndexMaps>,
}

#[derive(Default)]
struct IndexMaps {
    by_id: HashMap<BlobId, Arc<BlobEntry>>,
    by_location: HashMap<String, Arc<BlobEntry>>,
}

impl BlobIndex for InMemoryIndex {
    fn insert(&self, entry: Arc<BlobEntry>) -> Result<(), InsertError> {
        let mut maps = self.inner.write().unwrap();
        if !entry.location.is_empty() && maps.by_location.contains_key(&entry.location) {
            return Err(InsertError::LocationExists);
        }
        if maps.by_id.contains_key(&entry.id) {
            return Err(InsertError::IdExists);
        }
        maps.by_id.insert(entry.id, entry.clone());
        if !entry.location.is_empty() {
            maps.by_location.insert(entry.location.clone(), entry);
        }
        Ok(())
    }

    fn by_id(&self, id: BlobId) -> Option<Arc<BlobEntry>> {
        self.inner.read().unwrap().by_id.get(&id).cloned()
    }

    fn by_location(&self, location: &str) -> Option<Arc<BlobEntry>> {
        self.inner.read().unwrap().by_location.get(location).cloned()
    }

    fn contains_id(&self, id: BlobId) -> bool {
        self.inner.read().unwrap().by_id.contains_key(&id)
    }

    fn remove_location(&self, location: &str) -> Option<Arc<BlobEntry>> {
        self.inner.write().unwrap().by_location.remove(location)
    }

    fn live_len(&self) -> usize {
        self.inner.read().unwrap().by_location.len()
    }
}
