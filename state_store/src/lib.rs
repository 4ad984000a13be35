pub mod index;
pub mod restore;

use std::sync::Arc;

use blob_store::{DataStream, StorageBackend, StorageError};
use bytes::Bytes;
use data_model::{Blob, BlobId, BlobOptions, StatusCode};
use futures::{Stream, StreamExt};
use index::{BlobEntry, BlobIndex, InsertError};
use restore::RestoreReport;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// How many id increments a create walks past its random starting point
/// before giving up on the id space.
pub const ID_PROBE_LIMIT: u16 = u16::MAX - 1;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("no blob at location {0:?}")]
    NotFound(String),

    #[error("a blob already exists at location {0:?}")]
    Conflict(String),

    #[error("blob id space exhausted")]
    IdSpaceExhausted,

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// What restore and collection do with a blob whose recorded state is not
/// one this build knows.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownBlobPolicy {
    /// Leave the files alone and keep the blob out of the index.
    #[default]
    Ignore,
    /// Treat it like a failed blob and reclaim its files.
    Reclaim,
}

/// The blob lifecycle engine: owns the index, drives every status
/// transition, and keeps the on-disk snapshots in step with memory.
///
/// All writes to one blob are serialized by that blob's entry lock;
/// operations on different blobs only contend on the index maps.
pub struct BlobdState {
    index: Arc<dyn BlobIndex>,
    storage: Arc<dyn StorageBackend>,
}

impl BlobdState {
    pub fn new(index: Arc<dyn BlobIndex>, storage: Arc<dyn StorageBackend>) -> Self {
        Self { index, storage }
    }

    /// Rebuilds the index from disk. Runs before the API starts listening,
    /// so nothing can observe or touch blobs while it walks the data root.
    pub async fn restore(
        &self,
        policy: UnknownBlobPolicy,
        clean: bool,
    ) -> Result<RestoreReport, StoreError> {
        restore::restore_state(self.index.as_ref(), self.storage.as_ref(), policy, clean).await
    }

    pub fn live_blobs(&self) -> usize {
        self.index.live_len()
    }

    /// Reserves an id and indexes a fresh entry for `location`. Insertion
    /// is what detects collisions, so two creates racing on the same id or
    /// location cannot both win.
    fn allocate(&self, location: &str) -> Result<Arc<BlobEntry>, StoreError> {
        if self.index.by_location(location).is_some() {
            return Err(StoreError::Conflict(location.to_string()));
        }
        let start: u16 = rand::random();
        let mut offset: u16 = 0;
        loop {
            let id = BlobId::new(start.wrapping_add(offset));
            if !self.index.contains_id(id) {
                let entry = Arc::new(BlobEntry::new(id, location, BlobOptions::default()));
                match self.index.insert(entry.clone()) {
                    Ok(()) => return Ok(entry),
                    Err(InsertError::LocationExists) => {
                        return Err(StoreError::Conflict(location.to_string()));
                    }
                    // lost the id to a concurrent create; keep probing
                    Err(InsertError::IdExists) => {}
                }
            }
            if offset == ID_PROBE_LIMIT {
                return Err(StoreError::IdSpaceExhausted);
            }
            offset += 1;
        }
    }

    /// Creates a blob at `location` and streams `payload` into it. The
    /// entry is indexed before the first disk write, so a failed create
    /// stays visible for collection instead of leaking files.
    pub async fn create(
        &self,
        location: &str,
        payload: impl Stream<Item = anyhow::Result<Bytes>> + Send + 'static,
    ) -> Result<u64, StoreError> {
        let entry = self.allocate(location)?;
        let mut blob = entry.record.write().await;

        if let Err(err) = self.storage.snapshot(&blob).await {
            self.fail(&mut blob, &format!("writing initial snapshot: {err}"))
                .await;
            return Err(err.into());
        }
        blob.status.record_ok("created");
        blob.status.record_pending("writing data");
        if let Err(err) = self.storage.snapshot(&blob).await {
            self.fail(&mut blob, &format!("writing snapshot: {err}")).await;
            return Err(err.into());
        }
        let written = match self.storage.write_data(entry.id, payload.boxed()).await {
            Ok(written) => written,
            Err(err) => {
                self.fail(&mut blob, &format!("writing data: {err}")).await;
                return Err(err.into());
            }
        };
        blob.status.record_ok("data written");
        if let Err(err) = self.storage.snapshot(&blob).await {
            self.fail(&mut blob, &format!("writing final snapshot: {err}"))
                .await;
            return Err(err.into());
        }
        info!(id = %entry.id, location, bytes = written, "created blob");
        Ok(written)
    }

    /// Looks up `location` and opens its payload for reading. The record
    /// comes back as an isolated copy taken under the read half of the
    /// entity lock; the payload stream is opened after the lock is
    /// released, so a slow reader never blocks writers.
    pub async fn get(&self, location: &str) -> Result<(Blob, DataStream), StoreError> {
        let entry = self
            .index
            .by_location(location)
            .ok_or_else(|| StoreError::NotFound(location.to_string()))?;
        let blob = entry.record.read().await.clone();
        let stream = self.storage.read_data(blob.id).await?;
        debug!(id = %blob.id, location, "streaming blob data");
        Ok((blob, stream))
    }

    /// Replaces the payload of the blob at `location`. Only blobs whose
    /// last transition is `Ok` can be updated.
    pub async fn update(
        &self,
        location: &str,
        payload: impl Stream<Item = anyhow::Result<Bytes>> + Send + 'static,
    ) -> Result<u64, StoreError> {
        let entry = self
            .index
            .by_location(location)
            .ok_or_else(|| StoreError::NotFound(location.to_string()))?;
        let mut blob = entry.record.write().await;

        match blob.status.last_status() {
            StatusCode::Ok => {}
            StatusCode::Pending => {
                // the write lock is exclusive, so a Pending state here means
                // a previous writer never recorded its outcome
                return Err(StoreError::InvariantViolation(format!(
                    "blob at {location:?} observed in Pending state under the write lock"
                )));
            }
            other => {
                return Err(StoreError::InvariantViolation(format!(
                    "updating a blob in {other} state is not supported; delete it and create a new one"
                )));
            }
        }

        blob.status.record_pending("updating data");
        if let Err(err) = self.storage.snapshot(&blob).await {
            self.fail(&mut blob, &format!("writing snapshot: {err}")).await;
            return Err(err.into());
        }
        let written = match self.storage.write_data(entry.id, payload.boxed()).await {
            Ok(written) => written,
            Err(err) => {
                self.fail(&mut blob, &format!("writing data: {err}")).await;
                return Err(err.into());
            }
        };
        blob.status.record_ok("data updated");
        if let Err(err) = self.storage.snapshot(&blob).await {
            self.fail(&mut blob, &format!("writing final snapshot: {err}"))
                .await;
            return Err(err.into());
        }
        info!(id = %entry.id, location, bytes = written, "updated blob");
        Ok(written)
    }

    /// Soft-deletes the blob at `location`: the tombstone transition is
    /// snapshotted and the location released, while the id and the files
    /// stay behind for the collector.
    pub async fn delete(&self, location: &str) -> Result<(), StoreError> {
        let entry = self
            .index
            .by_location(location)
            .ok_or_else(|| StoreError::NotFound(location.to_string()))?;
        let mut blob = entry.record.write().await;

        blob.status.record_failure("Deleted");
        // the entry stays indexed on failure so the delete can be retried
        self.storage.snapshot(&blob).await?;
        self.index.remove_location(location);
        info!(id = %entry.id, location, "deleted blob");
        Ok(())
    }

    /// Appends the failure to the status log and makes a best effort to
    /// get it on disk so collection can find the blob.
    async fn fail(&self, blob: &mut Blob, msg: &str) {
        error!(id = %blob.id, location = %blob.location, "{msg}");
        blob.status.record_failure(msg);
        if let Err(err) = self.storage.snapshot(blob).await {
            warn!(id = %blob.id, "cannot persist failure mark: {err}");
        }
    }
}
