use std::{sync::Arc, time::Duration};

use anyhow::Result;
use blob_store::StorageBackend;
use data_model::StatusCode;
use metrics::{gc_stats, Timer};
use state_store::UnknownBlobPolicy;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};

pub struct Gc {
    storage: Arc<dyn StorageBackend>,
    interval: Duration,
    policy: UnknownBlobPolicy,
    shutdown_rx: tokio::sync::watch::Receiver<()>,
    metrics: gc_stats::Metrics,
}

impl Gc {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        interval: Duration,
        policy: UnknownBlobPolicy,
        shutdown_rx: tokio::sync::watch::Receiver<()>,
    ) -> Self {
        Self {
            storage,
            interval,
            policy,
            shutdown_rx,
            metrics: gc_stats::Metrics::new(),
        }
    }

    pub async fn start(&self) {
        info!("starting garbage collector");
        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.run().await {
                        error!("error collecting blobs: {err:?}");
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("garbage collector shutting down");
                    break;
                }
            }
        }
    }

    /// One collection pass: rescans the data root and reclaims every blob
    /// whose last recorded transition marks it reclaimable. Works from disk
    /// alone, so it also collects blobs no index has ever seen.
    pub async fn run(&self) -> Result<usize> {
        let _timer = Timer::start(&self.metrics.run_latency);
        self.metrics.runs.add(1, &[]);

        let candidates = self.storage.list_candidates().await?;
        let mut reclaimable = Vec::new();
        for id in candidates {
            let record = match self.storage.read_record(id).await {
                Ok(record) => record,
                Err(err) => {
                    warn!(id = %id, "skipping blob with unreadable record: {err}");
                    continue;
                }
            };
            match record.status.last_status() {
                StatusCode::Failure => reclaimable.push(record),
                StatusCode::Unknown if self.policy == UnknownBlobPolicy::Reclaim => {
                    reclaimable.push(record);
                }
                _ => {}
            }
        }
        if reclaimable.is_empty() {
            return Ok(0);
        }
        let cleaned = blob_store::cleanup(self.storage.as_ref(), &reclaimable).await;
        self.metrics.reclaimed.add(cleaned as u64, &[]);
        info!(cleaned, "collected reclaimable blobs");
        Ok(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use blob_store::DirStorage;
    use bytes::Bytes;
    use data_model::{Blob, BlobId, BlobOptions};
    use futures::StreamExt;
    use state_store::{index::InMemoryIndex, BlobdState};
    use tokio::sync::watch;

    use super::*;

    fn payload(bytes: &'static [u8]) -> impl futures::Stream<Item = anyhow::Result<Bytes>> + Send + 'static {
        futures::stream::iter(vec![Ok(Bytes::from_static(bytes))])
    }

    #[tokio::test]
    async fn test_gc_reclaims_failed_blobs_and_keeps_live_ones() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(DirStorage::new(temp_dir.path()).await.unwrap());
        let state = BlobdState::new(Arc::new(InMemoryIndex::default()), storage.clone());

        state.create("keep", payload(b"live data")).await.unwrap();
        state.create("drop", payload(b"doomed")).await.unwrap();
        let (doomed, _) = state.get("drop").await.unwrap();
        state.delete("drop").await.unwrap();

        let (_tx, rx) = watch::channel(());
        let gc = Gc::new(
            storage.clone(),
            Duration::from_secs(5),
            UnknownBlobPolicy::default(),
            rx,
        );

        let cleaned = gc.run().await.unwrap();
        assert_eq!(cleaned, 1);
        assert!(!temp_dir.path().join(doomed.id.to_string()).exists());

        // the live blob is untouched and still readable
        let (_, mut stream) = state.get("keep").await.unwrap();
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(out, b"live data");

        // a second pass finds nothing left to do
        assert_eq!(gc.run().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_gc_leaves_pending_blobs_alone() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(DirStorage::new(temp_dir.path()).await.unwrap());

        // a write that is still in flight as far as the disk knows
        let mut blob = Blob::new(BlobId::new(41), "inflight", BlobOptions::default());
        blob.status.record_ok("created");
        blob.status.record_pending("writing data");
        storage.snapshot(&blob).await.unwrap();

        let (_tx, rx) = watch::channel(());
        let gc = Gc::new(
            storage.clone(),
            Duration::from_secs(5),
            UnknownBlobPolicy::default(),
            rx,
        );
        assert_eq!(gc.run().await.unwrap(), 0);
        assert!(temp_dir.path().join("41").exists());
    }

    #[tokio::test]
    async fn test_gc_unknown_blob_policy() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(DirStorage::new(temp_dir.path()).await.unwrap());

        let mut blob = Blob::new(BlobId::new(8), "foreign", BlobOptions::default());
        blob.status.record(StatusCode::Unknown, "written by a newer build");
        storage.snapshot(&blob).await.unwrap();

        let (_tx, rx) = watch::channel(());
        let gc = Gc::new(
            storage.clone(),
            Duration::from_secs(5),
            UnknownBlobPolicy::Ignore,
            rx.clone(),
        );
        assert_eq!(gc.run().await.unwrap(), 0);
        assert!(temp_dir.path().join("8").exists());

        let gc = Gc::new(
            storage.clone(),
            Duration::from_secs(5),
            UnknownBlobPolicy::Reclaim,
            rx,
        );
        assert_eq!(gc.run().await.unwrap(), 1);
        assert!(!temp_dir.path().join("8").exists());
    }

    #[tokio::test]
    async fn test_gc_stops_on_shutdown_signal() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(DirStorage::new(temp_dir.path()).await.unwrap());

        let (tx, rx) = watch::channel(());
        let gc = Arc::new(Gc::new(
            storage,
            Duration::from_secs(3600),
            UnknownBlobPolicy::default(),
            rx,
        ));
        let handle = tokio::spawn({
            let gc = gc.clone();
            async move { gc.start().await }
        });

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("gc loop did not stop after shutdown signal")
            .unwrap();
    }
}
