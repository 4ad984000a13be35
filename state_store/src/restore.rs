use std::sync::Arc;

use blob_store::{cleanup, StorageBackend};
use data_model::{Blob, StatusCode};
use tracing::{info, warn};

use crate::{
    index::{BlobEntry, BlobIndex},
    StoreError,
    UnknownBlobPolicy,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: usize,
    pub failed: usize,
    pub cleaned: usize,
}

/// Rebuilds the index from the data root. Blobs whose last transition is
/// `Ok` come back live; blobs caught mid-write get a failure mark and are
/// left for collection; directories that cannot be read are skipped.
pub async fn restore_state(
    index: &dyn BlobIndex,
    storage: &dyn StorageBackend,
    policy: UnknownBlobPolicy,
    clean: bool,
) -> Result<RestoreReport, StoreError> {
    let candidates = storage.list_candidates().await?;
    let mut report = RestoreReport::default();
    let mut failed: Vec<Blob> = Vec::new();

    for id in candidates {
        let mut blob = match storage.read_record(id).await {
            Ok(blob) => blob,
            Err(err) => {
                warn!(id = %id, "skipping unreadable blob directory: {err}");
                continue;
            }
        };
        match blob.status.last_status() {
            StatusCode::Ok => {
                let entry = Arc::new(BlobEntry::from_record(blob));
                let location = entry.location.clone();
                if let Err(err) = index.insert(entry) {
                    warn!(id = %id, location = %location, "cannot restore blob: {err}");
                    continue;
                }
                report.restored += 1;
            }
            StatusCode::Pending => {
                warn!(id = %id, location = %blob.location, "blob was caught mid-write; marking failed");
                blob.status
                    .record_failure("found in Pending state during restore");
                if let Err(err) = storage.snapshot(&blob).await {
                    warn!(id = %id, "cannot persist failure mark: {err}");
                }
                failed.push(blob);
            }
            StatusCode::Failure => failed.push(blob),
            StatusCode::Unknown => match policy {
                UnknownBlobPolicy::Reclaim => {
                    warn!(id = %id, location = %blob.location, "blob is in an unrecognized state; reclaiming");
                    failed.push(blob);
                }
                UnknownBlobPolicy::Ignore => {
                    warn!(id = %id, location = %blob.location, "blob is in an unrecognized state; leaving it on disk");
                }
            },
        }
    }

    report.failed = failed.len();
    if clean {
        report.cleaned = cleanup(storage, &failed).await;
    }
    info!(
        restored = report.restored,
        failed = report.failed,
        cleaned = report.cleaned,
        "restored blob state"
    );
    Ok(report)
}
