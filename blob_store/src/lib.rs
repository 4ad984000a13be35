pub mod codec;

use std::path::{Path, PathBuf};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use data_model::{Blob, BlobId};
use futures::stream::BoxStream;
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncWriteExt},
    sync::mpsc,
};
use tokio_stream::{wrappers::UnboundedReceiverStream, StreamExt};
use tracing::{debug, info, warn};

/// Name of the record snapshot inside a blob directory.
pub const STATE_FILE_NAME: &str = "state";

/// Name of the payload file inside a blob directory.
pub const DATA_FILE_NAME: &str = "data";

const READ_CHUNK_SIZE: usize = 64 * 1024;

pub type DataStream = BoxStream<'static, anyhow::Result<Bytes>>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization failure: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("blob {0} has no data file")]
    DataMissing(BlobId),

    #[error("blob {0} has no state file")]
    StateMissing(BlobId),

    #[error("corrupt state record: {0}")]
    Corrupt(String),
}

/// Persistence surface for blob records and payloads. One directory per
/// blob id, holding a `state` snapshot and a `data` payload file.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Persists the blob record into its directory, creating the directory
    /// on first write. The payload file is untouched.
    async fn snapshot(&self, blob: &Blob) -> Result<(), StorageError>;

    /// Reads the record back from the blob's state file.
    async fn read_record(&self, id: BlobId) -> Result<Blob, StorageError>;

    /// Ids of every plausible blob directory on disk. Entries whose names
    /// do not parse as blob ids are skipped.
    async fn list_candidates(&self) -> Result<Vec<BlobId>, StorageError>;

    /// Streams `payload` into the blob's data file, replacing any previous
    /// contents. Returns the number of bytes written.
    async fn write_data(&self, id: BlobId, payload: DataStream) -> Result<u64, StorageError>;

    /// Opens the blob's payload for streaming reads.
    async fn read_data(&self, id: BlobId) -> Result<DataStream, StorageError>;

    /// Removes the blob's directory and everything in it.
    async fn remove(&self, id: BlobId) -> Result<(), StorageError>;
}

/// Directory-per-blob storage rooted at a single data directory.
pub struct DirStorage {
    root: PathBuf,
}

impl DirStorage {
    pub async fn new(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        info!(path = %root.display(), "initialized blob data root");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_dir(&self, id: BlobId) -> PathBuf {
        self.root.join(id.to_string())
    }

    /// Finds the state file by listing the directory, so a directory that
    /// exists but holds no snapshot comes back as `None` instead of an
    /// error.
    async fn locate_state_file(&self, id: BlobId) -> Result<Option<PathBuf>, StorageError> {
        let dir = self.blob_dir(id);
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name() == STATE_FILE_NAME {
                return Ok(Some(entry.path()));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl StorageBackend for DirStorage {
    async fn snapshot(&self, blob: &Blob) -> Result<(), StorageError> {
        let dir = self.blob_dir(blob.id);
        fs::create_dir_all(&dir).await?;
        let content = codec::render_state_file(blob)?;
        fs::write(dir.join(STATE_FILE_NAME), content).await?;
        debug!(id = %blob.id, location = %blob.location, "snapshotted blob record");
        Ok(())
    }

    async fn read_record(&self, id: BlobId) -> Result<Blob, StorageError> {
        // A listing taken right after a write has been seen to come back
        // empty; retry once before giving up.
        let state_path = match self.locate_state_file(id).await {
            Ok(Some(path)) => path,
            Ok(None) | Err(_) => self
                .locate_state_file(id)
                .await?
                .ok_or(StorageError::StateMissing(id))?,
        };
        let content = fs::read_to_string(&state_path).await?;
        codec::parse_state_file(&content)
    }

    async fn list_candidates(&self) -> Result<Vec<BlobId>, StorageError> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            match name.parse::<u16>() {
                Ok(id) => ids.push(BlobId::new(id)),
                Err(_) => debug!(name, "skipping non-blob entry in data root"),
            }
        }
        Ok(ids)
    }

    async fn write_data(&self, id: BlobId, mut payload: DataStream) -> Result<u64, StorageError> {
        let path = self.blob_dir(id).join(DATA_FILE_NAME);
        let mut file = fs::File::create(&path).await?;
        let mut written = 0u64;
        while let Some(chunk) = payload.next().await {
            let chunk = chunk.map_err(std::io::Error::other)?;
            written += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        debug!(id = %id, bytes = written, "wrote blob data");
        Ok(written)
    }

    async fn read_data(&self, id: BlobId) -> Result<DataStream, StorageError> {
        let path = self.blob_dir(id).join(DATA_FILE_NAME);
        let mut file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                // A vanished payload inside an existing blob directory is
                // its own failure mode; a vanished directory is plain i/o.
                if fs::metadata(self.blob_dir(id)).await.is_ok() {
                    return Err(StorageError::DataMissing(id));
                }
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
                match file.read_buf(&mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        if tx.send(Ok(buf.freeze())).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        let _ = tx.send(Err(anyhow!("reading blob {id} data: {err}")));
                        break;
                    }
                }
            }
        });
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn remove(&self, id: BlobId) -> Result<(), StorageError> {
        fs::remove_dir_all(self.blob_dir(id)).await?;
        debug!(id = %id, "removed blob directory");
        Ok(())
    }
}

/// Removes the directories of the given blobs, logging and skipping any
/// that fail. Returns how many were actually removed.
pub async fn cleanup(storage: &dyn StorageBackend, blobs: &[Blob]) -> usize {
    let mut cleaned = 0;
    for blob in blobs {
        match storage.remove(blob.id).await {
            Ok(()) => {
                info!(id = %blob.id, location = %blob.location, "removed stale blob");
                cleaned += 1;
            }
            Err(err) => {
                warn!(id = %blob.id, location = %blob.location, "failed to remove stale blob: {err}");
            }
        }
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};
    use data_model::{Blob, BlobId, BlobOptions};
    use futures::StreamExt;
    use tempfile::TempDir;

    use super::{cleanup, DataStream, DirStorage, StorageBackend, StorageError, STATE_FILE_NAME};

    fn payload_stream(chunks: Vec<Bytes>) -> DataStream {
        futures::stream::iter(
            chunks
                .into_iter()
                .map(Ok)
                .collect::<Vec<anyhow::Result<Bytes>>>(),
        )
        .boxed()
    }

    async fn collect(mut stream: DataStream) -> Vec<u8> {
        let mut out = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out.to_vec()
    }

    fn test_blob(id: u16, location: &str) -> Blob {
        let mut blob = Blob::new(BlobId::new(id), location, BlobOptions::default());
        blob.status.record_ok("created");
        blob
    }

    #[tokio::test]
    async fn test_snapshot_then_read_record() {
        let tmp = TempDir::new().unwrap();
        let storage = DirStorage::new(tmp.path()).await.unwrap();

        let blob = test_blob(37, "backups/mon");
        storage.snapshot(&blob).await.unwrap();

        let read = storage.read_record(blob.id).await.unwrap();
        assert_eq!(read, blob);

        // the state file itself leads with the machine line, then history
        let raw = std::fs::read_to_string(tmp.path().join("37").join(STATE_FILE_NAME)).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert!(lines[0].starts_with("BLOBD_STATE_v1:"));
        assert_eq!(lines[1], "");
        assert!(lines[2].contains("Ok - created"));
    }

    #[tokio::test]
    async fn test_write_then_read_data() {
        let tmp = TempDir::new().unwrap();
        let storage = DirStorage::new(tmp.path()).await.unwrap();

        let blob = test_blob(12, "logs/today");
        storage.snapshot(&blob).await.unwrap();
        let written = storage
            .write_data(
                blob.id,
                payload_stream(vec![
                    Bytes::from_static(b"hello "),
                    Bytes::from_static(b"blob "),
                    Bytes::from_static(b"world"),
                ]),
            )
            .await
            .unwrap();
        assert_eq!(written, 16);

        let stream = storage.read_data(blob.id).await.unwrap();
        assert_eq!(collect(stream).await, b"hello blob world");
    }

    #[tokio::test]
    async fn test_write_data_replaces_previous_payload() {
        let tmp = TempDir::new().unwrap();
        let storage = DirStorage::new(tmp.path()).await.unwrap();

        let blob = test_blob(5, "configs/app");
        storage.snapshot(&blob).await.unwrap();
        storage
            .write_data(
                blob.id,
                payload_stream(vec![Bytes::from_static(b"a much longer first payload")]),
            )
            .await
            .unwrap();
        storage
            .write_data(blob.id, payload_stream(vec![Bytes::from_static(b"short")]))
            .await
            .unwrap();

        let stream = storage.read_data(blob.id).await.unwrap();
        assert_eq!(collect(stream).await, b"short");
    }

    #[tokio::test]
    async fn test_missing_data_file_is_distinct_from_missing_directory() {
        let tmp = TempDir::new().unwrap();
        let storage = DirStorage::new(tmp.path()).await.unwrap();

        // directory exists, payload never written
        let blob = test_blob(3, "empty/one");
        storage.snapshot(&blob).await.unwrap();
        let err = storage.read_data(blob.id).await.err().unwrap();
        assert!(matches!(err, StorageError::DataMissing(id) if id == blob.id));

        // directory never created
        let err = storage.read_data(BlobId::new(44)).await.err().unwrap();
        assert!(matches!(err, StorageError::Io(_)));
    }

    #[tokio::test]
    async fn test_read_record_without_state_file() {
        let tmp = TempDir::new().unwrap();
        let storage = DirStorage::new(tmp.path()).await.unwrap();

        std::fs::create_dir(tmp.path().join("9")).unwrap();
        let err = storage.read_record(BlobId::new(9)).await.unwrap_err();
        assert!(matches!(err, StorageError::StateMissing(id) if id.get() == 9));
    }

    #[tokio::test]
    async fn test_read_record_with_corrupt_state_file() {
        let tmp = TempDir::new().unwrap();
        let storage = DirStorage::new(tmp.path()).await.unwrap();

        std::fs::create_dir(tmp.path().join("21")).unwrap();
        std::fs::write(tmp.path().join("21").join(STATE_FILE_NAME), "scribbles\n").unwrap();
        let err = storage.read_record(BlobId::new(21)).await.unwrap_err();
        assert!(matches!(err, StorageError::Corrupt(_)));
    }

    #[tokio::test]
    async fn test_list_candidates_skips_foreign_entries() {
        let tmp = TempDir::new().unwrap();
        let storage = DirStorage::new(tmp.path()).await.unwrap();

        storage.snapshot(&test_blob(12, "a")).await.unwrap();
        storage.snapshot(&test_blob(907, "b")).await.unwrap();
        std::fs::create_dir(tmp.path().join("not-a-blob")).unwrap();
        std::fs::create_dir(tmp.path().join("70000")).unwrap();
        std::fs::write(tmp.path().join("55"), "a file, not a directory").unwrap();

        let mut ids: Vec<u16> = storage
            .list_candidates()
            .await
            .unwrap()
            .into_iter()
            .map(|id| id.get())
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![12, 907]);
    }

    #[tokio::test]
    async fn test_cleanup_removes_and_counts() {
        let tmp = TempDir::new().unwrap();
        let storage = DirStorage::new(tmp.path()).await.unwrap();

        let kept = test_blob(1, "keep");
        let doomed = test_blob(2, "doom");
        storage.snapshot(&kept).await.unwrap();
        storage.snapshot(&doomed).await.unwrap();

        // one of the two targets is already gone; it is skipped, not fatal
        let ghost = test_blob(3, "ghost");
        let cleaned = cleanup(&storage, &[doomed.clone(), ghost]).await;
        assert_eq!(cleaned, 1);

        assert!(tmp.path().join("1").exists());
        assert!(!tmp.path().join("2").exists());
    }
}
