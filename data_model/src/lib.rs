use std::{
    collections::HashMap,
    fmt::{self, Display},
};

use blobd_utils::get_epoch_time_in_ms;
use serde::{Deserialize, Serialize};

/// Capacity of a blob's status ring. Once full, the next transition
/// overwrites the oldest one.
pub const MAX_STATUS_ENTRIES: usize = 256;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlobId(u16);

impl BlobId {
    pub fn new(id: u16) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u16 {
        self.0
    }
}

impl Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for BlobId {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
pub enum StatusCode {
    Ok,
    Pending,
    Failure,
    /// Never written by this build; produced only when decoding a snapshot
    /// that carries a state this build does not know about.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Status {
    pub code: StatusCode,
    #[serde(default)]
    pub msg: String,
}

impl Status {
    pub fn new(code: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.msg.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} - {}", self.code, self.msg)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusEntry {
    pub status: Status,
    pub timestamp: u64,
}

/// Fixed-capacity ring of status transitions. `index` is the slot the next
/// entry lands in; the authoritative state of a blob is the last entry
/// written, and an empty ring reads as healthy.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct BlobStatus {
    #[serde(default)]
    log: Vec<StatusEntry>,
    #[serde(default)]
    index: usize,
}

impl BlobStatus {
    pub fn record(&mut self, code: StatusCode, msg: impl Into<String>) {
        let entry = StatusEntry {
            status: Status::new(code, msg),
            timestamp: get_epoch_time_in_ms(),
        };
        let at = self.index % MAX_STATUS_ENTRIES;
        if self.log.len() < MAX_STATUS_ENTRIES {
            self.log.push(entry);
        } else {
            self.log[at] = entry;
        }
        self.index = (at + 1) % MAX_STATUS_ENTRIES;
    }

    pub fn record_ok(&mut self, msg: impl Into<String>) {
        self.record(StatusCode::Ok, msg);
    }

    pub fn record_pending(&mut self, msg: impl Into<String>) {
        self.record(StatusCode::Pending, msg);
    }

    pub fn record_failure(&mut self, msg: impl Into<String>) {
        self.record(StatusCode::Failure, msg);
    }

    pub fn last(&self) -> Option<&StatusEntry> {
        if self.log.is_empty() {
            return None;
        }
        let n = self.log.len();
        Some(&self.log[(self.index + n - 1) % n])
    }

    /// A blob with no recorded transitions reads as healthy.
    pub fn last_status(&self) -> StatusCode {
        self.last().map(|e| e.status.code).unwrap_or(StatusCode::Ok)
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// Renders the transition history newest first, one entry per line.
    pub fn dump(&self) -> String {
        if self.log.is_empty() {
            return StatusCode::Ok.to_string();
        }
        let n = self.log.len();
        let mut lines = Vec::with_capacity(n);
        for k in 0..n {
            let entry = &self.log[(self.index + n - 1 - k) % n];
            lines.push(format!("{} - {}", entry.timestamp, entry.status));
        }
        lines.join("\n")
    }
}

/// Opaque per-blob configuration. Defaulted when a create request carries
/// none.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct BlobOptions {
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// A single named binary object plus its transition history. The payload
/// itself lives in a separate data file on disk; this record is what gets
/// snapshotted alongside it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Blob {
    pub id: BlobId,
    pub location: String,
    #[serde(default)]
    pub options: BlobOptions,
    #[serde(default)]
    pub status: BlobStatus,
}

impl Blob {
    pub fn new(id: BlobId, location: impl Into<String>, options: BlobOptions) -> Self {
        Self {
            id,
            location: location.into(),
            options,
            status: BlobStatus::default(),
        }
    }
}
