use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use data_model::Blob;

use crate::StorageError;

/// Marker every encoded state line starts with. The version suffix is bumped
/// whenever the record layout changes.
pub const STATE_LINE_PREFIX: &str = "BLOBD_STATE_";

/// Version written by this build.
pub const STATE_VERSION: &str = "v1";

/// Encodes a blob record into a single self-identifying line:
/// `BLOBD_STATE_v1:<base64(json(record))>`.
pub fn encode_state_line(blob: &Blob) -> Result<String, StorageError> {
    let json = serde_json::to_vec(blob)?;
    Ok(format!(
        "{}{}:{}",
        STATE_LINE_PREFIX,
        STATE_VERSION,
        BASE64.encode(json)
    ))
}

pub fn decode_state_line(line: &str) -> Result<Blob, StorageError> {
    let line = line.trim();
    let Some((head, payload)) = line.split_once(':') else {
        return Err(StorageError::Corrupt(
            "state line has no ':' separator".to_string(),
        ));
    };
    let Some(version) = head.strip_prefix(STATE_LINE_PREFIX) else {
        return Err(StorageError::Corrupt(format!(
            "state line marker {head:?} is not a blob state marker"
        )));
    };
    if version != STATE_VERSION {
        return Err(StorageError::Corrupt(format!(
            "unsupported state version {version:?}"
        )));
    }
    let json = BASE64
        .decode(payload)
        .map_err(|e| StorageError::Corrupt(format!("state line is not valid base64: {e}")))?;
    Ok(serde_json::from_slice(&json)?)
}

/// Renders the full state file: the machine-readable state line, a blank
/// separator, then the transition history for humans poking at the disk.
pub fn render_state_file(blob: &Blob) -> Result<String, StorageError> {
    let line = encode_state_line(blob)?;
    Ok(format!("{}\n\n{}\n", line, blob.status.dump()))
}

/// Recovers the blob record from a state file by scanning for the state
/// line. Everything else in the file is decoration.
pub fn parse_state_file(content: &str) -> Result<Blob, StorageError> {
    for line in content.lines() {
        if line.contains(STATE_LINE_PREFIX) {
            return decode_state_line(line);
        }
    }
    Err(StorageError::Corrupt(
        "no state line found in state file".to_string(),
    ))
}
