//! JSON snapshot helpers shared by the per-project stores
//!
//! Snapshots are written to a sibling temp file, synced, then renamed over
//! the target so a crash leaves either the old or the new file, never half
//! of one.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use sdk::errors::{EngineError, EngineResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Serialize `value` as pretty JSON and atomically replace `path`.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> EngineResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_bytes_atomic(path, &bytes)
}

pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> EngineResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp = temp_path(path);
    {
        let mut file = File::create(&temp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&temp, path)?;
    Ok(())
}

/// Read a JSON snapshot. A missing file is `Ok(None)`; an unparseable one is
/// `CorruptState`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> EngineResult<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(EngineError::Io(e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| EngineError::CorruptState {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}
