//! Append-only audit log
//!
//! One JSON object per line in `audit.jsonl`. Appends are serialized through
//! a per-log mutex and written with a single `write_all`, so every record is
//! either fully present or shows up as a torn trailing line. Readers never take
//! the writer lock: they capture the file length at the start of a read and
//! only look at bytes below it. Lines that fail to parse are skipped with a
//! warning.
//!
//! When the file grows past the rotation threshold it is renamed to
//! `audit.<timestamp>.jsonl` and a fresh file is started. Sequence numbers
//! keep counting across rotations.

mod reader;

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use sdk::errors::{EngineError, EngineResult};
use sdk::types::Recipient;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use reader::AuditStream;
use reader::ReverseLines;

/// Durable record of something that happened in a project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub id: Uuid,
    pub project: String,
    pub event_type: String,
    pub sender: String,
    pub recipient: Recipient,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

struct Writer {
    file: File,
    next_seq: u64,
    last_timestamp: Option<DateTime<Utc>>,
    bytes: u64,
}

/// Per-project append-only log
pub struct AuditLog {
    path: PathBuf,
    project: String,
    rotate_bytes: u64,
    writer: Mutex<Writer>,
}

impl AuditLog {
    /// Open (or create) the log at `path`, resuming its sequence numbering.
    pub fn open(
        path: impl Into<PathBuf>,
        project: impl Into<String>,
        rotate_bytes: u64,
    ) -> EngineResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut bytes = file.metadata()?.len();

        // Terminate a torn record left by a crash so the next append starts clean
        if bytes > 0 && !reader::ends_with_newline(&path, bytes)? {
            file.write_all(b"\n")?;
            bytes += 1;
            warn!(path = ?path, "Audit log ended mid-record; sealed torn line");
        }

        let last = ReverseLines::open(&path, bytes)?
            .filter_map(|line| serde_json::from_slice::<AuditEntry>(&line).ok())
            .next();

        let writer = Writer {
            file,
            next_seq: last.as_ref().map_or(0, |e| e.seq + 1),
            last_timestamp: last.map(|e| e.timestamp),
            bytes,
        };

        Ok(Self {
            path,
            project: project.into(),
            rotate_bytes,
            writer: Mutex::new(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. Safe to call from many threads at once.
    pub fn append(
        &self,
        event_type: &str,
        sender: &str,
        recipient: Recipient,
        payload: serde_json::Value,
    ) -> EngineResult<AuditEntry> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        // Clock steps backwards must not break timestamp ordering
        let now = Utc::now();
        let timestamp = match writer.last_timestamp {
            Some(last) if last > now => last,
            _ => now,
        };

        let entry = AuditEntry {
            seq: writer.next_seq,
            id: Uuid::new_v4(),
            project: self.project.clone(),
            event_type: event_type.to_string(),
            sender: sender.to_string(),
            recipient,
            payload,
            timestamp,
        };

        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        writer.file.write_all(&line)?;
        writer.file.flush()?;

        writer.next_seq += 1;
        writer.last_timestamp = Some(timestamp);
        writer.bytes += line.len() as u64;

        debug!(
            project = %self.project,
            event_type = %entry.event_type,
            seq = entry.seq,
            "Audit entry appended"
        );

        if self.rotate_bytes > 0 && writer.bytes > self.rotate_bytes {
            self.rotate(&mut writer)?;
        }

        Ok(entry)
    }

    fn rotate(&self, writer: &mut Writer) -> EngineResult<()> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6f");
        let archive = self
            .path
            .with_file_name(format!("audit.{}-{}.jsonl", stamp, writer.next_seq));
        fs::rename(&self.path, &archive)?;
        writer.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writer.bytes = 0;
        info!(project = %self.project, archive = ?archive, "Audit log rotated");
        Ok(())
    }

    fn snapshot_len(&self) -> EngineResult<u64> {
        match fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(EngineError::Io(e)),
        }
    }

    fn newest_first(&self) -> EngineResult<impl Iterator<Item = AuditEntry>> {
        let len = self.snapshot_len()?;
        let path = self.path.clone();
        Ok(ReverseLines::open(&self.path, len)?.filter_map(move |line| {
            match serde_json::from_slice::<AuditEntry>(&line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(path = ?path, error = %e, "Skipping unreadable audit line");
                    None
                }
            }
        }))
    }

    /// Scan backwards from the newest entry, stopping after `limit` matches.
    ///
    /// Matches are returned oldest first. `limit = None` scans the whole file.
    pub fn search(
        &self,
        event_type: Option<&str>,
        sender: Option<&str>,
        limit: Option<usize>,
    ) -> EngineResult<Vec<AuditEntry>> {
        let matches = self.newest_first()?.filter(|entry| {
            event_type.map_or(true, |t| entry.event_type == t)
                && sender.map_or(true, |s| entry.sender == s)
        });

        let mut found: Vec<AuditEntry> = match limit {
            Some(limit) => matches.take(limit).collect(),
            None => matches.collect(),
        };
        found.reverse();
        Ok(found)
    }

    /// The `limit` newest entries, oldest first.
    pub fn get_recent(&self, limit: usize) -> EngineResult<Vec<AuditEntry>> {
        self.search(None, None, Some(limit))
    }

    /// Lazy forward iteration over entries with `timestamp >= since`.
    ///
    /// The stream ends at the file length observed when it was created;
    /// calling `stream` again picks up newer entries.
    pub fn stream(&self, since: Option<DateTime<Utc>>) -> EngineResult<AuditStream> {
        let len = self.snapshot_len()?;
        AuditStream::open(&self.path, len, since)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> AuditLog {
        AuditLog::open(dir.path().join("audit.jsonl"), "demo", 0).unwrap()
    }

    #[test]
    fn test_append_and_search() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir);
        log.append("step_completed", "producer", Recipient::Broadcast, json!({"step": 1}))
            .unwrap();
        log.append(
            "agent_message_handoff",
            "plot_architect",
            Recipient::agent("worldbuilder"),
            json!({}),
        )
        .unwrap();
        log.append("step_completed", "producer", Recipient::Broadcast, json!({"step": 2}))
            .unwrap();

        let steps = log.search(Some("step_completed"), None, Some(10)).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].payload["step"], 1);
        assert_eq!(steps[1].payload["step"], 2);

        let by_sender = log.search(None, Some("plot_architect"), None).unwrap();
        assert_eq!(by_sender.len(), 1);

        assert!(log.search(Some("missing"), None, Some(5)).unwrap().is_empty());
    }

    #[test]
    fn test_search_limit_keeps_newest() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir);
        for i in 0..10 {
            log.append("tick", "ui", Recipient::Broadcast, json!({ "i": i })).unwrap();
        }
        let recent = log.get_recent(3).unwrap();
        let seqs: Vec<u64> = recent.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![7, 8, 9]);
    }

    #[test]
    fn test_torn_trailing_line_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let log = AuditLog::open(&path, "demo", 0).unwrap();
            log.append("a", "x", Recipient::Broadcast, json!({})).unwrap();
            log.append("b", "x", Recipient::Broadcast, json!({})).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"seq\": 2, \"id\": \"trunc").unwrap();

        let log = AuditLog::open(&path, "demo", 0).unwrap();
        let all: Vec<AuditEntry> = log.stream(None).unwrap().collect();
        assert_eq!(all.len(), 2);
        assert_eq!(log.get_recent(5).unwrap().len(), 2);
    }

    #[test]
    fn test_sequence_resumes_after_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let log = open(&dir);
            log.append("a", "x", Recipient::Broadcast, json!({})).unwrap();
        }
        let log = open(&dir);
        let entry = log.append("b", "x", Recipient::Broadcast, json!({})).unwrap();
        assert_eq!(entry.seq, 1);
    }

    #[test]
    fn test_stream_since_filters_by_time() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir);
        let first = log.append("a", "x", Recipient::Broadcast, json!({})).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = log.append("b", "x", Recipient::Broadcast, json!({})).unwrap();

        let since: Vec<AuditEntry> = log.stream(Some(second.timestamp)).unwrap().collect();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].id, second.id);

        let everything: Vec<AuditEntry> = log.stream(Some(first.timestamp)).unwrap().collect();
        assert_eq!(everything.len(), 2);
    }

    #[test]
    fn test_rotation_archives_and_continues() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::open(dir.path().join("audit.jsonl"), "demo", 200).unwrap();
        for i in 0..5 {
            log.append("tick", "ui", Recipient::Broadcast, json!({ "i": i })).unwrap();
        }
        let archives: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.starts_with("audit.") && name != "audit.jsonl"
            })
            .collect();
        assert!(!archives.is_empty());

        let next = log.append("tick", "ui", Recipient::Broadcast, json!({})).unwrap();
        assert_eq!(next.seq, 5);
    }

    #[test]
    fn test_concurrent_appends_are_whole_records() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(open(&dir));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        log.append("tick", &format!("t{}", t), Recipient::Broadcast, json!({ "i": i }))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let all: Vec<AuditEntry> = log.stream(None).unwrap().collect();
        assert_eq!(all.len(), 100);
        let seqs: Vec<u64> = all.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (0..100).collect::<Vec<u64>>());
    }
}
