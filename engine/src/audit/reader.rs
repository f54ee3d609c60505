//! Snapshot-bounded readers over the JSONL file

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Take};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sdk::errors::EngineResult;
use tracing::warn;

use super::AuditEntry;

const CHUNK: u64 = 8 * 1024;

fn open_existing(path: &Path) -> io::Result<Option<File>> {
    match File::open(path) {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

pub(super) fn ends_with_newline(path: &Path, len: u64) -> io::Result<bool> {
    let Some(mut file) = open_existing(path)? else {
        return Ok(true);
    };
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// Yields raw lines from the end of the file towards the start.
pub(super) struct ReverseLines {
    file: Option<File>,
    pos: u64,
    pending: Vec<u8>,
}

impl ReverseLines {
    pub(super) fn open(path: &Path, len: u64) -> EngineResult<Self> {
        Ok(Self {
            file: open_existing(path)?,
            pos: len,
            pending: Vec::new(),
        })
    }

    fn fill(&mut self) -> io::Result<bool> {
        let Some(file) = self.file.as_mut() else {
            return Ok(false);
        };
        if self.pos == 0 {
            return Ok(false);
        }
        let start = self.pos.saturating_sub(CHUNK);
        let mut chunk = vec![0u8; (self.pos - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&self.pending);
        self.pending = chunk;
        self.pos = start;
        Ok(true)
    }
}

impl Iterator for ReverseLines {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(idx) = self.pending.iter().rposition(|b| *b == b'\n') {
                let line = self.pending.split_off(idx + 1);
                self.pending.truncate(idx);
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Some(line);
            }

            match self.fill() {
                Ok(true) => continue,
                Ok(false) => {
                    if self.pending.iter().all(u8::is_ascii_whitespace) {
                        self.pending.clear();
                        return None;
                    }
                    return Some(std::mem::take(&mut self.pending));
                }
                Err(e) => {
                    warn!(error = %e, "Audit reverse read failed; stopping scan");
                    self.pending.clear();
                    self.file = None;
                    return None;
                }
            }
        }
    }
}

/// Lazy forward iterator over audit entries below a snapshot length.
pub struct AuditStream {
    path: PathBuf,
    reader: Option<BufReader<Take<File>>>,
    since: Option<DateTime<Utc>>,
    line: Vec<u8>,
}

impl AuditStream {
    pub(super) fn open(path: &Path, len: u64, since: Option<DateTime<Utc>>) -> EngineResult<Self> {
        let reader = open_existing(path)?.map(|file| BufReader::new(file.take(len)));
        Ok(Self {
            path: path.to_path_buf(),
            reader,
            since,
            line: Vec::new(),
        })
    }
}

impl Iterator for AuditStream {
    type Item = AuditEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let reader = self.reader.as_mut()?;
        loop {
            self.line.clear();
            match reader.read_until(b'\n', &mut self.line) {
                Ok(0) => {
                    self.reader = None;
                    return None;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(path = ?self.path, error = %e, "Audit stream read failed");
                    self.reader = None;
                    return None;
                }
            }

            if self.line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            match serde_json::from_slice::<AuditEntry>(&self.line) {
                Ok(entry) => {
                    if self.since.map_or(true, |since| entry.timestamp >= since) {
                        return Some(entry);
                    }
                }
                Err(e) => {
                    warn!(path = ?self.path, error = %e, "Skipping unreadable audit line");
                }
            }
        }
    }
}
