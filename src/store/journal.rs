//! On-disk layout of the Record Store.
//!
//! `records.snapshot` holds a JSON document with every record and the next
//! identity. `records.log` holds one JSON operation per line, appended after
//! the snapshot was taken. Opening loads the snapshot and replays the log.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::error::{StoreError, StoreResult};
use crate::types::{LocationId, LocationRecord};

pub const SNAPSHOT_FILE: &str = "records.snapshot";
pub const LOG_FILE: &str = "records.log";

/// A single logged mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LogOp {
    /// Full record after a create or update.
    Put { record: LocationRecord },
    Delete {
        id: LocationId,
        revision: u64,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub next_id: u64,
    pub records: Vec<LocationRecord>,
}

/// Append handle on `records.log`.
#[derive(Debug)]
pub struct LogFile {
    dir: PathBuf,
    file: File,
    appended: usize,
}

impl LogFile {
    pub fn open(dir: &Path) -> StoreResult<Self> {
        std::fs::create_dir_all(dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(LOG_FILE))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            file,
            appended: 0,
        })
    }

    /// Writes one operation and flushes it before returning.
    pub fn append(&mut self, op: &LogOp) -> StoreResult<()> {
        let mut line = serde_json::to_vec(op)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.flush()?;
        self.appended += 1;
        Ok(())
    }

    /// Operations appended through this handle since it was opened or truncated.
    pub fn appended(&self) -> usize {
        self.appended
    }

    /// Writes `snapshot` atomically, then empties the log.
    pub fn compact(&mut self, snapshot: &Snapshot) -> StoreResult<()> {
        write_snapshot(&self.dir, snapshot)?;
        self.file.sync_all()?;
        let file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(self.dir.join(LOG_FILE))?;
        drop(file);
        self.file = OpenOptions::new()
            .append(true)
            .open(self.dir.join(LOG_FILE))?;
        self.appended = 0;
        Ok(())
    }
}

pub fn read_snapshot(dir: &Path) -> StoreResult<Option<Snapshot>> {
    let path = dir.join(SNAPSHOT_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(&path)?;
    let snapshot = serde_json::from_slice(&bytes).map_err(|e| StoreError::Snapshot(e.to_string()))?;
    Ok(Some(snapshot))
}

fn write_snapshot(dir: &Path, snapshot: &Snapshot) -> StoreResult<()> {
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&mut file, snapshot)?;
    file.flush()?;
    file.as_file().sync_all()?;
    file.persist(dir.join(SNAPSHOT_FILE))
        .map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}

/// Reads every operation in the log.
///
/// An unparsable final line is a torn write from a crash: it is cut off the
/// file so later appends start on a clean line. An unparsable line followed
/// by valid ones is corruption.
pub fn read_log(dir: &Path) -> StoreResult<Vec<LogOp>> {
    let path = dir.join(LOG_FILE);
    if !path.exists() {
        return Ok(Vec::new());
    }

    let bytes = std::fs::read(&path)?;
    let mut ops = Vec::new();
    let mut pending_error: Option<(usize, String)> = None;
    let mut valid_len = 0usize;
    let mut offset = 0usize;

    for (index, raw) in bytes.split_inclusive(|b| *b == b'\n').enumerate() {
        offset += raw.len();
        let line = String::from_utf8_lossy(raw);
        if line.trim().is_empty() {
            continue;
        }
        if let Some((line_no, reason)) = pending_error.take() {
            return Err(StoreError::CorruptedLog {
                line: line_no,
                reason,
            });
        }
        match serde_json::from_str::<LogOp>(line.trim_end()) {
            Ok(op) if raw.ends_with(b"\n") => {
                ops.push(op);
                valid_len = offset;
            }
            Ok(_) => pending_error = Some((index + 1, "missing line terminator".to_string())),
            Err(e) => pending_error = Some((index + 1, e.to_string())),
        }
    }

    if let Some((line_no, reason)) = pending_error {
        tracing::warn!("record log: dropping torn final line {line_no}: {reason}");
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(valid_len as u64)?;
        file.sync_all()?;
    }
    Ok(ops)
}
