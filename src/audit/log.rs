// ABOUTME: Append-only audit log — one JSONL line per event, never rewritten.
// ABOUTME: Existing history is loaded on open so the record survives restarts.

use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

use crate::access::GrantMode;
use crate::clock::Clock;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit log io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("audit log serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("audit log {path} is corrupt at line {line}: {reason}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("audit log is faulted after a write that could not be rolled back")]
    Faulted,
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditEventKind {
    AuthAttempt,
    GrantIssued,
    GrantExpired,
    GrantRevoked,
    CommandBlocked,
    CommandAllowed,
    /// Keyword phrase or dangerous-pattern policy changed.
    PolicyChanged,
    /// A voice enrollment was committed or failed.
    Enrollment,
}

impl fmt::Display for AuditEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuditEventKind::AuthAttempt => "auth-attempt",
            AuditEventKind::GrantIssued => "grant-issued",
            AuditEventKind::GrantExpired => "grant-expired",
            AuditEventKind::GrantRevoked => "grant-revoked",
            AuditEventKind::CommandBlocked => "command-blocked",
            AuditEventKind::CommandAllowed => "command-allowed",
            AuditEventKind::PolicyChanged => "policy-changed",
            AuditEventKind::Enrollment => "enrollment",
        };
        f.write_str(s)
    }
}

/// How it turned out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
    Fault,
}

/// A single persisted audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub kind: AuditEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<GrantMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grant_id: Option<u64>,
    pub outcome: AuditOutcome,
    pub detail: String,
}

impl fmt::Display for AuditLogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} {} {:?}",
            self.seq,
            self.timestamp.to_rfc3339(),
            self.kind,
            self.outcome
        )?;
        if let Some(mode) = self.mode {
            write!(f, " [{mode}]")?;
        }
        write!(f, " {}: {}", self.actor, self.detail)
    }
}

/// An event about to be recorded; the log assigns `seq` and `timestamp`.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub actor: String,
    pub kind: AuditEventKind,
    pub mode: Option<GrantMode>,
    pub grant_id: Option<u64>,
    pub outcome: AuditOutcome,
    pub detail: String,
}

impl AuditRecord {
    pub fn new(kind: AuditEventKind, actor: impl Into<String>, outcome: AuditOutcome) -> Self {
        Self {
            actor: actor.into(),
            kind,
            mode: None,
            grant_id: None,
            outcome,
            detail: String::new(),
        }
    }

    pub fn mode(mut self, mode: GrantMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn grant(mut self, id: u64) -> Self {
        self.grant_id = Some(id);
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

/// Entries kept in memory; older history is read back from the file on demand.
pub const MEMORY_TAIL: usize = 1024;

/// Where persisted lines go.
trait LogSink: Send {
    /// Write one whole line.
    fn append(&mut self, line: &[u8]) -> std::io::Result<()>;
    /// Discard whatever part of a failed append reached the destination.
    fn rollback(&mut self) -> std::io::Result<()>;
}

/// Unbuffered append to the log file. `len` is the size after the last complete line.
struct FileSink {
    file: File,
    len: u64,
}

impl LogSink for FileSink {
    fn append(&mut self, line: &[u8]) -> std::io::Result<()> {
        self.file.write_all(line)?;
        self.len += line.len() as u64;
        Ok(())
    }

    fn rollback(&mut self) -> std::io::Result<()> {
        self.file.set_len(self.len)
    }
}

struct LogState {
    tail: VecDeque<AuditLogEntry>,
    tail_capacity: usize,
    total: usize,
    last_timestamp: Option<DateTime<Utc>>,
    sink: Option<Box<dyn LogSink>>,
    next_seq: u64,
    faulted: bool,
}

impl LogState {
    fn new(sink: Option<Box<dyn LogSink>>, tail_capacity: usize) -> Self {
        Self {
            tail: VecDeque::new(),
            tail_capacity: tail_capacity.max(1),
            total: 0,
            last_timestamp: None,
            sink,
            next_seq: 1,
            faulted: false,
        }
    }

    fn push(&mut self, entry: AuditLogEntry) {
        self.next_seq = entry.seq + 1;
        self.last_timestamp = Some(entry.timestamp);
        self.total += 1;
        self.tail.push_back(entry);
        if self.tail.len() > self.tail_capacity {
            self.tail.pop_front();
        }
    }

    /// Whether every entry is still held in memory.
    fn complete(&self) -> bool {
        self.total == self.tail.len()
    }
}

/// Append-only audit log. Appends are serialized so `seq` and `timestamp` never go backwards.
///
/// Only the most recent entries stay in memory. Queries reaching further back re-read the
/// file; an in-memory log simply forgets them.
pub struct AuditLog {
    state: Mutex<LogState>,
    clock: Arc<dyn Clock>,
    path: Option<PathBuf>,
}

impl fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLog").field("path", &self.path).finish()
    }
}

/// Stream every entry of a JSONL log. A line that fails to parse is corruption, not skipped.
fn read_entries(path: &Path, mut visit: impl FnMut(AuditLogEntry)) -> Result<(), AuditError> {
    let reader = BufReader::new(File::open(path)?);
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: AuditLogEntry = serde_json::from_str(&line).map_err(|e| AuditError::Corrupt {
            path: path.to_path_buf(),
            line: i + 1,
            reason: e.to_string(),
        })?;
        visit(entry);
    }
    Ok(())
}

impl AuditLog {
    /// A log that keeps entries in memory only.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(LogState::new(None, MEMORY_TAIL)),
            clock,
            path: None,
        }
    }

    /// Open (or create) a JSONL log at `path`, loading any existing history.
    pub fn open(path: &Path, clock: Arc<dyn Clock>) -> Result<Self, AuditError> {
        Self::open_with_tail(path, clock, MEMORY_TAIL)
    }

    fn open_with_tail(
        path: &Path,
        clock: Arc<dyn Clock>,
        tail_capacity: usize,
    ) -> Result<Self, AuditError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut state = LogState::new(None, tail_capacity);
        if path.exists() {
            read_entries(path, |entry| state.push(entry))?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let len = file.metadata()?.len();
        state.sink = Some(Box::new(FileSink { file, len }));
        Ok(Self {
            state: Mutex::new(state),
            clock,
            path: Some(path.to_path_buf()),
        })
    }

    /// Append an event. The entry is only visible in history once it is written.
    ///
    /// A failed append is rolled back so the next entry reuses its `seq`. If the rollback
    /// itself fails the log is faulted and refuses every later record.
    pub fn record(&self, record: AuditRecord) -> Result<AuditLogEntry, AuditError> {
        let mut state = self.state.lock().expect("audit lock poisoned");
        if state.faulted {
            return Err(AuditError::Faulted);
        }

        let mut timestamp = self.clock.now();
        if let Some(last) = state.last_timestamp {
            timestamp = timestamp.max(last);
        }
        let entry = AuditLogEntry {
            seq: state.next_seq,
            timestamp,
            actor: record.actor,
            kind: record.kind,
            mode: record.mode,
            grant_id: record.grant_id,
            outcome: record.outcome,
            detail: record.detail,
        };

        if let Some(sink) = state.sink.as_mut() {
            let mut line = serde_json::to_string(&entry)?;
            line.push('\n');
            if let Err(err) = sink.append(line.as_bytes()) {
                if let Err(rollback) = sink.rollback() {
                    error!(%err, %rollback, "audit append could not be rolled back");
                    state.faulted = true;
                }
                return Err(err.into());
            }
        }

        state.push(entry.clone());
        Ok(entry)
    }

    /// The most recent `limit` entries, oldest first.
    pub fn history(&self, limit: usize) -> Result<Vec<AuditLogEntry>, AuditError> {
        let state = self.state.lock().expect("audit lock poisoned");
        match self.path.as_deref() {
            Some(path) if limit > state.tail.len() && !state.complete() => {
                let mut recent = VecDeque::with_capacity(limit.min(state.total));
                read_entries(path, |entry| {
                    recent.push_back(entry);
                    if recent.len() > limit {
                        recent.pop_front();
                    }
                })?;
                Ok(recent.into())
            }
            _ => {
                let start = state.tail.len().saturating_sub(limit);
                Ok(state.tail.iter().skip(start).cloned().collect())
            }
        }
    }

    pub fn entries(&self) -> Result<Vec<AuditLogEntry>, AuditError> {
        self.select(|_| true)
    }

    pub fn entries_for(&self, kind: AuditEventKind) -> Result<Vec<AuditLogEntry>, AuditError> {
        self.select(|e| e.kind == kind)
    }

    fn select(
        &self,
        keep: impl Fn(&AuditLogEntry) -> bool,
    ) -> Result<Vec<AuditLogEntry>, AuditError> {
        let state = self.state.lock().expect("audit lock poisoned");
        match self.path.as_deref() {
            Some(path) if !state.complete() => {
                let mut selected = Vec::new();
                read_entries(path, |entry| {
                    if keep(&entry) {
                        selected.push(entry);
                    }
                })?;
                Ok(selected)
            }
            _ => Ok(state.tail.iter().filter(|&e| keep(e)).cloned().collect()),
        }
    }

    /// Total entries recorded, including those no longer held in memory.
    pub fn len(&self) -> usize {
        self.state.lock().expect("audit lock poisoned").total
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}
