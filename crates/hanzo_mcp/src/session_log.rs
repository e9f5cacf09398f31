//! Session Log - Append-Only Invocation Record
//!
//! One JSONL file per server process under `<state-root>/sessions/`. Each
//! line summarises one tool invocation: what ran, how it ended, how long it
//! took, how many bytes went out, and any cursor lineage. Argument and
//! output bodies are never written — only the argument digest.
//!
//! The log is best-effort: the first write failure is surfaced to
//! diagnostics, after which writing is suppressed for the life of the
//! process. Files rotate by size with a bounded backlog.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::warn;

const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;
const MAX_ROTATED: usize = 5;

/// One line in the session log.
#[derive(Debug, Clone, Serialize)]
pub struct SessionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub invocation_id: String,
    pub tool_name: String,
    pub argument_digest: String,
    pub outcome_kind: String,
    pub duration_ms: u64,
    pub bytes_out: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug)]
struct LogFile {
    writer: BufWriter<File>,
    written: u64,
}

/// Append-only writer shared across request workers.
#[derive(Debug)]
pub struct SessionLog {
    path: PathBuf,
    file: Mutex<Option<LogFile>>,
    failed: AtomicBool,
}

impl SessionLog {
    /// Open (or create) `<dir>/<pid>.jsonl`. An unopenable log degrades to
    /// a no-op writer rather than failing startup.
    pub fn open(dir: PathBuf) -> Self {
        let path = dir.join(format!("{}.jsonl", std::process::id()));
        let file = match open_log_file(&dir, &path) {
            Ok(file) => Some(file),
            Err(err) => {
                warn!(path = %path.display(), %err, "session log unavailable");
                None
            }
        };
        Self {
            path,
            file: Mutex::new(file),
            failed: AtomicBool::new(false),
        }
    }

    /// Append one entry. Never blocks the invocation on failure.
    pub fn record(&self, entry: &SessionLogEntry) {
        if self.failed.load(Ordering::Relaxed) {
            return;
        }
        let line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(err) => {
                self.fail_once(&format!("serialize: {}", err));
                return;
            }
        };

        let mut guard = self.file.lock().expect("session log lock");
        let Some(log) = guard.as_mut() else {
            return;
        };

        if log.written + line.len() as u64 > MAX_LOG_SIZE {
            if let Err(err) = rotate(&self.path) {
                self.fail_once(&format!("rotate: {}", err));
                *guard = None;
                return;
            }
            match reopen(&self.path) {
                Ok(new_log) => *log = new_log,
                Err(err) => {
                    self.fail_once(&format!("reopen: {}", err));
                    *guard = None;
                    return;
                }
            }
        }

        if let Err(err) = writeln!(log.writer, "{}", line).and_then(|_| log.writer.flush()) {
            self.fail_once(&err.to_string());
            *guard = None;
            return;
        }
        log.written += line.len() as u64 + 1;
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn fail_once(&self, err: &str) {
        if !self.failed.swap(true, Ordering::Relaxed) {
            warn!(path = %self.path.display(), err, "session log write failed; suppressing further writes");
        }
    }
}

fn open_log_file(dir: &PathBuf, path: &PathBuf) -> std::io::Result<LogFile> {
    std::fs::create_dir_all(dir)?;
    reopen(path)
}

fn reopen(path: &PathBuf) -> std::io::Result<LogFile> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let written = file.metadata()?.len();
    Ok(LogFile {
        writer: BufWriter::new(file),
        written,
    })
}

fn rotate(path: &PathBuf) -> std::io::Result<()> {
    let rotated = |index: usize| PathBuf::from(format!("{}.{}", path.display(), index));

    let oldest = rotated(MAX_ROTATED);
    if oldest.exists() {
        std::fs::remove_file(&oldest)?;
    }
    for index in (1..MAX_ROTATED).rev() {
        let src = rotated(index);
        if src.exists() {
            std::fs::rename(&src, rotated(index + 1))?;
        }
    }
    if path.exists() {
        std::fs::rename(path, rotated(1))?;
    }
    Ok(())
}
