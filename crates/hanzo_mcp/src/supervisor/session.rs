//! Process session state: one record per spawned child.
//!
//! Output capture keeps three views in step: the combined ring (hot tail),
//! per-stream spill files (full history, append-only), and a chunk index
//! recording the arrival-order interleave so any historical offset of the
//! combined stream can be reconstructed from the spills.

use super::ring::OutputRing;
use crate::error::{ToolError, ToolResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Backgrounded,
    Exited,
    Killed,
}

impl SessionState {
    pub fn is_live(self) -> bool {
        matches!(self, Self::Running | Self::Backgrounded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Backgrounded => "backgrounded",
            Self::Exited => "exited",
            Self::Killed => "killed",
        }
    }
}

/// Which child stream a chunk arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn spill_name(self) -> &'static str {
        match self {
            Self::Stdout => "stdout.log",
            Self::Stderr => "stderr.log",
        }
    }
}

/// One arrival-order entry in the chunk index. `offset` is the position of
/// the chunk within its stream's spill file.
#[derive(Debug, Clone, Copy)]
struct ChunkRecord {
    stream: StreamKind,
    offset: u64,
    len: u64,
}

/// Listing row for `process_list`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub state: String,
    pub command: String,
    pub working_directory: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,
    pub bytes_captured: u64,
    pub preview: String,
}

/// The server's handle on one spawned child.
#[derive(Debug)]
pub struct ProcessSession {
    pub session_id: String,
    pub command_line: Vec<String>,
    pub working_directory: PathBuf,
    pub environment: Vec<(String, String)>,
    pub state: SessionState,
    pub exit_status: Option<i32>,
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// Set once any explicit signal is delivered; the monitor then records
    /// the final state as `Killed` instead of `Exited`.
    pub signalled: bool,

    ring: OutputRing,
    chunks: Vec<ChunkRecord>,
    stream_written: [u64; 2],
    total_bytes: u64,
    spill_dir: PathBuf,
}

impl ProcessSession {
    pub fn new(
        session_id: String,
        command_line: Vec<String>,
        working_directory: PathBuf,
        environment: Vec<(String, String)>,
        spill_dir: PathBuf,
        ring_bytes: usize,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            command_line,
            working_directory,
            environment,
            state: SessionState::Running,
            exit_status: None,
            pid: None,
            created_at: now,
            last_activity_at: now,
            signalled: false,
            ring: OutputRing::new(ring_bytes),
            chunks: Vec::new(),
            stream_written: [0, 0],
            total_bytes: 0,
            spill_dir,
        }
    }

    pub fn spill_dir(&self) -> &PathBuf {
        &self.spill_dir
    }

    /// Total bytes of combined output captured so far.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Record a chunk that the collector has already appended to the spill.
    pub fn record_chunk(&mut self, stream: StreamKind, bytes: &[u8]) {
        let idx = stream as usize;
        let offset = self.stream_written[idx];
        self.stream_written[idx] += bytes.len() as u64;
        self.total_bytes += bytes.len() as u64;
        self.ring.push(bytes);
        self.last_activity_at = Utc::now();

        // consecutive same-stream chunks coalesce: spill offsets are contiguous
        if let Some(last) = self.chunks.last_mut() {
            if last.stream == stream && last.offset + last.len == offset {
                last.len += bytes.len() as u64;
                return;
            }
        }
        self.chunks.push(ChunkRecord {
            stream,
            offset,
            len: bytes.len() as u64,
        });
    }

    pub fn mark_exited(&mut self, exit_status: i32) {
        self.state = if self.signalled {
            SessionState::Killed
        } else {
            SessionState::Exited
        };
        self.exit_status = Some(exit_status);
        self.last_activity_at = Utc::now();
    }

    /// Read up to `max` bytes of the combined stream starting at `from`.
    ///
    /// Serves from the ring when the offset is still hot; otherwise
    /// reconstructs the interleave from the spill files via the chunk
    /// index. Reading never consumes the buffer.
    pub fn read_combined(&self, from: u64, max: usize) -> ToolResult<Vec<u8>> {
        if from >= self.total_bytes {
            return Ok(Vec::new());
        }
        if let Some(bytes) = self.ring.read_from(from, max) {
            return Ok(bytes);
        }
        self.read_from_spill(from, max)
    }

    fn read_from_spill(&self, from: u64, max: usize) -> ToolResult<Vec<u8>> {
        let mut out = Vec::with_capacity(max.min(64 * 1024));
        let mut combined = 0u64;

        for chunk in &self.chunks {
            let chunk_end = combined + chunk.len;
            if chunk_end <= from {
                combined = chunk_end;
                continue;
            }

            let skip = from.saturating_sub(combined);
            let want = ((chunk.len - skip) as usize).min(max - out.len());
            let path = self.spill_dir.join(chunk.stream.spill_name());

            let mut file = std::fs::File::open(&path).map_err(|e| {
                ToolError::ExecutionFailed(format!(
                    "cannot open spill {}: {}",
                    path.display(),
                    e
                ))
            })?;
            file.seek(SeekFrom::Start(chunk.offset + skip))
                .map_err(ToolError::from)?;
            let mut buf = vec![0u8; want];
            file.read_exact(&mut buf).map_err(|e| {
                ToolError::ExecutionFailed(format!("short spill read {}: {}", path.display(), e))
            })?;
            out.extend_from_slice(&buf);

            if out.len() >= max {
                break;
            }
            combined = chunk_end;
        }

        Ok(out)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            state: self.state.as_str().to_string(),
            command: self.command_line.join(" "),
            working_directory: self.working_directory.display().to_string(),
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            exit_status: self.exit_status,
            bytes_captured: self.total_bytes,
            preview: String::from_utf8_lossy(&self.ring.tail(160)).into_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_spill(dir: &std::path::Path, stream: StreamKind, bytes: &[u8]) {
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(stream.spill_name()))
            .unwrap();
        f.write_all(bytes).unwrap();
    }

    fn session(spill: &TempDir, ring_bytes: usize) -> ProcessSession {
        ProcessSession::new(
            "proc_test".into(),
            vec!["echo".into(), "hi".into()],
            PathBuf::from("/tmp"),
            Vec::new(),
            spill.path().to_path_buf(),
            ring_bytes,
        )
    }

    #[test]
    fn combined_read_preserves_arrival_order() {
        let spill = TempDir::new().unwrap();
        let mut s = session(&spill, 1024);

        write_spill(spill.path(), StreamKind::Stdout, b"out1 ");
        s.record_chunk(StreamKind::Stdout, b"out1 ");
        write_spill(spill.path(), StreamKind::Stderr, b"err1 ");
        s.record_chunk(StreamKind::Stderr, b"err1 ");
        write_spill(spill.path(), StreamKind::Stdout, b"out2");
        s.record_chunk(StreamKind::Stdout, b"out2");

        assert_eq!(s.read_combined(0, 1024).unwrap(), b"out1 err1 out2");
        assert_eq!(s.read_combined(5, 1024).unwrap(), b"err1 out2");
    }

    #[test]
    fn evicted_offsets_fall_back_to_spill() {
        let spill = TempDir::new().unwrap();
        let mut s = session(&spill, 4); // tiny ring, everything evicts

        write_spill(spill.path(), StreamKind::Stdout, b"abcdef");
        s.record_chunk(StreamKind::Stdout, b"abcdef");
        write_spill(spill.path(), StreamKind::Stderr, b"XY");
        s.record_chunk(StreamKind::Stderr, b"XY");

        // ring only holds the tail; offset 0 must come from the spill
        assert_eq!(s.read_combined(0, 1024).unwrap(), b"abcdefXY");
        assert_eq!(s.read_combined(4, 1024).unwrap(), b"efXY");
    }

    #[test]
    fn consecutive_same_stream_chunks_coalesce() {
        let spill = TempDir::new().unwrap();
        let mut s = session(&spill, 1024);

        s.record_chunk(StreamKind::Stdout, b"aa");
        s.record_chunk(StreamKind::Stdout, b"bb");
        s.record_chunk(StreamKind::Stderr, b"cc");
        assert_eq!(s.chunks.len(), 2);
        assert_eq!(s.chunks[0].len, 4);
    }

    #[test]
    fn read_past_end_is_empty() {
        let spill = TempDir::new().unwrap();
        let mut s = session(&spill, 1024);
        s.record_chunk(StreamKind::Stdout, b"abc");
        assert!(s.read_combined(3, 16).unwrap().is_empty());
        assert!(s.read_combined(99, 16).unwrap().is_empty());
    }

    #[test]
    fn signalled_sessions_record_killed_state() {
        let spill = TempDir::new().unwrap();
        let mut s = session(&spill, 1024);
        s.signalled = true;
        s.mark_exited(137);
        assert_eq!(s.state, SessionState::Killed);
        assert_eq!(s.exit_status, Some(137));

        let mut t = session(&spill, 1024);
        t.mark_exited(0);
        assert_eq!(t.state, SessionState::Exited);
    }
}
