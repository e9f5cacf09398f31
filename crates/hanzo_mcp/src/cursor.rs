//! Cursor Store - Opaque Continuation Tokens
//!
//! When a result does not fit the token cap, the remainder is parked behind
//! a cursor: a random 128-bit id handed to the client, mapped server-side to
//! `{kind, source_id, offset, checksum}`. The checksum binds the cursor to
//! the originating call's arguments (and the tokenizer vocabulary), so
//! resuming with different parameters fails as `CursorMismatch` instead of
//! returning a misaligned suffix.
//!
//! Cursors are single-writer: a successful redemption consumes the id and
//! the continuation response mints a fresh one. Redeeming a consumed or
//! expired id is `NotFound`, never a silent reset.
//!
//! Results that cannot be recomputed from an offset (a DAG transcript) are
//! stashed here verbatim, keyed by source id, and garbage-collected on the
//! same idle clock.

use crate::error::{ToolError, ToolResult};
use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What a cursor continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorKind {
    /// Prefix of a list was delivered; offset counts items.
    PaginatedList,
    /// Prefix of a byte stream was delivered; offset counts bytes.
    StreamedLog,
    /// Prefix of a search result set was delivered; offset counts hits.
    BatchedSearch,
}

/// Continuation data a tool hands the dispatcher alongside its output.
#[derive(Debug, Clone)]
pub struct CursorSeed {
    pub kind: CursorKind,
    pub source_id: String,
    pub offset: u64,
}

impl CursorSeed {
    pub fn new(kind: CursorKind, source_id: impl Into<String>, offset: u64) -> Self {
        Self {
            kind,
            source_id: source_id.into(),
            offset,
        }
    }
}

/// Server-side record behind an issued cursor id.
#[derive(Debug, Clone)]
pub struct CursorState {
    pub kind: CursorKind,
    pub source_id: String,
    pub offset: u64,
    pub checksum: String,
}

struct CursorEntry {
    state: CursorState,
    touched: Instant,
}

struct StashEntry {
    items: Arc<Vec<Value>>,
    touched: Instant,
}

/// In-memory cursor map plus the result stash for non-recomputable sources.
pub struct CursorStore {
    entries: DashMap<String, CursorEntry>,
    stash: DashMap<String, StashEntry>,
    idle: Duration,
}

impl CursorStore {
    pub fn new(idle: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            stash: DashMap::new(),
            idle,
        }
    }

    /// Issue a cursor id for `seed`, bound to `checksum`.
    pub fn mint(&self, seed: CursorSeed, checksum: String) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.entries.insert(
            id.clone(),
            CursorEntry {
                state: CursorState {
                    kind: seed.kind,
                    source_id: seed.source_id,
                    offset: seed.offset,
                    checksum,
                },
                touched: Instant::now(),
            },
        );
        id
    }

    /// Redeem a cursor id against the checksum of the incoming call.
    ///
    /// Consumes the id on success. A checksum mismatch leaves the cursor in
    /// place so a mistyped call does not destroy the continuation.
    pub fn redeem(&self, id: &str, checksum: &str) -> ToolResult<CursorState> {
        {
            let entry = self
                .entries
                .get(id)
                .ok_or_else(|| ToolError::NotFound(format!("unknown or expired cursor: {}", id)))?;

            if entry.touched.elapsed() > self.idle {
                drop(entry);
                self.entries.remove(id);
                return Err(ToolError::NotFound(format!("cursor expired: {}", id)));
            }

            if entry.state.checksum != checksum {
                return Err(ToolError::CursorMismatch(format!(
                    "cursor {} was minted for different arguments",
                    id
                )));
            }
        }

        let (_, entry) = self
            .entries
            .remove(id)
            .ok_or_else(|| ToolError::NotFound(format!("unknown or expired cursor: {}", id)))?;
        Ok(entry.state)
    }

    /// Park a fully materialised result under `source_id`.
    pub fn stash_items(&self, source_id: &str, items: Vec<Value>) {
        self.stash.insert(
            source_id.to_string(),
            StashEntry {
                items: Arc::new(items),
                touched: Instant::now(),
            },
        );
    }

    /// Fetch a stashed result, refreshing its idle clock.
    pub fn stashed(&self, source_id: &str) -> Option<Arc<Vec<Value>>> {
        self.stash.get_mut(source_id).map(|mut entry| {
            entry.touched = Instant::now();
            Arc::clone(&entry.items)
        })
    }

    /// Drop every cursor (and stash entry) rooted in `source_id`. Called
    /// when a source dies: a process session removed, a snapshot replaced.
    pub fn invalidate_source(&self, source_id: &str) {
        self.entries
            .retain(|_, entry| entry.state.source_id != source_id);
        self.stash.remove(source_id);
    }

    /// Sweep idle-expired cursors and stashes. Run periodically.
    pub fn gc(&self) {
        self.entries
            .retain(|_, entry| entry.touched.elapsed() <= self.idle);
        self.stash
            .retain(|_, entry| entry.touched.elapsed() <= self.idle);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Digest binding a cursor to its originating call: tool name, canonical
/// arguments (minus the cursor itself), and the tokenizer vocabulary tag.
pub fn argument_digest(tool_name: &str, arguments: &Value, vocabulary: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tool_name.as_bytes());
    hasher.update([0u8]);
    // serde_json maps are sorted, so serialisation is canonical
    hasher.update(serde_json::to_string(arguments).unwrap_or_default().as_bytes());
    hasher.update([0u8]);
    hasher.update(vocabulary.as_bytes());
    hex::encode(hasher.finalize())
}
