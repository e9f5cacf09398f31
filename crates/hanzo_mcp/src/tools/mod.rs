//! Tool Bodies and the Handler Contract
//!
//! Each tool module contributes a manifest (descriptors plus handlers) that
//! the registry links at startup. Handlers are pure of I/O policy: every
//! capability they touch — paths, processes, cursors, budget — arrives
//! through the [`ToolContext`], and their output goes back through the
//! dispatcher's budget pass before anything reaches the wire.

pub mod fs;
pub mod process;
pub mod search;
pub mod shell;

use crate::budget::TokenBudgeter;
use crate::config::ServerConfig;
use crate::cursor::{CursorSeed, CursorState, CursorStore};
use crate::error::ToolResult;
use crate::protocol::ContentBlock;
use crate::security::PermissionGate;
use crate::supervisor::ProcessSupervisor;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Capabilities handed to a handler for one invocation.
#[derive(Clone)]
pub struct ToolContext {
    pub gate: Arc<PermissionGate>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub cursors: Arc<CursorStore>,
    pub budget: Arc<TokenBudgeter>,
    pub config: Arc<ServerConfig>,
    pub cancel: CancellationToken,
    pub invocation_id: String,
    /// Redeemed continuation state when the call resumes a prior response.
    pub resume: Option<CursorState>,
}

impl ToolContext {
    /// Offset to resume from; zero on a fresh call.
    pub fn resume_offset(&self) -> u64 {
        self.resume.as_ref().map(|c| c.offset).unwrap_or(0)
    }
}

/// What a handler returns; the dispatcher budgets it into the wire form.
#[derive(Debug)]
pub enum ToolOutput {
    /// Small, already-shaped content. Emitted as-is if it fits the cap,
    /// refused as `OutputTooLarge` otherwise. `next` carries an explicit
    /// continuation (e.g. the log cursor of a backgrounded shell).
    Chunks {
        chunks: Vec<ContentBlock>,
        next: Option<CursorSeed>,
    },

    /// A list to paginate. `seed.offset` is the absolute index of the first
    /// item; the dispatcher keeps the largest prefix that fits and mints a
    /// cursor for the rest. `complete` is false when the handler bounded
    /// its own collection window and more items exist past `items`.
    List {
        items: Vec<Value>,
        seed: CursorSeed,
        complete: bool,
    },

    /// A single large text. `seed.offset` is the absolute byte offset of
    /// `text` within its logical stream; `total_bytes` is that stream's
    /// full size so far. The dispatcher truncates at a token boundary,
    /// appends a marker, and mints a byte-offset cursor when bytes remain
    /// undelivered — or unconditionally when `live` says the stream may
    /// still grow.
    Blob {
        text: String,
        seed: Option<CursorSeed>,
        total_bytes: u64,
        live: bool,
    },
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Chunks {
            chunks: vec![ContentBlock::text(text)],
            next: None,
        }
    }

    pub fn json(data: Value) -> Self {
        Self::Chunks {
            chunks: vec![ContentBlock::json(data)],
            next: None,
        }
    }
}

/// An executable tool body.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Run with validated arguments. Suspension points must observe
    /// `ctx.cancel`; the dispatcher converts overruns to `Cancelled`.
    async fn execute(&self, ctx: &ToolContext, args: Map<String, Value>)
        -> ToolResult<ToolOutput>;
}
