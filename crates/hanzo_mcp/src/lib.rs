//! MCP Tool Server Core
//!
//! A long-lived process that exposes a catalog of named tools to an AI
//! client over the Model Context Protocol (JSON-RPC 2.0) and executes them
//! with strict concurrency, resource, and output-size discipline.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         AI Client                                │
//! └─────────────────────────────────────────────────────────────────┘
//!                 │ JSON-RPC over stdio or SSE/HTTP
//!                 ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     crates/hanzo_mcp                             │
//! │                                                                  │
//! │  transport   │ framing only: NDJSON stdio, SSE/HTTP             │
//! │  dispatch    │ decode, validate, authorize, execute, respond    │
//! │  registry    │ compile-time tool manifests, collision-checked   │
//! │  security    │ allow/deny path rules, bounded symlink resolve   │
//! │  budget      │ deterministic BPE token cap on every response    │
//! │  cursor      │ opaque continuation tokens, checksum-bound       │
//! │  supervisor  │ child processes: ring+spill capture, background  │
//! │  dag         │ dependency-ordered shell steps, parallel fan-out │
//! │  tools       │ fs / search / shell / process bodies             │
//! │  session_log │ append-only invocation summaries                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Design Principles
//!
//! 1. **One terminal response per request.** Cancels, deadlines, panics,
//!    and budget refusals all collapse into a single categorised reply.
//!
//! 2. **Every side effect is gated.** Filesystem and exec access resolve
//!    through the permission rules with symlinks chased to a bound.
//!
//! 3. **No response outgrows the token cap.** Lists keep their largest
//!    fitting prefix, blobs truncate at token boundaries, and the rest
//!    parks behind a cursor bound to the call's argument digest.
//!
//! 4. **Long work backgrounds instead of blocking.** A child that outlives
//!    its foreground deadline becomes a session with replayable logs.
//!
//! 5. **Construct once, share by reference.** The server root owns every
//!    subsystem; handlers borrow capabilities through their context.

pub mod budget;
pub mod config;
pub mod cursor;
pub mod dag;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod schema;
pub mod security;
pub mod server;
pub mod session_log;
pub mod supervisor;
pub mod tools;
pub mod transport;

pub use budget::{TokenBudgeter, DEFAULT_TOKEN_CAP, FRAME_RESERVE_TOKENS, VOCABULARY};
pub use config::{ServerConfig, TransportKind};
pub use cursor::{argument_digest, CursorKind, CursorSeed, CursorState, CursorStore};
pub use dispatch::Dispatcher;
pub use error::{ToolError, ToolResult};
pub use protocol::{
    ErrorCode, JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestId, ToolCallParams,
    ToolCallResult,
};
pub use registry::{RegistryFilter, ToolClass, ToolDescriptor, ToolManifest, ToolRegistry};
pub use security::{PathRule, PermissionGate, RuleAction};
pub use server::McpServer;
pub use session_log::{SessionLog, SessionLogEntry};
pub use supervisor::{
    ForegroundOutcome, ProcessSupervisor, SessionSnapshot, SessionState, SignalKind, SpawnSpec,
};
pub use tools::{ToolContext, ToolHandler, ToolOutput};
