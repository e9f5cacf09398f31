//! Dispatcher - Request State Machine
//!
//! One request at a time flows `received → validated → authorized →
//! executing → {responded | failed | cursor-suspended}`. Every accepted
//! request gets exactly one terminal response; nothing unclassified crosses
//! to the client (handler panics and unknown defects become `Internal` with
//! a logged correlation id).
//!
//! Workers are bounded by a semaphore; requests past the bound queue on it,
//! never drop. `$/cancel` and `tools/list` bypass the semaphore so they
//! stay responsive under load.

use crate::budget::{truncation_marker, BlobFit, TokenBudgeter, VOCABULARY};
use crate::config::{ServerConfig, TransportKind};
use crate::cursor::{argument_digest, CursorSeed, CursorStore};
use crate::error::ToolError;
use crate::protocol::{
    methods, CancelParams, ContentBlock, ErrorCode, InitializeParams, InitializeResult,
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestId, ServerCapabilities, ServerInfo,
    ToolCallParams, ToolCallResult, ToolsListResult, JSONRPC_VERSION, MCP_PROTOCOL_VERSION,
};
use crate::registry::ToolRegistry;
use crate::security::PermissionGate;
use crate::session_log::{SessionLog, SessionLogEntry};
use crate::supervisor::ProcessSupervisor;
use crate::tools::{ToolContext, ToolOutput};
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct DispatcherInner {
    config: Arc<ServerConfig>,
    registry: Arc<ToolRegistry>,
    gate: Arc<PermissionGate>,
    supervisor: Arc<ProcessSupervisor>,
    cursors: Arc<CursorStore>,
    budget: Arc<TokenBudgeter>,
    session_log: Arc<SessionLog>,
    workers: Semaphore,
    inflight: DashMap<RequestId, CancellationToken>,
    initialized: AtomicBool,
    shutdown: CancellationToken,
}

/// Routes decoded requests to handlers and owns the in-flight table.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ServerConfig>,
        registry: Arc<ToolRegistry>,
        gate: Arc<PermissionGate>,
        supervisor: Arc<ProcessSupervisor>,
        cursors: Arc<CursorStore>,
        budget: Arc<TokenBudgeter>,
        session_log: Arc<SessionLog>,
        shutdown: CancellationToken,
    ) -> Self {
        let workers = Semaphore::new(config.max_concurrent.max(1));
        Self {
            inner: Arc::new(DispatcherInner {
                config,
                registry,
                gate,
                supervisor,
                cursors,
                budget,
                session_log,
                workers,
                inflight: DashMap::new(),
                initialized: AtomicBool::new(false),
                shutdown,
            }),
        }
    }

    /// Token cancelled when a `shutdown` request (or signal) arrives.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Metadata advertised by the SSE handshake event.
    pub fn server_metadata(&self) -> Value {
        json!({
            "name": self.inner.config.server_name,
            "version": self.inner.config.server_version,
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {
                "tools": true,
                "cursors": true,
                "cancellation": true,
                "sse": true,
            },
        })
    }

    /// Decode one raw line from the transport. `None` means nothing to
    /// write back (notification, or malformed without a recoverable id).
    pub async fn handle_raw(&self, raw: &str) -> Option<JsonRpcResponse> {
        let request: JsonRpcRequest = match serde_json::from_str(raw) {
            Ok(request) => request,
            Err(err) => {
                // reply only when an id can be dug out of the wreckage
                let id = recover_id(raw);
                if id.is_none() {
                    warn!(%err, "dropping malformed frame");
                    return None;
                }
                return Some(JsonRpcResponse::error(
                    id,
                    JsonRpcError::new(ErrorCode::ParseError, format!("invalid JSON: {}", err)),
                ));
            }
        };
        self.dispatch(request).await
    }

    /// Route one decoded request. Exactly one terminal response per
    /// request-with-id; notifications yield `None`.
    pub async fn dispatch(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        if request.jsonrpc != JSONRPC_VERSION {
            return Some(JsonRpcResponse::error(
                request.id,
                JsonRpcError::new(
                    ErrorCode::InvalidRequest,
                    format!("invalid JSON-RPC version: {}", request.jsonrpc),
                ),
            ));
        }

        match request.method.as_str() {
            methods::INITIALIZE => Some(self.handle_initialize(request)),
            methods::INITIALIZED => {
                if request.id.is_none() {
                    return None;
                }
                Some(JsonRpcResponse::success(request.id, Value::Null))
            }
            methods::TOOLS_LIST => Some(JsonRpcResponse::success(
                request.id,
                serde_json::to_value(ToolsListResult {
                    tools: self.inner.registry.list(),
                })
                .expect("static listing serializes"),
            )),
            methods::TOOLS_CALL => Some(self.handle_tools_call(request).await),
            methods::CANCEL => {
                self.handle_cancel(request);
                None
            }
            methods::PING => Some(JsonRpcResponse::success(
                request.id,
                Value::Object(Default::default()),
            )),
            methods::SHUTDOWN => {
                info!("shutdown requested");
                self.inner.shutdown.cancel();
                Some(JsonRpcResponse::success(request.id, json!({ "ok": true })))
            }
            other => Some(JsonRpcResponse::error(
                request.id,
                JsonRpcError::new(
                    ErrorCode::MethodNotFound,
                    format!("unknown method: {}", other),
                ),
            )),
        }
    }

    fn handle_initialize(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let params: InitializeParams = request
            .params
            .and_then(|p| serde_json::from_value(p).ok())
            .unwrap_or_default();

        if let Some(client) = &params.client_info {
            info!(client = %client.name, version = %client.version, "initialize");
        }
        self.inner.initialized.store(true, Ordering::SeqCst);

        let result = InitializeResult {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: true,
                cursors: true,
                cancellation: true,
                sse: self.inner.config.transport == TransportKind::Sse,
            },
            server_info: ServerInfo {
                name: self.inner.config.server_name.clone(),
                version: self.inner.config.server_version.clone(),
            },
        };
        JsonRpcResponse::success(
            request.id,
            serde_json::to_value(result).expect("static result serializes"),
        )
    }

    fn handle_cancel(&self, request: JsonRpcRequest) {
        let Some(params) = request
            .params
            .and_then(|p| serde_json::from_value::<CancelParams>(p).ok())
        else {
            warn!("$/cancel without a usable id");
            return;
        };
        match self.inner.inflight.get(&params.id) {
            Some(token) => {
                info!(id = %params.id, "cancelling request");
                token.cancel();
            }
            None => debug!(id = %params.id, "cancel for unknown or finished request"),
        }
    }

    async fn handle_tools_call(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        if !self.inner.initialized.load(Ordering::SeqCst) {
            return JsonRpcResponse::error(
                request.id,
                JsonRpcError::new(ErrorCode::ServerError(-32000), "server not initialized"),
            );
        }

        let params: ToolCallParams = match request.params {
            Some(p) => match serde_json::from_value(p) {
                Ok(params) => params,
                Err(err) => {
                    return JsonRpcResponse::error(
                        request.id,
                        JsonRpcError::new(
                            ErrorCode::InvalidParams,
                            format!("invalid tool call params: {}", err),
                        ),
                    )
                }
            },
            None => {
                return JsonRpcResponse::error(
                    request.id,
                    JsonRpcError::new(ErrorCode::InvalidParams, "missing tool call params"),
                )
            }
        };

        // queue on the worker bound; never drop
        let permit = self
            .inner
            .workers
            .acquire()
            .await
            .expect("worker semaphore never closes");

        let cancel = self.inner.shutdown.child_token();
        if let Some(id) = &request.id {
            self.inner.inflight.insert(id.clone(), cancel.clone());
        }

        let started = Instant::now();
        let invocation_id = uuid::Uuid::new_v4().simple().to_string();
        let outcome = self
            .run_invocation(&params, &invocation_id, cancel.clone())
            .await;

        drop(permit);
        if let Some(id) = &request.id {
            self.inner.inflight.remove(id);
        }

        let digest = argument_digest(&params.name, &params.arguments, VOCABULARY);
        match outcome {
            Ok(result) => {
                let bytes_out = serde_json::to_string(&result)
                    .map(|s| s.len() as u64)
                    .unwrap_or(0);
                self.inner.session_log.record(&SessionLogEntry {
                    timestamp: chrono::Utc::now(),
                    invocation_id,
                    tool_name: params.name.clone(),
                    argument_digest: digest,
                    outcome_kind: "success".into(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    bytes_out,
                    next_cursor: result.next_cursor.clone(),
                });
                JsonRpcResponse::success(
                    request.id,
                    serde_json::to_value(result).unwrap_or(Value::Null),
                )
            }
            Err(err) => {
                self.inner.session_log.record(&SessionLogEntry {
                    timestamp: chrono::Utc::now(),
                    invocation_id,
                    tool_name: params.name.clone(),
                    argument_digest: digest,
                    outcome_kind: err.kind().into(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    bytes_out: 0,
                    next_cursor: None,
                });
                JsonRpcResponse::error(request.id, err.to_rpc())
            }
        }
    }

    /// validated → authorized → executing, under deadline and cancellation.
    async fn run_invocation(
        &self,
        params: &ToolCallParams,
        invocation_id: &str,
        cancel: CancellationToken,
    ) -> Result<ToolCallResult, ToolError> {
        let tool = self
            .inner
            .registry
            .resolve(&params.name)
            .ok_or_else(|| ToolError::NotFound(format!("unknown tool: {}", params.name)))?;

        let args = tool.descriptor.schema.validate(&params.arguments)?;
        let digest = argument_digest(
            &params.name,
            &Value::Object(args.clone()),
            VOCABULARY,
        );

        let resume = match &params.cursor {
            Some(cursor_id) => Some(self.inner.cursors.redeem(cursor_id, &digest)?),
            None => None,
        };

        let ctx = ToolContext {
            gate: Arc::clone(&self.inner.gate),
            supervisor: Arc::clone(&self.inner.supervisor),
            cursors: Arc::clone(&self.inner.cursors),
            budget: Arc::clone(&self.inner.budget),
            config: Arc::clone(&self.inner.config),
            cancel: cancel.clone(),
            invocation_id: invocation_id.to_string(),
            resume,
        };

        // isolate the handler so a panic never escapes the dispatcher
        let handler = Arc::clone(&tool.handler);
        let handler_ctx = ctx.clone();
        let mut task =
            tokio::spawn(async move { handler.execute(&handler_ctx, args).await });

        let deadline = params.deadline_ms.map(Duration::from_millis);
        let grace = self.inner.config.kill_grace;

        let joined = tokio::select! {
            joined = &mut task => joined,
            _ = cancel.cancelled() => {
                // give the handler the grace window to unwind its children
                match tokio::time::timeout(grace, &mut task).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        task.abort();
                        return Err(ToolError::Cancelled("invocation cancelled".into()));
                    }
                }
            }
            _ = sleep_until_deadline(deadline) => {
                cancel.cancel();
                match tokio::time::timeout(grace, &mut task).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        task.abort();
                        return Err(ToolError::Cancelled("deadline exceeded".into()));
                    }
                }
            }
        };

        let output = match joined {
            Ok(result) => result?,
            Err(join_err) => {
                let correlation = uuid::Uuid::new_v4().simple().to_string();
                error!(correlation_id = %correlation, tool = %params.name, %join_err, "handler crashed");
                return Err(ToolError::Internal(format!(
                    "tool failed; correlation id {}",
                    correlation
                )));
            }
        };

        // a handler that finished despite a racing cancel already has its
        // terminal response en route: deliver it
        self.apply_budget(output, &digest)
    }

    /// §budget contract: emit as-is, keep a list prefix, truncate a blob,
    /// or refuse. Cursors are minted here so checksum binding is uniform.
    fn apply_budget(
        &self,
        output: ToolOutput,
        digest: &str,
    ) -> Result<ToolCallResult, ToolError> {
        let budget = &self.inner.budget;
        let usable = budget.usable();

        match output {
            ToolOutput::Chunks { chunks, next } => {
                let used: usize = chunks
                    .iter()
                    .map(|c| budget.count_value(&serde_json::to_value(c).unwrap_or(Value::Null)))
                    .sum();
                if used > usable {
                    return Err(ToolError::OutputTooLarge(format!(
                        "{} tokens of content against a cap of {}",
                        used, usable
                    )));
                }
                let next_cursor = next.map(|seed| self.inner.cursors.mint(seed, digest.to_string()));
                Ok(ToolCallResult {
                    content: chunks,
                    next_cursor,
                    is_error: false,
                })
            }

            ToolOutput::List {
                items,
                seed,
                complete,
            } => {
                let fit = budget.fit_list(&items, usable);
                if fit == 0 && !items.is_empty() {
                    return Err(ToolError::OutputTooLarge(
                        "a single list item exceeds the response token cap".into(),
                    ));
                }
                let more = fit < items.len() || !complete;
                let next_cursor = more.then(|| {
                    self.inner.cursors.mint(
                        CursorSeed::new(seed.kind, seed.source_id.clone(), seed.offset + fit as u64),
                        digest.to_string(),
                    )
                });
                let kept: Vec<Value> = items.into_iter().take(fit).collect();
                let count = kept.len();
                Ok(ToolCallResult {
                    content: vec![ContentBlock::json(json!({
                        "items": kept,
                        "offset": seed.offset,
                        "count": count,
                    }))],
                    next_cursor,
                    is_error: false,
                })
            }

            ToolOutput::Blob {
                text,
                seed,
                total_bytes,
                live,
            } => {
                let (kept_text, kept_bytes, truncated) = match budget.fit_blob(&text, usable) {
                    BlobFit::Fits => {
                        let len = text.len() as u64;
                        (text, len, false)
                    }
                    BlobFit::Truncated { kept, kept_bytes } => (kept, kept_bytes, true),
                };

                let offset = seed.as_ref().map(|s| s.offset).unwrap_or(0);
                let end = offset + kept_bytes;
                let more = truncated || end < total_bytes || live;

                let rendered = if truncated {
                    format!("{}{}", kept_text, truncation_marker(total_bytes, kept_bytes))
                } else {
                    kept_text
                };
                let next_cursor = match (seed, more) {
                    (Some(seed), true) => Some(self.inner.cursors.mint(
                        CursorSeed::new(seed.kind, seed.source_id, end),
                        digest.to_string(),
                    )),
                    _ => None,
                };
                Ok(ToolCallResult {
                    content: vec![ContentBlock::text(rendered)],
                    next_cursor,
                    is_error: false,
                })
            }
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Duration>) {
    match deadline {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

/// Best-effort id recovery from a malformed frame, so parse errors can
/// still be correlated by the client.
fn recover_id(raw: &str) -> Option<RequestId> {
    let value: Value = serde_json::from_str(raw).ok()?;
    serde_json::from_value(value.get("id")?.clone()).ok()
}
