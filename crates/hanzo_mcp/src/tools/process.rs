//! Process control tools: list sessions, fetch logs, signal, remove.
//!
//! These are thin shells over the supervisor; log fetches are idempotent
//! and continue behind byte-offset cursors.

use super::{ToolContext, ToolHandler, ToolOutput};
use crate::cursor::{CursorKind, CursorSeed};
use crate::error::{ToolError, ToolResult};
use crate::registry::{ToolClass, ToolDescriptor, ToolManifest};
use crate::schema::{opt_str_arg, opt_u64_arg, str_arg, ParamField, ParamKind, ParamSchema};
use crate::supervisor::SignalKind;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;

pub fn manifest() -> ToolManifest {
    ToolManifest {
        package: "process",
        tools: vec![
            (
                ToolDescriptor {
                    name: "process_list",
                    description: "List process sessions with state and recent output",
                    schema: ParamSchema::new().field(
                        ParamField::optional("state", ParamKind::String, "Filter by state")
                            .one_of(&["running", "backgrounded", "exited", "killed"]),
                    ),
                    class: ToolClass::Process,
                },
                Arc::new(ProcessListTool),
            ),
            (
                ToolDescriptor {
                    name: "process_logs",
                    description: "Read captured output of a session from an offset",
                    schema: ParamSchema::new()
                        .field(ParamField::required(
                            "session_id",
                            ParamKind::String,
                            "Session to read",
                        ))
                        .field(ParamField::optional(
                            "from_offset",
                            ParamKind::Integer,
                            "Byte offset into the combined output stream",
                        )),
                    class: ToolClass::Process,
                },
                Arc::new(ProcessLogsTool),
            ),
            (
                ToolDescriptor {
                    name: "process_signal",
                    description: "Deliver a signal to a live session",
                    schema: ParamSchema::new()
                        .field(ParamField::required(
                            "session_id",
                            ParamKind::String,
                            "Session to signal",
                        ))
                        .field(
                            ParamField::required("signal", ParamKind::String, "Signal to deliver")
                                .one_of(&["terminate", "kill", "interrupt"]),
                        ),
                    class: ToolClass::Process,
                },
                Arc::new(ProcessSignalTool),
            ),
            (
                ToolDescriptor {
                    name: "process_remove",
                    description: "Drop a finished session and its cursors from the index",
                    schema: ParamSchema::new().field(ParamField::required(
                        "session_id",
                        ParamKind::String,
                        "Session to remove",
                    )),
                    class: ToolClass::Process,
                },
                Arc::new(ProcessRemoveTool),
            ),
        ],
    }
}

pub struct ProcessListTool;

#[async_trait]
impl ToolHandler for ProcessListTool {
    async fn execute(
        &self,
        ctx: &ToolContext,
        args: Map<String, Value>,
    ) -> ToolResult<ToolOutput> {
        let filter = opt_str_arg(&args, "state").map(str::to_string);

        let items: Vec<Value> = ctx
            .supervisor
            .list()
            .into_iter()
            .filter(|snapshot| {
                filter
                    .as_deref()
                    .map(|f| snapshot.state == f)
                    .unwrap_or(true)
            })
            .map(|snapshot| serde_json::to_value(snapshot).unwrap_or(Value::Null))
            .collect();

        let skip = (ctx.resume_offset() as usize).min(items.len());
        Ok(ToolOutput::List {
            items: items[skip..].to_vec(),
            seed: CursorSeed::new(CursorKind::PaginatedList, "process_list", skip as u64),
            complete: true,
        })
    }
}

pub struct ProcessLogsTool;

#[async_trait]
impl ToolHandler for ProcessLogsTool {
    async fn execute(
        &self,
        ctx: &ToolContext,
        args: Map<String, Value>,
    ) -> ToolResult<ToolOutput> {
        let session_id = str_arg(&args, "session_id")?;
        let from = match &ctx.resume {
            Some(resume) => resume.offset,
            None => opt_u64_arg(&args, "from_offset")?.unwrap_or(0),
        };

        let slice = ctx.supervisor.read_logs(session_id, from)?;
        let (text, _served) = super::shell::sanitize_log_bytes(&slice.bytes);

        Ok(ToolOutput::Blob {
            text,
            seed: Some(CursorSeed::new(
                CursorKind::StreamedLog,
                session_id.to_string(),
                slice.from,
            )),
            total_bytes: slice.total,
            live: slice.state.is_live(),
        })
    }
}

pub struct ProcessSignalTool;

#[async_trait]
impl ToolHandler for ProcessSignalTool {
    async fn execute(
        &self,
        ctx: &ToolContext,
        args: Map<String, Value>,
    ) -> ToolResult<ToolOutput> {
        let session_id = str_arg(&args, "session_id")?;
        let signal_name = str_arg(&args, "signal")?;
        let signal = SignalKind::parse(signal_name).ok_or_else(|| {
            ToolError::InvalidArguments(format!("unknown signal `{}`", signal_name))
        })?;

        let state = ctx.supervisor.signal(session_id, signal)?;
        Ok(ToolOutput::json(json!({
            "session_id": session_id,
            "signal": signal_name,
            "state": state.as_str(),
        })))
    }
}

pub struct ProcessRemoveTool;

#[async_trait]
impl ToolHandler for ProcessRemoveTool {
    async fn execute(
        &self,
        ctx: &ToolContext,
        args: Map<String, Value>,
    ) -> ToolResult<ToolOutput> {
        let session_id = str_arg(&args, "session_id")?;
        ctx.supervisor.remove(session_id)?;
        // outstanding log cursors die with the session
        ctx.cursors.invalidate_source(session_id);

        Ok(ToolOutput::json(json!({
            "session_id": session_id,
            "removed": true,
        })))
    }
}
