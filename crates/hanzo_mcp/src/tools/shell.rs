//! Shell tools: single commands and DAG invocations.
//!
//! `shell` runs one command through the supervisor with the server's
//! foreground deadline; a child that outlives it is backgrounded and the
//! provisional reply names the session plus a log cursor. `dag_shell` runs
//! a declared step graph; its transcript is stashed in the cursor store so
//! pagination never re-executes the graph.

use super::{ToolContext, ToolHandler, ToolOutput};
use crate::cursor::{CursorKind, CursorSeed};
use crate::dag::{parse_steps, DagRunner};
use crate::error::{ToolError, ToolResult};
use crate::protocol::ContentBlock;
use crate::registry::{ToolClass, ToolDescriptor, ToolManifest};
use crate::schema::{bool_arg, opt_str_arg, opt_u64_arg, str_arg, ParamField, ParamKind, ParamSchema};
use crate::supervisor::{ForegroundOutcome, SignalKind, SpawnSpec};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Pause before the first log read so collectors drain the pipes of a
/// just-exited child.
const COLLECT_SETTLE: Duration = Duration::from_millis(30);

pub fn manifest() -> ToolManifest {
    ToolManifest {
        package: "shell",
        tools: vec![
            (
                ToolDescriptor {
                    name: "shell",
                    description: "Run a shell command; long runs are auto-backgrounded",
                    schema: ParamSchema::new()
                        .field(ParamField::required(
                            "command",
                            ParamKind::String,
                            "Command line passed to sh -c",
                        ))
                        .field(ParamField::optional(
                            "cwd",
                            ParamKind::String,
                            "Working directory (must be within allowed paths)",
                        ))
                        .field(ParamField::optional(
                            "env",
                            ParamKind::Object,
                            "Extra environment variables",
                        ))
                        .field(ParamField::optional(
                            "stdin",
                            ParamKind::String,
                            "Bytes fed to the child's stdin",
                        ))
                        .field(
                            ParamField::optional(
                                "background",
                                ParamKind::Boolean,
                                "Background immediately instead of waiting",
                            )
                            .with_default(json!(false)),
                        ),
                    class: ToolClass::Shell,
                },
                Arc::new(ShellTool),
            ),
            (
                ToolDescriptor {
                    name: "dag_shell",
                    description: "Run a dependency graph of shell steps with parallel fan-out",
                    schema: ParamSchema::new()
                        .field(ParamField::required(
                            "steps",
                            ParamKind::Array(Box::new(ParamKind::Any)),
                            "Steps: strings chain sequentially; objects declare {id, run, after}; {parallel: [...]} fans out",
                        ))
                        .field(ParamField::optional(
                            "max_parallel",
                            ParamKind::Integer,
                            "Concurrent steps (default: CPU count)",
                        ))
                        .field(ParamField::optional(
                            "cwd",
                            ParamKind::String,
                            "Working directory for every step",
                        )),
                    class: ToolClass::Shell,
                },
                Arc::new(DagShellTool),
            ),
        ],
    }
}

fn resolve_cwd(arg: Option<&str>) -> ToolResult<PathBuf> {
    match arg {
        Some(dir) => Ok(PathBuf::from(dir)),
        None => std::env::current_dir()
            .map_err(|e| ToolError::ExecutionFailed(format!("cannot resolve cwd: {}", e))),
    }
}

fn env_additions(args: &Map<String, Value>) -> ToolResult<Vec<(String, String)>> {
    match args.get("env") {
        None => Ok(Vec::new()),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| {
                v.as_str()
                    .map(|s| (k.clone(), s.to_string()))
                    .ok_or_else(|| {
                        ToolError::InvalidArguments(format!("env value for `{}` must be a string", k))
                    })
            })
            .collect(),
        Some(_) => Err(ToolError::InvalidArguments("env must be an object".into())),
    }
}

pub struct ShellTool;

impl ShellTool {
    /// Render captured output (plus disposition header) under the budget,
    /// continuing behind a byte-offset log cursor.
    fn render_logs(ctx: &ToolContext, session_id: &str, from: u64) -> ToolResult<ToolOutput> {
        let slice = ctx.supervisor.read_logs(session_id, from)?;
        let (text, served) = sanitize_log_bytes(&slice.bytes);

        let end = slice.from + served;
        if end < slice.total || slice.state.is_live() {
            // more output exists (or may yet arrive): hand the blob to the
            // dispatcher so truncation and the continuation offset stay
            // token-accurate
            return Ok(ToolOutput::Blob {
                text,
                seed: Some(CursorSeed::new(
                    CursorKind::StreamedLog,
                    session_id.to_string(),
                    slice.from,
                )),
                total_bytes: slice.total,
                live: slice.state.is_live(),
            });
        }

        Ok(ToolOutput::Chunks {
            chunks: vec![
                ContentBlock::json(json!({
                    "session_id": session_id,
                    "state": slice.state.as_str(),
                    "exit_status": slice.exit_status,
                })),
                ContentBlock::text(text),
            ],
            next: None,
        })
    }
}

#[async_trait]
impl ToolHandler for ShellTool {
    async fn execute(
        &self,
        ctx: &ToolContext,
        args: Map<String, Value>,
    ) -> ToolResult<ToolOutput> {
        // a cursor resume is a log fetch, never a re-run
        if let Some(resume) = &ctx.resume {
            let session_id = resume.source_id.clone();
            return Self::render_logs(ctx, &session_id, resume.offset);
        }

        let command = str_arg(&args, "command")?;
        if command.trim().is_empty() {
            return Err(ToolError::InvalidArguments("empty command".into()));
        }
        let background = bool_arg(&args, "background", false);
        let env = env_additions(&args)?;
        let stdin = opt_str_arg(&args, "stdin").map(|s| s.as_bytes().to_vec());

        let argv = vec!["sh".to_string(), "-c".to_string(), command.to_string()];
        let cwd = resolve_cwd(opt_str_arg(&args, "cwd"))?;
        let canonical_cwd = ctx.gate.authorize_exec(&argv, &cwd)?;

        let session_id = ctx
            .supervisor
            .spawn(SpawnSpec {
                argv,
                cwd: canonical_cwd,
                env,
                stdin,
            })
            .await?;

        let deadline = if background {
            Some(Duration::ZERO)
        } else if ctx.config.auto_background.is_zero() {
            None
        } else {
            Some(ctx.config.auto_background)
        };

        let outcome = tokio::select! {
            outcome = ctx.supervisor.wait_foreground(&session_id, deadline) => outcome?,
            _ = ctx.cancel.cancelled() => {
                let _ = ctx.supervisor.signal(&session_id, SignalKind::Terminate);
                let supervisor = Arc::clone(&ctx.supervisor);
                let sid = session_id.clone();
                let grace = supervisor.kill_grace();
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    let _ = supervisor.signal(&sid, SignalKind::Kill);
                });
                return Err(ToolError::Cancelled(format!(
                    "shell command cancelled; session {} terminated",
                    session_id
                )));
            }
        };

        match outcome {
            ForegroundOutcome::Exited { .. } => {
                tokio::time::sleep(COLLECT_SETTLE).await;
                Self::render_logs(ctx, &session_id, 0)
            }
            ForegroundOutcome::Backgrounded => Ok(ToolOutput::Chunks {
                chunks: vec![ContentBlock::text(format!(
                    "backgrounded as {}",
                    session_id
                ))],
                next: Some(CursorSeed::new(
                    CursorKind::StreamedLog,
                    session_id.clone(),
                    0,
                )),
            }),
        }
    }
}

/// Serve the longest valid UTF-8 prefix so byte offsets into the raw
/// stream stay exact; a stream that is binary from the first byte falls
/// back to lossy rendering of the whole slice.
pub(crate) fn sanitize_log_bytes(bytes: &[u8]) -> (String, u64) {
    match std::str::from_utf8(bytes) {
        Ok(text) => (text.to_string(), bytes.len() as u64),
        Err(err) if err.valid_up_to() > 0 => {
            let cut = err.valid_up_to();
            (
                std::str::from_utf8(&bytes[..cut])
                    .expect("validated prefix")
                    .to_string(),
                cut as u64,
            )
        }
        Err(_) => (
            String::from_utf8_lossy(bytes).into_owned(),
            bytes.len() as u64,
        ),
    }
}

pub struct DagShellTool;

#[async_trait]
impl ToolHandler for DagShellTool {
    async fn execute(
        &self,
        ctx: &ToolContext,
        args: Map<String, Value>,
    ) -> ToolResult<ToolOutput> {
        // resume serves the stashed transcript; the graph never re-runs
        if let Some(resume) = &ctx.resume {
            let stash = ctx.cursors.stashed(&resume.source_id).ok_or_else(|| {
                ToolError::Gone(format!(
                    "dag transcript no longer available: {}",
                    resume.source_id
                ))
            })?;
            let from = (resume.offset as usize).min(stash.len());
            return Ok(ToolOutput::List {
                items: stash[from..].to_vec(),
                seed: CursorSeed::new(
                    CursorKind::PaginatedList,
                    resume.source_id.clone(),
                    resume.offset,
                ),
                complete: true,
            });
        }

        let steps_value = args
            .get("steps")
            .ok_or_else(|| ToolError::InvalidArguments("missing required field `steps`".into()))?;
        let steps = parse_steps(steps_value)?;
        let max_parallel = opt_u64_arg(&args, "max_parallel")?
            .map(|n| n as usize)
            .unwrap_or_else(num_cpus::get);

        let argv_probe = vec!["sh".to_string()];
        let cwd = resolve_cwd(opt_str_arg(&args, "cwd"))?;
        let canonical_cwd = ctx.gate.authorize_exec(&argv_probe, &cwd)?;

        let runner = DagRunner::new(Arc::clone(&ctx.supervisor), canonical_cwd, max_parallel);
        let outcome = runner.run(steps, &ctx.cancel).await?;

        let mut items: Vec<Value> = vec![json!({
            "success": outcome.success,
            "failed_step": outcome.failed_step,
        })];
        for report in &outcome.steps {
            items.push(serde_json::to_value(report)?);
        }

        let source_id = format!("dag:{}", ctx.invocation_id);
        ctx.cursors.stash_items(&source_id, items.clone());

        Ok(ToolOutput::List {
            items,
            seed: CursorSeed::new(CursorKind::PaginatedList, source_id, 0),
            complete: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_passes_clean_utf8() {
        let (text, served) = sanitize_log_bytes(b"plain output\n");
        assert_eq!(text, "plain output\n");
        assert_eq!(served, 13);
    }

    #[test]
    fn sanitize_cuts_at_split_multibyte_char() {
        let mut bytes = "ok é".as_bytes().to_vec();
        bytes.truncate(bytes.len() - 1); // é is two bytes; keep only the first
        let (text, served) = sanitize_log_bytes(&bytes);
        assert_eq!(text, "ok ");
        assert_eq!(served, 3);
    }

    #[test]
    fn sanitize_falls_back_to_lossy_for_binary() {
        let (text, served) = sanitize_log_bytes(&[0xff, 0xfe, b'a']);
        assert_eq!(served, 3);
        assert!(text.contains('a'));
    }

    #[test]
    fn env_additions_require_string_values() {
        let args: Map<String, Value> = serde_json::from_str(r#"{"env": {"A": "1"}}"#).unwrap();
        assert_eq!(env_additions(&args).unwrap(), vec![("A".into(), "1".into())]);

        let args: Map<String, Value> = serde_json::from_str(r#"{"env": {"A": 1}}"#).unwrap();
        assert!(env_additions(&args).is_err());
    }
}
