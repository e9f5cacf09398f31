//! Filesystem tools: read_file, write_file, edit_file.
//!
//! All paths go through the permission gate before any I/O. Reads render
//! with line numbers and continue behind a byte-offset cursor when the
//! rendering outgrows the token cap; edits are exact-match, unique-match
//! replacements so a round trip (`old→new`, then `new→old`) restores the
//! file byte for byte.

use super::{ToolContext, ToolHandler, ToolOutput};
use crate::cursor::{CursorKind, CursorSeed};
use crate::error::{ToolError, ToolResult};
use crate::registry::{ToolClass, ToolDescriptor, ToolManifest};
use crate::schema::{opt_u64_arg, str_arg, ParamField, ParamKind, ParamSchema};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::Arc;

/// Files past this size must be read with a line range.
const MAX_FILE_READ: u64 = 32 * 1024 * 1024;

pub fn manifest() -> ToolManifest {
    ToolManifest {
        package: "fs",
        tools: vec![
            (
                ToolDescriptor {
                    name: "read_file",
                    description: "Read a file with line numbers, optionally a line range",
                    schema: ParamSchema::new()
                        .field(ParamField::required(
                            "path",
                            ParamKind::String,
                            "File to read (must be within allowed paths)",
                        ))
                        .field(ParamField::optional(
                            "offset",
                            ParamKind::Integer,
                            "First line to return, 1-based",
                        ))
                        .field(ParamField::optional(
                            "limit",
                            ParamKind::Integer,
                            "Maximum number of lines to return",
                        )),
                    class: ToolClass::FilesystemRead,
                },
                Arc::new(ReadFileTool),
            ),
            (
                ToolDescriptor {
                    name: "write_file",
                    description: "Create or overwrite a file with the given content",
                    schema: ParamSchema::new()
                        .field(ParamField::required(
                            "path",
                            ParamKind::String,
                            "File to write (must be within allowed paths)",
                        ))
                        .field(ParamField::required(
                            "content",
                            ParamKind::String,
                            "Full file content",
                        )),
                    class: ToolClass::FilesystemWrite,
                },
                Arc::new(WriteFileTool),
            ),
            (
                ToolDescriptor {
                    name: "edit_file",
                    description: "Replace one exact, unique occurrence of old_text with new_text",
                    schema: ParamSchema::new()
                        .field(ParamField::required(
                            "path",
                            ParamKind::String,
                            "File to edit (must be within allowed paths)",
                        ))
                        .field(ParamField::required(
                            "old_text",
                            ParamKind::String,
                            "Exact text to replace; must occur exactly once",
                        ))
                        .field(ParamField::required(
                            "new_text",
                            ParamKind::String,
                            "Replacement text",
                        )),
                    class: ToolClass::FilesystemWrite,
                },
                Arc::new(EditFileTool),
            ),
        ],
    }
}

pub struct ReadFileTool;

#[async_trait]
impl ToolHandler for ReadFileTool {
    async fn execute(
        &self,
        ctx: &ToolContext,
        args: Map<String, Value>,
    ) -> ToolResult<ToolOutput> {
        let path = str_arg(&args, "path")?;
        let first_line = opt_u64_arg(&args, "offset")?.unwrap_or(1).max(1);
        let limit = opt_u64_arg(&args, "limit")?;

        let canonical = ctx.gate.authorize_read(Path::new(path))?;

        let meta = tokio::fs::metadata(&canonical).await.map_err(|e| {
            ToolError::ExecutionFailed(format!("cannot read {}: {}", canonical.display(), e))
        })?;
        if !meta.is_file() {
            return Err(ToolError::InvalidArguments(format!(
                "not a regular file: {}",
                canonical.display()
            )));
        }
        if meta.len() > MAX_FILE_READ {
            return Err(ToolError::OutputTooLarge(format!(
                "{} is {} bytes; read it with a line range",
                canonical.display(),
                meta.len()
            )));
        }

        let raw = tokio::fs::read(&canonical).await.map_err(|e| {
            ToolError::ExecutionFailed(format!("cannot read {}: {}", canonical.display(), e))
        })?;
        let text = String::from_utf8_lossy(&raw);

        let mut rendered = String::with_capacity(raw.len() + raw.len() / 16);
        for (index, line) in text.lines().enumerate() {
            let number = index as u64 + 1;
            if number < first_line {
                continue;
            }
            if let Some(limit) = limit {
                if number >= first_line + limit {
                    break;
                }
            }
            rendered.push_str(&format!("{}: {}\n", number, line));
        }

        let total_bytes = rendered.len() as u64;
        let from = ctx.resume_offset().min(total_bytes) as usize;
        Ok(ToolOutput::Blob {
            text: rendered[from..].to_string(),
            seed: Some(CursorSeed::new(
                CursorKind::StreamedLog,
                format!("file:{}", canonical.display()),
                from as u64,
            )),
            total_bytes,
            live: false,
        })
    }
}

pub struct WriteFileTool;

#[async_trait]
impl ToolHandler for WriteFileTool {
    async fn execute(
        &self,
        ctx: &ToolContext,
        args: Map<String, Value>,
    ) -> ToolResult<ToolOutput> {
        let path = str_arg(&args, "path")?;
        let content = str_arg(&args, "content")?;

        let canonical = ctx.gate.authorize_write(Path::new(path))?;
        if let Some(parent) = canonical.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ToolError::ExecutionFailed(format!(
                    "cannot create parent of {}: {}",
                    canonical.display(),
                    e
                ))
            })?;
        }
        tokio::fs::write(&canonical, content).await.map_err(|e| {
            ToolError::ExecutionFailed(format!("cannot write {}: {}", canonical.display(), e))
        })?;

        Ok(ToolOutput::json(json!({
            "path": canonical.display().to_string(),
            "bytes_written": content.len(),
        })))
    }
}

pub struct EditFileTool;

#[async_trait]
impl ToolHandler for EditFileTool {
    async fn execute(
        &self,
        ctx: &ToolContext,
        args: Map<String, Value>,
    ) -> ToolResult<ToolOutput> {
        let path = str_arg(&args, "path")?;
        let old_text = str_arg(&args, "old_text")?;
        let new_text = str_arg(&args, "new_text")?;

        if old_text.is_empty() {
            return Err(ToolError::InvalidArguments("old_text is empty".into()));
        }

        let canonical = ctx.gate.authorize_write(Path::new(path))?;
        let content = tokio::fs::read_to_string(&canonical).await.map_err(|e| {
            ToolError::ExecutionFailed(format!("cannot read {}: {}", canonical.display(), e))
        })?;

        let matches = content.matches(old_text).count();
        match matches {
            0 => {
                return Err(ToolError::InvalidArguments(format!(
                    "old_text not found in {}",
                    canonical.display()
                )))
            }
            1 => {}
            n => {
                return Err(ToolError::InvalidArguments(format!(
                    "old_text is ambiguous in {}: {} occurrences",
                    canonical.display(),
                    n
                )))
            }
        }

        let updated = content.replacen(old_text, new_text, 1);
        tokio::fs::write(&canonical, &updated).await.map_err(|e| {
            ToolError::ExecutionFailed(format!("cannot write {}: {}", canonical.display(), e))
        })?;

        Ok(ToolOutput::json(json!({
            "path": canonical.display().to_string(),
            "bytes_written": updated.len(),
        })))
    }
}
