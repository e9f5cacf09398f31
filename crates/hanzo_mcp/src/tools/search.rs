//! Search tools: byte-regex search over a tree, and depth-bounded
//! directory enumeration.
//!
//! Both walk in sorted order so pagination by cursor sees a stable
//! sequence (absent concurrent mutation). Per-file errors are embedded in
//! the result list instead of failing the whole call.

use super::{ToolContext, ToolHandler, ToolOutput};
use crate::cursor::{CursorKind, CursorSeed};
use crate::error::{ToolError, ToolResult};
use crate::registry::{ToolClass, ToolDescriptor, ToolManifest};
use crate::schema::{opt_str_arg, opt_u64_arg, str_arg, ParamField, ParamKind, ParamSchema};
use async_trait::async_trait;
use globset::{Glob, GlobMatcher};
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::Arc;

/// Items collected past the resume offset in one call; the budgeter trims
/// further, and anything beyond continues behind the cursor.
const COLLECT_WINDOW: usize = 2048;

/// Files past this size are reported as skipped rather than scanned.
const MAX_SCAN_BYTES: u64 = 8 * 1024 * 1024;

/// Preview length per hit, in characters.
const PREVIEW_CHARS: usize = 200;

pub fn manifest() -> ToolManifest {
    ToolManifest {
        package: "search",
        tools: vec![
            (
                ToolDescriptor {
                    name: "search",
                    description: "Regex search over a directory tree with include/exclude globs",
                    schema: ParamSchema::new()
                        .field(ParamField::required(
                            "pattern",
                            ParamKind::String,
                            "Byte regex applied per line",
                        ))
                        .field(ParamField::required(
                            "path",
                            ParamKind::String,
                            "Root of the tree to search (must be within allowed paths)",
                        ))
                        .field(ParamField::optional(
                            "include",
                            ParamKind::String,
                            "Glob a file name must match (e.g. *.rs)",
                        ))
                        .field(ParamField::optional(
                            "exclude",
                            ParamKind::String,
                            "Glob that removes matching file names",
                        ))
                        .field(ParamField::optional(
                            "max_results",
                            ParamKind::Integer,
                            "Stop after this many hits across all pages",
                        )),
                    class: ToolClass::Search,
                },
                Arc::new(SearchTool),
            ),
            (
                ToolDescriptor {
                    name: "tree",
                    description: "Depth-bounded directory enumeration with per-entry stat",
                    schema: ParamSchema::new()
                        .field(ParamField::required(
                            "path",
                            ParamKind::String,
                            "Directory to enumerate (must be within allowed paths)",
                        ))
                        .field(
                            ParamField::optional(
                                "depth",
                                ParamKind::Integer,
                                "Maximum depth below the root",
                            )
                            .with_default(json!(3)),
                        ),
                    class: ToolClass::Search,
                },
                Arc::new(TreeTool),
            ),
        ],
    }
}

pub struct SearchTool;

#[async_trait]
impl ToolHandler for SearchTool {
    async fn execute(
        &self,
        ctx: &ToolContext,
        args: Map<String, Value>,
    ) -> ToolResult<ToolOutput> {
        let pattern = str_arg(&args, "pattern")?;
        let path = str_arg(&args, "path")?;
        let include = compile_glob(opt_str_arg(&args, "include"))?;
        let exclude = compile_glob(opt_str_arg(&args, "exclude"))?;
        let max_results = opt_u64_arg(&args, "max_results")?;

        let regex = regex::bytes::Regex::new(pattern)
            .map_err(|e| ToolError::InvalidArguments(format!("bad pattern: {}", e)))?;
        let root = ctx.gate.authorize_read(Path::new(path))?;
        let skip = ctx.resume_offset();

        // the walk is sync and potentially large; keep the runtime breathing
        let cancel = ctx.cancel.clone();
        let (items, complete) = tokio::task::spawn_blocking(move || {
            scan_tree(&root, &regex, include, exclude, skip, max_results, &cancel)
        })
        .await
        .map_err(|e| ToolError::Internal(format!("search worker: {}", e)))??;

        Ok(ToolOutput::List {
            items,
            seed: CursorSeed::new(
                CursorKind::BatchedSearch,
                format!("search:{}", path),
                skip,
            ),
            complete,
        })
    }
}

#[allow(clippy::too_many_arguments)]
fn scan_tree(
    root: &Path,
    regex: &regex::bytes::Regex,
    include: Option<GlobMatcher>,
    exclude: Option<GlobMatcher>,
    skip: u64,
    max_results: Option<u64>,
    cancel: &tokio_util::sync::CancellationToken,
) -> ToolResult<(Vec<Value>, bool)> {
    let mut seen = 0u64;
    let mut items = Vec::new();

    let walker = walkdir::WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file());

    for entry in walker {
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled("search cancelled".into()));
        }

        let name = entry.file_name().to_string_lossy();
        if let Some(include) = &include {
            if !include.is_match(name.as_ref()) {
                continue;
            }
        }
        if let Some(exclude) = &exclude {
            if exclude.is_match(name.as_ref()) {
                continue;
            }
        }

        let path_display = entry.path().display().to_string();
        if entry.metadata().map(|m| m.len()).unwrap_or(0) > MAX_SCAN_BYTES {
            let item = json!({ "path": path_display, "error": "file too large to scan" });
            if push_item(&mut items, item, &mut seen, skip) {
                return Ok((items, false));
            }
            continue;
        }

        let bytes = match std::fs::read(entry.path()) {
            Ok(bytes) => bytes,
            Err(err) => {
                let item = json!({ "path": path_display, "error": err.to_string() });
                if push_item(&mut items, item, &mut seen, skip) {
                    return Ok((items, false));
                }
                continue;
            }
        };

        for (line_index, line) in bytes.split(|b| *b == b'\n').enumerate() {
            if !regex.is_match(line) {
                continue;
            }
            let preview: String = String::from_utf8_lossy(line)
                .trim_end()
                .chars()
                .take(PREVIEW_CHARS)
                .collect();
            let item = json!({
                "path": path_display,
                "line": line_index + 1,
                "preview": preview,
            });
            if push_item(&mut items, item, &mut seen, skip) {
                return Ok((items, false));
            }
            if let Some(max) = max_results {
                if seen >= max {
                    return Ok((items, true));
                }
            }
        }
    }

    Ok((items, true))
}

/// Append once past the skip offset. Returns true when the collection
/// window is full and the walk should stop with `complete = false`.
fn push_item(items: &mut Vec<Value>, item: Value, seen: &mut u64, skip: u64) -> bool {
    *seen += 1;
    if *seen <= skip {
        return false;
    }
    items.push(item);
    items.len() >= COLLECT_WINDOW
}

fn compile_glob(pattern: Option<&str>) -> ToolResult<Option<GlobMatcher>> {
    match pattern {
        None => Ok(None),
        Some(p) => Glob::new(p)
            .map(|g| Some(g.compile_matcher()))
            .map_err(|e| ToolError::InvalidArguments(format!("bad glob `{}`: {}", p, e))),
    }
}

pub struct TreeTool;

#[async_trait]
impl ToolHandler for TreeTool {
    async fn execute(
        &self,
        ctx: &ToolContext,
        args: Map<String, Value>,
    ) -> ToolResult<ToolOutput> {
        let path = str_arg(&args, "path")?;
        let depth = opt_u64_arg(&args, "depth")?.unwrap_or(3).max(1) as usize;

        let root = ctx.gate.authorize_read(Path::new(path))?;
        let skip = ctx.resume_offset();

        let root_clone = root.clone();
        let (items, complete) = tokio::task::spawn_blocking(move || {
            enumerate_tree(&root_clone, depth, skip)
        })
        .await
        .map_err(|e| ToolError::Internal(format!("tree worker: {}", e)))?;

        Ok(ToolOutput::List {
            items,
            seed: CursorSeed::new(
                CursorKind::PaginatedList,
                format!("tree:{}", root.display()),
                skip,
            ),
            complete,
        })
    }
}

fn enumerate_tree(root: &Path, depth: usize, skip: u64) -> (Vec<Value>, bool) {
    let mut seen = 0u64;
    let mut items = Vec::new();

    for entry in walkdir::WalkDir::new(root)
        .min_depth(1)
        .max_depth(depth)
        .sort_by_file_name()
    {
        let item = match entry {
            Ok(entry) => {
                let kind = if entry.file_type().is_dir() {
                    "dir"
                } else if entry.file_type().is_symlink() {
                    "symlink"
                } else {
                    "file"
                };
                let relative = entry
                    .path()
                    .strip_prefix(root)
                    .unwrap_or(entry.path())
                    .display()
                    .to_string();
                let (size, modified) = match entry.metadata() {
                    Ok(meta) => (
                        Some(meta.len()),
                        meta.modified()
                            .ok()
                            .map(chrono::DateTime::<chrono::Utc>::from)
                            .map(|dt| dt.to_rfc3339()),
                    ),
                    Err(_) => (None, None),
                };
                json!({
                    "path": relative,
                    "kind": kind,
                    "size": size,
                    "modified": modified,
                })
            }
            Err(err) => json!({ "error": err.to_string() }),
        };

        seen += 1;
        if seen <= skip {
            continue;
        }
        items.push(item);
        if items.len() >= COLLECT_WINDOW {
            return (items, false);
        }
    }

    (items, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::TokenBudgeter;
    use crate::config::ServerConfig;
    use crate::cursor::CursorStore;
    use crate::security::{PathRule, PermissionGate};
    use crate::supervisor::ProcessSupervisor;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn context(temp: &TempDir) -> ToolContext {
        ToolContext {
            gate: Arc::new(PermissionGate::new(
                vec![PathRule::allow(temp.path().to_path_buf())],
                true,
            )),
            supervisor: Arc::new(ProcessSupervisor::new(
                temp.path().join("processes"),
                1024,
                Duration::from_millis(100),
            )),
            cursors: Arc::new(CursorStore::new(Duration::from_secs(60))),
            budget: Arc::new(TokenBudgeter::new(25_000).unwrap()),
            config: Arc::new(ServerConfig::default()),
            cancel: CancellationToken::new(),
            invocation_id: "inv_test".into(),
            resume: None,
        }
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    fn items(out: ToolOutput) -> (Vec<Value>, bool) {
        match out {
            ToolOutput::List { items, complete, .. } => (items, complete),
            other => panic!("expected list, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn search_finds_matches_with_line_numbers() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.txt"), "nothing\nneedle here\n").unwrap();
        std::fs::write(temp.path().join("b.txt"), "needle again\n").unwrap();

        let ctx = context(&temp);
        let out = SearchTool
            .execute(
                &ctx,
                args(json!({ "pattern": "needle", "path": temp.path().display().to_string() })),
            )
            .await
            .unwrap();

        let (items, complete) = items(out);
        assert!(complete);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["line"], 2);
        assert!(items[0]["preview"].as_str().unwrap().contains("needle"));
    }

    #[tokio::test]
    async fn search_with_no_matches_is_empty_not_error() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.txt"), "quiet\n").unwrap();

        let ctx = context(&temp);
        let out = SearchTool
            .execute(
                &ctx,
                args(json!({ "pattern": "absent", "path": temp.path().display().to_string() })),
            )
            .await
            .unwrap();

        let (items, complete) = items(out);
        assert!(complete);
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn search_applies_include_and_exclude_globs() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("keep.rs"), "hit\n").unwrap();
        std::fs::write(temp.path().join("skip.txt"), "hit\n").unwrap();

        let ctx = context(&temp);
        let out = SearchTool
            .execute(
                &ctx,
                args(json!({
                    "pattern": "hit",
                    "path": temp.path().display().to_string(),
                    "include": "*.rs"
                })),
            )
            .await
            .unwrap();
        let (found, _) = items(out);
        assert_eq!(found.len(), 1);
        assert!(found[0]["path"].as_str().unwrap().ends_with("keep.rs"));

        let out = SearchTool
            .execute(
                &ctx,
                args(json!({
                    "pattern": "hit",
                    "path": temp.path().display().to_string(),
                    "exclude": "*.rs"
                })),
            )
            .await
            .unwrap();
        let (found, _) = items(out);
        assert_eq!(found.len(), 1);
        assert!(found[0]["path"].as_str().unwrap().ends_with("skip.txt"));
    }

    #[tokio::test]
    async fn search_rejects_bad_pattern() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp);

        let err = SearchTool
            .execute(
                &ctx,
                args(json!({ "pattern": "([", "path": temp.path().display().to_string() })),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn search_resumes_from_offset_without_overlap() {
        let temp = TempDir::new().unwrap();
        let mut body = String::new();
        for i in 0..10 {
            body.push_str(&format!("match line {}\n", i));
        }
        std::fs::write(temp.path().join("many.txt"), &body).unwrap();

        let ctx = context(&temp);
        let all = {
            let out = SearchTool
                .execute(
                    &ctx,
                    args(json!({ "pattern": "match", "path": temp.path().display().to_string() })),
                )
                .await
                .unwrap();
            items(out).0
        };

        let mut resumed_ctx = context(&temp);
        resumed_ctx.resume = Some(crate::cursor::CursorState {
            kind: CursorKind::BatchedSearch,
            source_id: "search:x".into(),
            offset: 4,
            checksum: String::new(),
        });
        let tail = {
            let out = SearchTool
                .execute(
                    &resumed_ctx,
                    args(json!({ "pattern": "match", "path": temp.path().display().to_string() })),
                )
                .await
                .unwrap();
            items(out).0
        };

        assert_eq!(tail.len(), all.len() - 4);
        assert_eq!(tail[0], all[4]);
    }

    #[tokio::test]
    async fn tree_enumerates_with_depth_bound() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("d1").join("d2")).unwrap();
        std::fs::write(temp.path().join("top.txt"), "x").unwrap();
        std::fs::write(temp.path().join("d1").join("mid.txt"), "x").unwrap();
        std::fs::write(temp.path().join("d1").join("d2").join("deep.txt"), "x").unwrap();

        let ctx = context(&temp);
        let out = TreeTool
            .execute(
                &ctx,
                args(json!({ "path": temp.path().display().to_string(), "depth": 1 })),
            )
            .await
            .unwrap();

        let (entries, complete) = items(out);
        assert!(complete);
        let paths: Vec<&str> = entries
            .iter()
            .map(|e| e["path"].as_str().unwrap())
            .collect();
        assert!(paths.contains(&"d1"));
        assert!(paths.contains(&"top.txt"));
        assert!(!paths.iter().any(|p| p.contains("mid.txt")));
    }

    #[tokio::test]
    async fn tree_reports_kinds_and_sizes() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("f.bin"), vec![0u8; 64]).unwrap();

        let ctx = context(&temp);
        let out = TreeTool
            .execute(&ctx, args(json!({ "path": temp.path().display().to_string() })))
            .await
            .unwrap();

        let (entries, _) = items(out);
        let file = entries
            .iter()
            .find(|e| e["path"] == "f.bin")
            .expect("f.bin listed");
        assert_eq!(file["kind"], "file");
        assert_eq!(file["size"], 64);
    }
}
