//! Permission Gate - Filesystem and Exec Authorization
//!
//! Every filesystem or process side effect in the server flows through this
//! module with a fully resolved path. The gate is built once at startup from
//! the configured rule list and never mutated by tool bodies.

mod path_rules;

pub use path_rules::{PathRule, RuleAction, RuleSet, MAX_SYMLINK_DEPTH};

use crate::error::{ToolError, ToolResult};
use std::path::{Path, PathBuf};

/// Authorizes reads, writes, and process launches against the rule set.
#[derive(Debug, Clone)]
pub struct PermissionGate {
    rules: RuleSet,
    trusted_exec: bool,
}

impl PermissionGate {
    pub fn new(rules: Vec<PathRule>, trusted_exec: bool) -> Self {
        Self {
            rules: RuleSet::new(rules),
            trusted_exec,
        }
    }

    /// Authorize reading from `path`. Returns the canonical path.
    pub fn authorize_read(&self, path: &Path) -> ToolResult<PathBuf> {
        self.rules.authorize(path)
    }

    /// Authorize writing to `path`. The file itself may not exist yet; its
    /// resolved location still has to match an allow rule.
    pub fn authorize_write(&self, path: &Path) -> ToolResult<PathBuf> {
        self.rules.authorize(path)
    }

    /// Authorize launching `argv` with working directory `cwd`.
    ///
    /// The binary is resolved via `PATH` (relative to `cwd` for bare names)
    /// and its directory must be allow-listed unless the gate was built with
    /// `trusted_exec`. Returns the canonical working directory.
    pub fn authorize_exec(&self, argv: &[String], cwd: &Path) -> ToolResult<PathBuf> {
        let program = argv
            .first()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("empty command".into()))?;

        let canonical_cwd = self.rules.authorize(cwd)?;

        if !self.trusted_exec {
            let binary = self.resolve_binary(program, &canonical_cwd)?;
            let bin_dir = binary.parent().unwrap_or(Path::new("/"));
            self.rules.authorize(bin_dir).map_err(|_| {
                ToolError::PermissionDenied(format!(
                    "binary directory not allow-listed: {}",
                    bin_dir.display()
                ))
            })?;
        }

        Ok(canonical_cwd)
    }

    fn resolve_binary(&self, program: &str, cwd: &Path) -> ToolResult<PathBuf> {
        if program.contains(std::path::MAIN_SEPARATOR) {
            return self.rules.resolve(Path::new(program));
        }
        let path_var = std::env::var_os("PATH").unwrap_or_default();
        which::which_in(program, Some(path_var), cwd).map_err(|_| {
            ToolError::ExecutionFailed(format!("binary not found on PATH: {}", program))
        })
    }

    /// The rule list, canonicalised (for startup diagnostics).
    pub fn rules(&self) -> &[PathRule] {
        self.rules.rules()
    }

    pub fn trusted_exec(&self) -> bool {
        self.trusted_exec
    }
}
