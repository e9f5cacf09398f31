//! Server configuration and persisted state layout.
//!
//! Everything tunable from the CLI (or its environment counterparts) lands
//! here once, before the server root object is constructed. Tool bodies see
//! the config read-only.

use crate::budget::DEFAULT_TOKEN_CAP;
use crate::security::{PathRule, RuleAction};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Default foreground deadline before a live child is auto-backgrounded.
pub const DEFAULT_AUTO_BACKGROUND: Duration = Duration::from_secs(45);

/// Grace window between `terminate` and the escalating `kill`.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// Idle lifetime of an unredeemed cursor.
pub const DEFAULT_CURSOR_IDLE: Duration = Duration::from_secs(15 * 60);

/// Bytes of recent combined output kept in memory per process session.
pub const DEFAULT_RING_BYTES: usize = 1024 * 1024;

/// Concurrent request workers.
pub const DEFAULT_MAX_CONCURRENT: usize = 64;

/// Transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    #[default]
    Stdio,
    Sse,
}

/// Server configuration, assembled by the CLI and immutable afterwards.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server name (reported in initialize)
    pub server_name: String,

    /// Server version (reported in initialize)
    pub server_version: String,

    /// Transport mode
    pub transport: TransportKind,

    /// SSE bind host
    pub host: String,

    /// SSE bind port
    pub port: u16,

    /// State root (session logs, process spill files, config)
    pub state_root: PathBuf,

    /// Ordered permission rules (file rules first, then CLI rules)
    pub path_rules: Vec<PathRule>,

    /// Skip the binary-directory check on exec
    pub trusted_exec: bool,

    /// Drop write-class tools from the registry
    pub disable_write_tools: bool,

    /// Drop search-class tools from the registry
    pub disable_search_tools: bool,

    /// Foreground deadline default; zero disables auto-background
    pub auto_background: Duration,

    /// Per-response token cap
    pub response_token_cap: usize,

    /// Concurrent request workers
    pub max_concurrent: usize,

    /// Ring buffer capacity per process session
    pub ring_bytes: usize,

    /// Cursor idle expiry
    pub cursor_idle: Duration,

    /// terminate → kill escalation window
    pub kill_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: "hanzo-mcp".to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            transport: TransportKind::Stdio,
            host: "127.0.0.1".to_string(),
            port: 8337,
            state_root: hanzo_logging::hanzo_home(),
            path_rules: Vec::new(),
            trusted_exec: false,
            disable_write_tools: false,
            disable_search_tools: false,
            auto_background: DEFAULT_AUTO_BACKGROUND,
            response_token_cap: DEFAULT_TOKEN_CAP,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            ring_bytes: DEFAULT_RING_BYTES,
            cursor_idle: DEFAULT_CURSOR_IDLE,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }
}

impl ServerConfig {
    /// `<root>/sessions` — per-process session logs.
    pub fn sessions_dir(&self) -> PathBuf {
        self.state_root.join("sessions")
    }

    /// `<root>/processes` — spill files for process sessions.
    pub fn processes_dir(&self) -> PathBuf {
        self.state_root.join("processes")
    }

    /// `<root>/config` — optional on-disk configuration.
    pub fn config_dir(&self) -> PathBuf {
        self.state_root.join("config")
    }

    /// Load `config/permissions.json` if present and prepend its rules to
    /// the CLI-supplied ones, preserving file order.
    pub fn load_permission_file(&mut self) {
        let path = self.config_dir().join("permissions.json");
        match read_permission_file(&path) {
            Ok(Some(mut rules)) => {
                rules.append(&mut self.path_rules);
                self.path_rules = rules;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(path = %path.display(), %err, "ignoring unreadable permissions file");
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct PermissionFile {
    #[serde(default)]
    rules: Vec<PermissionFileRule>,
}

#[derive(Debug, Deserialize)]
struct PermissionFileRule {
    path: PathBuf,
    action: String,
}

fn read_permission_file(path: &Path) -> anyhow::Result<Option<Vec<PathRule>>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    let file: PermissionFile = serde_json::from_str(&raw)?;

    let mut rules = Vec::with_capacity(file.rules.len());
    for rule in file.rules {
        let action = match rule.action.as_str() {
            "allow" => RuleAction::Allow,
            "deny" => RuleAction::Deny,
            other => anyhow::bail!("unknown action `{}` in {}", other, path.display()),
        };
        rules.push(PathRule {
            prefix: rule.path,
            action,
        });
    }
    Ok(Some(rules))
}
