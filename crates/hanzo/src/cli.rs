//! Command-line surface of the MCP server.
//!
//! Every flag has an environment counterpart (`HANZO_MCP_*`); the flag
//! wins on conflict, which clap's `env` support gives us for free.
//!
//! Example Claude Desktop wiring:
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "hanzo": {
//!       "command": "hanzo-mcp",
//!       "args": ["--allow-path", "/home/me/project"]
//!     }
//!   }
//! }
//! ```

use clap::{Parser, ValueEnum};
use hanzo_mcp::{PathRule, ServerConfig, TransportKind};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportArg {
    Stdio,
    Sse,
}

/// MCP tool server: filesystem, search, shell, and process tools over
/// JSON-RPC 2.0.
#[derive(Debug, Parser)]
#[command(name = "hanzo-mcp", version, about)]
pub struct Args {
    /// Transport mode
    #[arg(long, value_enum, default_value = "stdio", env = "HANZO_MCP_TRANSPORT")]
    pub transport: TransportArg,

    /// Bind host for the SSE transport
    #[arg(long, default_value = "127.0.0.1", env = "HANZO_MCP_HOST")]
    pub host: String,

    /// Bind port for the SSE transport
    #[arg(long, default_value = "8337", env = "HANZO_MCP_PORT")]
    pub port: u16,

    /// Allowed path prefix (repeatable; ordered with --deny-path)
    #[arg(long = "allow-path", short = 'p', env = "HANZO_MCP_ALLOW_PATH")]
    pub allow_paths: Vec<PathBuf>,

    /// Denied path prefix (repeatable; longest prefix wins, deny wins ties)
    #[arg(long = "deny-path", env = "HANZO_MCP_DENY_PATH")]
    pub deny_paths: Vec<PathBuf>,

    /// Skip the binary-directory allowlist check on exec
    #[arg(long, env = "HANZO_MCP_TRUSTED_EXEC")]
    pub trusted_exec: bool,

    /// Drop write-class tools (write_file, edit_file) from the registry
    #[arg(long, env = "HANZO_MCP_DISABLE_WRITE_TOOLS")]
    pub disable_write_tools: bool,

    /// Drop search-class tools (search, tree) from the registry
    #[arg(long, env = "HANZO_MCP_DISABLE_SEARCH_TOOLS")]
    pub disable_search_tools: bool,

    /// Foreground seconds before a live child is backgrounded (0 disables)
    #[arg(
        long,
        default_value = "45",
        env = "HANZO_MCP_AUTO_BACKGROUND_SECONDS"
    )]
    pub auto_background_seconds: u64,

    /// Per-response token cap
    #[arg(long, default_value = "25000", env = "HANZO_MCP_RESPONSE_TOKEN_CAP")]
    pub response_token_cap: usize,

    /// Concurrent request workers
    #[arg(long, default_value = "64", env = "HANZO_MCP_MAX_CONCURRENT")]
    pub max_concurrent: usize,

    /// State root (session logs, process spill files, config)
    #[arg(long, env = "HANZO_MCP_STATE_ROOT")]
    pub state_root: Option<PathBuf>,

    /// Verbose console logging
    #[arg(long, short = 'v', env = "HANZO_MCP_VERBOSE")]
    pub verbose: bool,
}

impl Args {
    /// Fold the CLI into a server configuration.
    pub fn into_config(self) -> ServerConfig {
        let mut rules: Vec<PathRule> = Vec::new();
        // denies first so an equal-length allow never shadows them
        for path in self.deny_paths {
            rules.push(PathRule::deny(path));
        }
        for path in self.allow_paths {
            rules.push(PathRule::allow(path));
        }

        ServerConfig {
            transport: match self.transport {
                TransportArg::Stdio => TransportKind::Stdio,
                TransportArg::Sse => TransportKind::Sse,
            },
            host: self.host,
            port: self.port,
            state_root: self.state_root.unwrap_or_else(hanzo_logging::hanzo_home),
            path_rules: rules,
            trusted_exec: self.trusted_exec,
            disable_write_tools: self.disable_write_tools,
            disable_search_tools: self.disable_search_tools,
            auto_background: Duration::from_secs(self.auto_background_seconds),
            response_token_cap: self.response_token_cap,
            max_concurrent: self.max_concurrent,
            ..Default::default()
        }
    }
}
