//! Server Root - Construct-Once Wiring
//!
//! Builds every subsystem exactly once from the configuration, hands them
//! to the dispatcher by reference, and runs the selected transport until
//! stdin closes, a `shutdown` request arrives, or a signal lands. There
//! are no module-global singletons; everything hangs off this object.

use crate::budget::TokenBudgeter;
use crate::config::{ServerConfig, TransportKind};
use crate::cursor::CursorStore;
use crate::dispatch::Dispatcher;
use crate::registry::{builtin_manifests, RegistryFilter, ToolRegistry};
use crate::security::PermissionGate;
use crate::session_log::SessionLog;
use crate::supervisor::ProcessSupervisor;
use crate::transport;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Sweep cadence for expired cursors and stashes.
const CURSOR_GC_INTERVAL: Duration = Duration::from_secs(60);

/// The assembled server.
pub struct McpServer {
    config: Arc<ServerConfig>,
    dispatcher: Dispatcher,
    supervisor: Arc<ProcessSupervisor>,
    cursors: Arc<CursorStore>,
    shutdown: CancellationToken,
}

impl McpServer {
    /// Construct every subsystem. Fails (and the process should exit
    /// non-zero) on tool-name collisions or an unloadable vocabulary.
    pub fn new(mut config: ServerConfig) -> Result<Self> {
        config.load_permission_file();

        std::fs::create_dir_all(config.sessions_dir())
            .context("failed to create sessions directory")?;
        std::fs::create_dir_all(config.processes_dir())
            .context("failed to create processes directory")?;

        let config = Arc::new(config);
        let gate = Arc::new(PermissionGate::new(
            config.path_rules.clone(),
            config.trusted_exec,
        ));
        let budget = Arc::new(
            TokenBudgeter::new(config.response_token_cap)
                .context("failed to initialise token budgeter")?,
        );
        let registry = Arc::new(
            ToolRegistry::build(
                builtin_manifests(),
                RegistryFilter {
                    disable_write_tools: config.disable_write_tools,
                    disable_search_tools: config.disable_search_tools,
                },
            )
            .context("failed to build tool registry")?,
        );
        let supervisor = Arc::new(ProcessSupervisor::new(
            config.processes_dir(),
            config.ring_bytes,
            config.kill_grace,
        ));
        let cursors = Arc::new(CursorStore::new(config.cursor_idle));
        let session_log = Arc::new(SessionLog::open(config.sessions_dir()));
        let shutdown = CancellationToken::new();

        let dispatcher = Dispatcher::new(
            Arc::clone(&config),
            Arc::clone(&registry),
            gate,
            Arc::clone(&supervisor),
            Arc::clone(&cursors),
            budget,
            session_log,
            shutdown.clone(),
        );

        info!(
            tools = registry.len(),
            transport = ?config.transport,
            "server assembled"
        );

        Ok(Self {
            config,
            dispatcher,
            supervisor,
            cursors,
            shutdown,
        })
    }

    /// The dispatcher, for in-process clients and tests.
    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    /// Cancelled on `shutdown` requests; cancel it to stop the server.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve the configured transport to completion, then reap children.
    pub async fn run(&self) -> Result<()> {
        let gc_cursors = Arc::clone(&self.cursors);
        let gc_stop = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CURSOR_GC_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => gc_cursors.gc(),
                    _ = gc_stop.cancelled() => break,
                }
            }
        });

        let result = match self.config.transport {
            TransportKind::Stdio => {
                transport::stdio::run(self.dispatcher.clone(), self.shutdown.clone()).await
            }
            TransportKind::Sse => {
                transport::sse::run(
                    self.dispatcher.clone(),
                    &self.config.host,
                    self.config.port,
                    self.shutdown.clone(),
                )
                .await
            }
        };

        info!("transport stopped; reaping children");
        self.supervisor.shutdown().await;
        result
    }
}
