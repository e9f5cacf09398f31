//! Hanzo MCP server launcher.
//!
//! Exit codes: 0 on clean shutdown, 1 on fatal startup or transport
//! failure, 2 on configuration errors (clap's default), 130 when
//! interrupted.

mod cli;

use clap::Parser;
use cli::{Args, TransportArg};
use hanzo_logging::LogConfig;
use hanzo_mcp::McpServer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

const EXIT_INTERRUPTED: i32 = 130;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // stdout carries the protocol in stdio mode; keep the console quiet
    let quiet_console = matches!(args.transport, TransportArg::Stdio) && !args.verbose;
    if let Err(err) = hanzo_logging::init_logging(LogConfig {
        app_name: "hanzo-mcp",
        verbose: args.verbose,
        quiet_console,
    }) {
        eprintln!("failed to initialise logging: {:#}", err);
        std::process::exit(1);
    }

    let server = match McpServer::new(args.into_config()) {
        Ok(server) => server,
        Err(err) => {
            error!("startup failed: {:#}", err);
            std::process::exit(1);
        }
    };

    // the flag is set before the shutdown token fires, so once run()
    // observes the cancellation the interrupt is already recorded
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        let shutdown = server.shutdown_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received; shutting down");
                interrupted.store(true, Ordering::SeqCst);
                shutdown.cancel();
            }
        });
    }

    if let Err(err) = server.run().await {
        error!("server failed: {:#}", err);
        std::process::exit(1);
    }

    if interrupted.load(Ordering::SeqCst) {
        std::process::exit(EXIT_INTERRUPTED);
    }
}
