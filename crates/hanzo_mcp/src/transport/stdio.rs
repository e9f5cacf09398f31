//! Stdio transport: newline-delimited JSON-RPC over stdin/stdout.
//!
//! The reader task decodes frames and fans `tools/call` requests out to
//! per-request workers; everything else (initialize, list, ping, cancel,
//! shutdown) is cheap and handled inline so it stays responsive while
//! workers queue. The writer task owns stdout and drains the serialized
//! queue, so concurrent workers never interleave frames. Malformed lines
//! answer with a protocol error when an id is recoverable and are logged
//! and dropped otherwise.

use super::OutboundSender;
use crate::dispatch::Dispatcher;
use crate::protocol::{methods, JsonRpcRequest};
use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Serve until stdin closes or shutdown triggers.
pub async fn run(dispatcher: Dispatcher, shutdown: CancellationToken) -> Result<()> {
    let (out, mut out_rx) = OutboundSender::channel();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(response) = out_rx.recv().await {
            let frame = match serde_json::to_string(&response) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(%err, "unserializable response dropped");
                    continue;
                }
            };
            debug!(bytes = frame.len(), "writing frame");
            if stdout.write_all(frame.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                warn!("stdout closed; writer stopping");
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    info!("stdio transport ready");

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read from stdin")?,
            _ = shutdown.cancelled() => {
                info!("shutdown during read; stopping transport");
                break;
            }
        };
        let Some(line) = line else {
            info!("stdin closed; stopping transport");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<JsonRpcRequest>(&line) {
            Ok(request) if request.method == methods::TOOLS_CALL => {
                // tool calls get their own worker; the semaphore inside the
                // dispatcher bounds how many actually run
                let dispatcher = dispatcher.clone();
                let out = out.clone();
                tokio::spawn(async move {
                    if let Some(response) = dispatcher.dispatch(request).await {
                        out.send(response).await;
                    }
                });
            }
            Ok(request) => {
                if let Some(response) = dispatcher.dispatch(request).await {
                    if !out.send(response).await {
                        break;
                    }
                }
            }
            Err(_) => {
                // let the dispatcher decide between error reply and drop
                if let Some(response) = dispatcher.handle_raw(&line).await {
                    if !out.send(response).await {
                        break;
                    }
                }
            }
        }
    }

    drop(out);
    let _ = writer.await;
    Ok(())
}
