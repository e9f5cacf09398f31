//! SSE/HTTP transport.
//!
//! `POST /rpc` carries one JSON-RPC request; the reply streams back as
//! `event: message` frames over a held-open response body. `GET /events`
//! opens a long-lived stream whose first event is a handshake advertising
//! server metadata.

use crate::dispatch::Dispatcher;
use crate::protocol::JsonRpcRequest;
use anyhow::{Context, Result};
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, Stream};
use std::convert::Infallible;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Serve until shutdown triggers.
pub async fn run(
    dispatcher: Dispatcher,
    host: &str,
    port: u16,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = Router::new()
        .route("/rpc", post(rpc))
        .route("/events", get(events))
        .with_state(dispatcher);

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(%addr, "sse transport ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("sse server failed")?;
    Ok(())
}

/// One request in, its terminal response out as a single SSE frame.
/// Notifications produce an empty stream.
async fn rpc(
    State(dispatcher): State<Dispatcher>,
    Json(request): Json<JsonRpcRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let response = dispatcher.dispatch(request).await;

    let frames = response.into_iter().filter_map(|response| {
        match Event::default().event("message").json_data(&response) {
            Ok(event) => Some(Ok(event)),
            Err(err) => {
                warn!(%err, "unserializable response dropped");
                None
            }
        }
    });

    Sse::new(stream::iter(frames))
}

/// Long-lived notification stream; leads with the handshake event.
async fn events(
    State(dispatcher): State<Dispatcher>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let handshake = Event::default()
        .event("handshake")
        .json_data(dispatcher.server_metadata())
        .unwrap_or_else(|_| Event::default().event("handshake"));

    Sse::new(stream::once(async move { Ok(handshake) }))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
