//! Transport Adapters - Framing Only
//!
//! Two interchangeable modes carry JSON-RPC frames: newline-delimited JSON
//! over stdio, and SSE over HTTP. Adapters frame, decode, and serialise;
//! they never interpret methods. Writes are funnelled through one bounded
//! queue per connection so a frame is never interleaved with another.

pub mod sse;
pub mod stdio;

use crate::protocol::JsonRpcResponse;
use tokio::sync::mpsc;

/// Depth of the serialized write queue. Senders await when it fills, which
/// is the back-pressure signal that pauses new work admission.
pub const WRITE_QUEUE_DEPTH: usize = 256;

/// Producer half of the serialized write queue.
#[derive(Clone)]
pub struct OutboundSender {
    tx: mpsc::Sender<JsonRpcResponse>,
}

impl OutboundSender {
    pub fn channel() -> (Self, mpsc::Receiver<JsonRpcResponse>) {
        let (tx, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        (Self { tx }, rx)
    }

    /// Queue a frame for the writer task. Awaits under back-pressure; only
    /// fails when the writer is gone (connection closed).
    pub async fn send(&self, response: JsonRpcResponse) -> bool {
        self.tx.send(response).await.is_ok()
    }
}
