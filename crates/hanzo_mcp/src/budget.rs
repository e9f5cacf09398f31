//! Token Budgeter - Response Size Discipline
//!
//! Counts tokens in candidate payloads with a deterministic byte-pair
//! encoding and decides, per result, whether to emit as-is, keep a list
//! prefix, truncate a blob at a token boundary, or refuse with
//! `OutputTooLarge`. The vocabulary is fixed per build; cursor checksums
//! embed its tag so a vocabulary change invalidates outstanding cursors
//! instead of silently shifting offsets.

use anyhow::Context;
use serde_json::Value;
use std::sync::Arc;
use tiktoken_rs::CoreBPE;

/// Default per-response token cap, aligned with the common MCP client limit.
pub const DEFAULT_TOKEN_CAP: usize = 25_000;

/// Tokens held back from the cap for JSON-RPC framing around the content.
pub const FRAME_RESERVE_TOKENS: usize = 500;

/// Tag of the bundled vocabulary; part of every cursor checksum.
pub const VOCABULARY: &str = "o200k_base";

/// Outcome of fitting a single large blob under a token budget.
#[derive(Debug)]
pub enum BlobFit {
    /// The whole text fits.
    Fits,
    /// Only a prefix fits; `kept_bytes` is its length in bytes.
    Truncated { kept: String, kept_bytes: u64 },
}

/// Deterministic token counting and fitting.
#[derive(Clone)]
pub struct TokenBudgeter {
    bpe: Arc<CoreBPE>,
    cap: usize,
}

impl std::fmt::Debug for TokenBudgeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBudgeter")
            .field("cap", &self.cap)
            .field("vocabulary", &VOCABULARY)
            .finish()
    }
}

impl TokenBudgeter {
    /// Load the bundled vocabulary. Done once at server construction.
    pub fn new(cap: usize) -> anyhow::Result<Self> {
        let bpe = tiktoken_rs::o200k_base().context("Failed to load tokenizer vocabulary")?;
        Ok(Self {
            bpe: Arc::new(bpe),
            cap,
        })
    }

    /// The hard per-response cap.
    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Tokens available for content once framing is reserved.
    pub fn usable(&self) -> usize {
        self.cap.saturating_sub(FRAME_RESERVE_TOKENS)
    }

    /// Count tokens in a text payload.
    pub fn count(&self, text: &str) -> usize {
        self.bpe.encode_ordinary(text).len()
    }

    /// Count tokens in the serialised form of a JSON value.
    pub fn count_value(&self, value: &Value) -> usize {
        match serde_json::to_string(value) {
            Ok(json) => self.count(&json),
            Err(_) => usize::MAX,
        }
    }

    /// Fit `text` under `budget` tokens, truncating at a token boundary.
    ///
    /// Truncation backs off token by token until the kept prefix decodes to
    /// valid UTF-8, so the marker appended by the caller never lands inside
    /// a split character.
    pub fn fit_blob(&self, text: &str, budget: usize) -> BlobFit {
        let tokens = self.bpe.encode_ordinary(text);
        if tokens.len() <= budget {
            return BlobFit::Fits;
        }

        let mut keep = budget;
        while keep > 0 {
            let prefix: Vec<_> = tokens[..keep].to_vec();
            if let Ok(kept) = self.bpe.decode(prefix) {
                let kept_bytes = kept.len() as u64;
                return BlobFit::Truncated { kept, kept_bytes };
            }
            keep -= 1;
        }

        BlobFit::Truncated {
            kept: String::new(),
            kept_bytes: 0,
        }
    }

    /// Largest prefix of `items` whose serialisations fit under `budget`
    /// tokens. Each item pays a small separator overhead on top of its own
    /// serialised form.
    pub fn fit_list(&self, items: &[Value], budget: usize) -> usize {
        let mut used = 0usize;
        for (index, item) in items.iter().enumerate() {
            let cost = self.count_value(item).saturating_add(2);
            if used + cost > budget {
                return index;
            }
            used += cost;
        }
        items.len()
    }
}

/// Marker appended to truncated blobs; names the payload's full byte size.
pub fn truncation_marker(total_bytes: u64, kept_bytes: u64) -> String {
    format!(
        "\n[output truncated: {} of {} bytes shown]",
        kept_bytes, total_bytes
    )
}
