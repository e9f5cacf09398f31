//! Error taxonomy surfaced to MCP clients.
//!
//! Every failure a tool or subsystem can produce collapses into one of these
//! kinds; each maps to a JSON-RPC error code in the application range.
//! Handlers return these directly — nothing unclassified crosses the
//! dispatcher boundary (unknowns become `Internal` with a logged
//! correlation id).

use crate::protocol::{ErrorCode, JsonRpcError};

/// A categorised tool failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    /// Schema violation or semantically impossible parameters.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// Unknown tool name, session id, or expired/absent cursor.
    #[error("not found: {0}")]
    NotFound(String),

    /// Permission gate rejected a path or exec.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Spawn failure or I/O error while executing a tool.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// Client cancel or deadline expiry.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Payload cannot be truncated or paginated safely.
    #[error("output too large: {0}")]
    OutputTooLarge(String),

    /// Cursor redeemed against different arguments than it was minted for.
    #[error("cursor mismatch: {0}")]
    CursorMismatch(String),

    /// Referenced resource existed but was reaped or evicted.
    #[error("gone: {0}")]
    Gone(String),

    /// Unclassified defect; always paired with a log entry.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ToolError {
    /// Stable kind tag for session-log entries and tests.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArguments(_) => "invalid_arguments",
            Self::NotFound(_) => "not_found",
            Self::PermissionDenied(_) => "permission_denied",
            Self::ExecutionFailed(_) => "execution_failed",
            Self::Cancelled(_) => "cancelled",
            Self::OutputTooLarge(_) => "output_too_large",
            Self::CursorMismatch(_) => "cursor_mismatch",
            Self::Gone(_) => "gone",
            Self::Internal(_) => "internal",
        }
    }

    /// JSON-RPC error code for this kind.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidArguments(_) => ErrorCode::InvalidParams,
            Self::NotFound(_) => ErrorCode::ServerError(-32001),
            Self::PermissionDenied(_) => ErrorCode::ServerError(-32002),
            Self::ExecutionFailed(_) => ErrorCode::ServerError(-32003),
            Self::Cancelled(_) => ErrorCode::ServerError(-32004),
            Self::OutputTooLarge(_) => ErrorCode::ServerError(-32005),
            Self::CursorMismatch(_) => ErrorCode::ServerError(-32006),
            Self::Gone(_) => ErrorCode::ServerError(-32007),
            Self::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Wire form, with the kind tag attached as error data.
    pub fn to_rpc(&self) -> JsonRpcError {
        JsonRpcError::with_data(
            self.code(),
            self.to_string(),
            serde_json::json!({ "kind": self.kind() }),
        )
    }
}

impl From<std::io::Error> for ToolError {
    fn from(err: std::io::Error) -> Self {
        Self::ExecutionFailed(err.to_string())
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization: {}", err))
    }
}

/// Shorthand used throughout the tool bodies.
pub type ToolResult<T> = Result<T, ToolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_stay_in_application_range() {
        let errs = [
            ToolError::NotFound("x".into()),
            ToolError::PermissionDenied("x".into()),
            ToolError::ExecutionFailed("x".into()),
            ToolError::Cancelled("x".into()),
            ToolError::OutputTooLarge("x".into()),
            ToolError::CursorMismatch("x".into()),
            ToolError::Gone("x".into()),
        ];
        for err in errs {
            let code = err.code().as_i32();
            assert!((-32099..=-32000).contains(&code), "{} out of range", code);
        }
    }

    #[test]
    fn kind_tags_are_distinct() {
        let kinds = [
            ToolError::InvalidArguments("".into()).kind(),
            ToolError::NotFound("".into()).kind(),
            ToolError::PermissionDenied("".into()).kind(),
            ToolError::ExecutionFailed("".into()).kind(),
            ToolError::Cancelled("".into()).kind(),
            ToolError::OutputTooLarge("".into()).kind(),
            ToolError::CursorMismatch("".into()).kind(),
            ToolError::Gone("".into()).kind(),
            ToolError::Internal("".into()).kind(),
        ];
        let unique: std::collections::HashSet<_> = kinds.iter().collect();
        assert_eq!(unique.len(), kinds.len());
    }

    #[test]
    fn rpc_form_carries_kind_data() {
        let rpc = ToolError::Gone("session proc_ab12".into()).to_rpc();
        assert_eq!(rpc.code, -32007);
        assert_eq!(rpc.data.unwrap()["kind"], "gone");
    }
}
