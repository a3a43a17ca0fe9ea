//! MCP error types.

use crate::protocol::JsonRpcError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to spawn server: {0}")]
    Spawn(std::io::Error),

    #[error("i/o error on server channel: {0}")]
    Io(#[from] std::io::Error),

    #[error("server exited unexpectedly")]
    ServerExited,

    #[error("timeout after {0:?} waiting for response")]
    Timeout(std::time::Duration),

    #[error("failed to encode or decode message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON-RPC error: {0}")]
    JsonRpc(#[from] JsonRpcError),

    #[error("tool call failed: {0}")]
    ToolCallFailed(String),

    #[error("output too large: {size} bytes (max {max})")]
    OutputTooLarge { size: usize, max: usize },
}

impl Error {
    /// Whether the channel to the server is no longer trustworthy.
    ///
    /// Transport errors leave the byte stream in an unknown state (a half-read
    /// response, a dead process). Errors the server reported itself do not.
    pub fn is_transport(&self) -> bool {
        match self {
            Error::Spawn(_)
            | Error::Io(_)
            | Error::ServerExited
            | Error::Timeout(_)
            | Error::Serialize(_)
            | Error::InvalidResponse(_)
            | Error::OutputTooLarge { .. } => true,
            Error::JsonRpc(_) | Error::ToolCallFailed(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_reported_errors_are_not_transport() {
        let rpc = JsonRpcError {
            code: -32602,
            message: "bad params".into(),
            data: None,
        };
        assert!(!Error::JsonRpc(rpc).is_transport());
        assert!(!Error::ToolCallFailed("nope".into()).is_transport());
    }

    #[test]
    fn channel_errors_are_transport() {
        assert!(Error::ServerExited.is_transport());
        assert!(Error::Timeout(std::time::Duration::from_secs(1)).is_transport());
        assert!(Error::Io(std::io::Error::other("broken pipe")).is_transport());
    }
}
