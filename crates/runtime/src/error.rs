use thiserror::Error;

use crate::model::ModelError;
use crate::retrieval::RetrievalError;

/// Errors raised inside the agent core.
///
/// Tool-level variants (`ToolNotAvailable`, `ProviderUnavailable`,
/// `ProviderCommunication`, `ToolFailed`) are normally turned into tool turns
/// by the agent loop. The rest abort the current chat.
#[derive(Debug, Error)]
pub enum Error {
    #[error("provider `{provider}` unavailable: {source}")]
    ProviderUnavailable {
        provider: String,
        #[source]
        source: mcp::Error,
    },

    #[error("tool `{0}` is not available")]
    ToolNotAvailable(String),

    #[error("lost connection to provider `{provider}`: {source}")]
    ProviderCommunication {
        provider: String,
        #[source]
        source: mcp::Error,
    },

    #[error("tool `{tool}` failed: {message}")]
    ToolFailed { tool: String, message: String },

    #[error("model call failed: {0}")]
    ModelCall(#[from] ModelError),

    #[error("gave up after {rounds} tool rounds without a final answer")]
    LoopBoundExceeded { rounds: usize },

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error(transparent)]
    Storage(#[from] storage::Error),
}

impl Error {
    /// Whether the failure came from a broken provider channel, which is the
    /// only kind the agent loop answers with a reconnect and retry.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::ProviderCommunication { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
