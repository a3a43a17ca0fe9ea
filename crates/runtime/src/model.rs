//! Model completion contract.

use std::future::Future;

use thiserror::Error;

use crate::provider::ToolDescriptor;
use crate::transcript::Turn;

/// Errors from model completion calls.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ModelError {
    /// A network error occurred during the API call.
    #[error("network: {0}")]
    Network(String),

    /// The provider returned an error response.
    #[error("provider api: {0}")]
    Api(String),

    /// The response could not be understood.
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

/// A language model that continues a transcript.
///
/// Implementations must return a complete assistant turn or an error, never
/// a partial turn.
pub trait Model: Send + Sync {
    fn complete(
        &self,
        transcript: &[Turn],
        tools: &[ToolDescriptor],
    ) -> impl Future<Output = Result<Turn, ModelError>> + Send;
}

impl<M: Model> Model for std::sync::Arc<M> {
    fn complete(
        &self,
        transcript: &[Turn],
        tools: &[ToolDescriptor],
    ) -> impl Future<Output = Result<Turn, ModelError>> + Send {
        (**self).complete(transcript, tools)
    }
}
