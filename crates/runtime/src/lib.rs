//! Keel runtime: the agent core.
//!
//! This crate drives conversations between a language model and a set of
//! external tool providers, and serializes all of that onto one worker.
//!
//! # Overview
//!
//! The runtime is organized around these concepts:
//!
//! - **ProviderConnection**: one MCP tool provider, with its state machine,
//!   cached catalog, and single-in-flight call gate.
//! - **ProviderRegistry**: every provider in configuration order; resolves a
//!   tool name to the first provider that lists it.
//! - **Agent**: the loop. Retrieve context, ask the model, dispatch tool
//!   calls, repeat until the model answers or the round limit is hit.
//! - **ExecutionHost**: a dedicated worker thread that owns the agent and
//!   runs submitted operations one at a time, in order.
//! - **AgentHandle**: the shareable front door that submits to the host and
//!   turns outcomes into [`Reply`] values.
//!
//! # Example
//!
//! ```no_run
//! use runtime::{Agent, AgentHandle, OpenAiBackend, ProviderRegistry, ProviderTimeouts};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), runtime::HostError> {
//! let model = OpenAiBackend::builder("qwen-plus")
//!     .base_url("https://dashscope.aliyuncs.com/compatible-mode/v1")
//!     .api_key("sk-...")
//!     .build();
//! let providers = ProviderRegistry::from_configs(Vec::new(), ProviderTimeouts::default());
//!
//! let handle = AgentHandle::start(Agent::new(model, providers))?;
//! handle.wait_ready(Duration::from_secs(30)).await;
//!
//! let reply = handle.chat("What's the weather in Paris?").await;
//! println!("{}: {}", if reply.is_success() { "ok" } else { "error" }, reply.message);
//!
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod agent;
mod backend;
mod error;
mod handle;
mod host;
mod model;
mod provider;
mod registry;
mod retrieval;
mod transcript;

#[cfg(test)]
mod testing;

// Agent loop
pub use agent::{Agent, DEFAULT_MAX_ROUNDS, DEFAULT_SYSTEM_PROMPT, Phase};

// Model backends
pub use backend::{OpenAiBackend, OpenAiBackendBuilder};
pub use model::{Model, ModelError};

// Error types
pub use error::{Error, Result};

// Worker host and its front door
pub use handle::{AgentHandle, OperationTimeouts, Reply, Status};
pub use host::{ExecutionHost, HostError, Hosted};

// Tool providers
pub use provider::{
    Connector, DEFAULT_CALL_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT, ProviderConnection,
    ProviderState, ProviderTimeouts, ToolDescriptor, ToolOutput,
};
pub use registry::ProviderRegistry;

// Retrieval
pub use retrieval::{
    DEFAULT_SIMILARITY_THRESHOLD, DEFAULT_TOP_K, IndexSummary, KeywordRetriever, MAX_CHUNK_CHARS,
    NoRetrieval, RetrievalError, Retriever,
};

// Transcript
pub use storage::Role;
pub use transcript::{ToolCallRequest, Transcript, Turn};
