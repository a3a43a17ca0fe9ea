//! A single tool provider connection.
//!
//! A [`ProviderConnection`] owns at most one live MCP client. Every exchange
//! with the provider (handshake or tool call) happens while holding the
//! connection's gate, so a provider never sees two requests in flight and a
//! tool call never races a reconnect.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{Error, Result};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// What a provider answered for a tool call.
pub type ToolOutput = mcp::CallToolResult;

/// Lifecycle of a provider connection.
///
/// ```text
/// Disconnected -> Connecting -> Ready
///                    |           |
///                    v           v
///               (Disconnected) Degraded -> Connecting -> ...
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderState {
    Disconnected,
    Connecting,
    Ready,
    Degraded,
}

impl std::fmt::Display for ProviderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProviderState::Disconnected => "disconnected",
            ProviderState::Connecting => "connecting",
            ProviderState::Ready => "ready",
            ProviderState::Degraded => "degraded",
        };
        f.write_str(name)
    }
}

/// A tool as advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl From<mcp::Tool> for ToolDescriptor {
    fn from(tool: mcp::Tool) -> Self {
        Self {
            name: tool.name,
            description: tool.description.unwrap_or_default(),
            input_schema: tool.input_schema,
        }
    }
}

/// Produces fresh MCP clients for a provider.
pub trait Connector: Send + Sync {
    fn connect(&self) -> impl Future<Output = mcp::Result<mcp::Client>> + Send;
}

impl Connector for mcp::ServerConfig {
    async fn connect(&self) -> mcp::Result<mcp::Client> {
        mcp::Client::spawn(self)
    }
}

/// Time limits applied to provider exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderTimeouts {
    /// Upper bound for a single request/response exchange.
    pub call: Duration,
    /// Upper bound for spawn + initialize + tool listing.
    pub handshake: Duration,
}

impl Default for ProviderTimeouts {
    fn default() -> Self {
        Self {
            call: DEFAULT_CALL_TIMEOUT,
            handshake: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

struct Status {
    state: ProviderState,
    catalog: Vec<ToolDescriptor>,
}

/// A logical link to one tool provider.
pub struct ProviderConnection<C = mcp::ServerConfig> {
    name: String,
    connector: C,
    timeouts: ProviderTimeouts,
    gate: tokio::sync::Mutex<Option<mcp::Client>>,
    status: Mutex<Status>,
}

impl ProviderConnection<mcp::ServerConfig> {
    /// A connection that spawns the configured child process.
    pub fn from_config(config: mcp::ServerConfig, timeouts: ProviderTimeouts) -> Self {
        Self::new(config.name.clone(), config, timeouts)
    }
}

impl<C: Connector> ProviderConnection<C> {
    pub fn new(name: impl Into<String>, connector: C, timeouts: ProviderTimeouts) -> Self {
        Self {
            name: name.into(),
            connector,
            timeouts,
            gate: tokio::sync::Mutex::new(None),
            status: Mutex::new(Status {
                state: ProviderState::Disconnected,
                catalog: Vec::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ProviderState {
        self.status().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ProviderState::Ready
    }

    /// Tools from the last successful handshake. Kept across failures so
    /// calls can still be routed here and trigger a reconnect.
    pub fn catalog(&self) -> Vec<ToolDescriptor> {
        self.status().catalog.clone()
    }

    pub fn has_tool(&self, tool: &str) -> bool {
        self.status().catalog.iter().any(|t| t.name == tool)
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ProviderState) -> ProviderState {
        std::mem::replace(&mut self.status().state, state)
    }

    /// Establish a session and refresh the catalog.
    ///
    /// A no-op when already ready. Concurrent callers serialize on the gate,
    /// so only one handshake runs and the rest observe its outcome.
    pub async fn connect(&self) -> Result<()> {
        let mut channel = self.gate.lock().await;
        if self.is_ready() {
            return Ok(());
        }

        let previous = self.set_state(ProviderState::Connecting);
        if let Some(stale) = channel.take() {
            debug!(provider = %self.name, "discarding stale session");
            stale.shutdown().await;
        }

        let outcome = match tokio::time::timeout(self.timeouts.handshake, self.handshake()).await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(mcp::Error::Timeout(self.timeouts.handshake)),
        };

        match outcome {
            Ok((client, catalog)) => {
                info!(provider = %self.name, tools = catalog.len(), "provider ready");
                *channel = Some(client);
                let mut status = self.status();
                status.state = ProviderState::Ready;
                status.catalog = catalog;
                Ok(())
            }
            Err(source) => {
                let fallback = match previous {
                    ProviderState::Disconnected => ProviderState::Disconnected,
                    _ => ProviderState::Degraded,
                };
                self.set_state(fallback);
                warn!(provider = %self.name, error = %source, "provider handshake failed");
                Err(Error::ProviderUnavailable {
                    provider: self.name.clone(),
                    source,
                })
            }
        }
    }

    async fn handshake(&self) -> mcp::Result<(mcp::Client, Vec<ToolDescriptor>)> {
        let client = self
            .connector
            .connect()
            .await?
            .with_timeout(self.timeouts.call);
        let init = client.initialize().await?;
        debug!(
            provider = %self.name,
            server = %init.server_info.name,
            protocol = %init.protocol_version,
            "initialized"
        );

        // A provider without the tools capability is valid; it just offers none.
        let catalog = if init.capabilities.tools.is_some() {
            client
                .list_tools()
                .await?
                .into_iter()
                .map(ToolDescriptor::from)
                .collect()
        } else {
            Vec::new()
        };
        Ok((client, catalog))
    }

    /// Invoke one tool. At most one call is in flight per connection.
    ///
    /// A broken channel marks the connection degraded and surfaces as
    /// [`Error::ProviderCommunication`]. An error answer from a healthy
    /// provider is [`Error::ToolFailed`] and leaves the connection ready.
    pub async fn call_tool(&self, tool: &str, arguments: Value) -> Result<ToolOutput> {
        let channel = self.gate.lock().await;
        let client = match channel.as_ref() {
            Some(client) if self.is_ready() && self.has_tool(tool) => client,
            _ => return Err(Error::ToolNotAvailable(tool.to_string())),
        };

        let arguments = match arguments {
            Value::Null => None,
            other => Some(other),
        };
        debug!(provider = %self.name, tool, "calling tool");

        let outcome = if client.is_running().await {
            client.call_tool(tool, arguments).await
        } else {
            Err(mcp::Error::ServerExited)
        };

        match outcome {
            Ok(output) => Ok(output),
            Err(source) if source.is_transport() => {
                self.set_state(ProviderState::Degraded);
                warn!(provider = %self.name, tool, error = %source, "provider channel failed");
                Err(Error::ProviderCommunication {
                    provider: self.name.clone(),
                    source,
                })
            }
            Err(mcp::Error::ToolCallFailed(message)) => Err(Error::ToolFailed {
                tool: tool.to_string(),
                message,
            }),
            Err(source) => Err(Error::ToolFailed {
                tool: tool.to_string(),
                message: source.to_string(),
            }),
        }
    }

    /// Release the session and any child process. Safe to call repeatedly
    /// or before the first connect.
    pub async fn cleanup(&self) {
        let mut channel = self.gate.lock().await;
        if let Some(client) = channel.take() {
            client.shutdown().await;
            debug!(provider = %self.name, "session closed");
        }
        let mut status = self.status();
        status.state = ProviderState::Disconnected;
        status.catalog.clear();
    }
}
