//! Ordered collection of provider connections.

use futures::future::join_all;
use tracing::{info, warn};

use crate::provider::{Connector, ProviderConnection, ProviderTimeouts, ToolDescriptor};

/// Every configured tool provider, in configuration order.
///
/// Tool names resolve to the first provider (in this order) whose catalog
/// lists them; later providers with the same tool name are shadowed.
pub struct ProviderRegistry<C = mcp::ServerConfig> {
    connections: Vec<ProviderConnection<C>>,
}

impl ProviderRegistry<mcp::ServerConfig> {
    pub fn from_configs(
        configs: impl IntoIterator<Item = mcp::ServerConfig>,
        timeouts: ProviderTimeouts,
    ) -> Self {
        Self::new(
            configs
                .into_iter()
                .map(|config| ProviderConnection::from_config(config, timeouts))
                .collect(),
        )
    }
}

impl<C> Default for ProviderRegistry<C> {
    fn default() -> Self {
        Self {
            connections: Vec::new(),
        }
    }
}

impl<C: Connector> ProviderRegistry<C> {
    pub fn new(connections: Vec<ProviderConnection<C>>) -> Self {
        Self { connections }
    }

    pub fn connections(&self) -> &[ProviderConnection<C>] {
        &self.connections
    }

    pub fn get(&self, provider: &str) -> Option<&ProviderConnection<C>> {
        self.connections.iter().find(|c| c.name() == provider)
    }

    /// Connect every provider. Failures are logged and skipped; returns how
    /// many providers ended up ready.
    pub async fn connect_all(&self) -> usize {
        let outcomes = join_all(self.connections.iter().map(|c| c.connect())).await;
        let mut ready = 0;
        for (connection, outcome) in self.connections.iter().zip(outcomes) {
            match outcome {
                Ok(()) => ready += 1,
                Err(e) => warn!(provider = connection.name(), error = %e, "skipping provider"),
            }
        }
        info!(ready, total = self.connections.len(), "providers connected");
        ready
    }

    /// Reconnect every provider that is not currently ready.
    pub async fn reconnect_all(&self) {
        let stale = self.connections.iter().filter(|c| !c.is_ready());
        let outcomes = join_all(stale.map(|c| async move { (c.name(), c.connect().await) })).await;
        for (provider, outcome) in outcomes {
            if let Err(e) = outcome {
                warn!(provider, error = %e, "reconnect failed");
            }
        }
    }

    /// First provider whose catalog lists `tool`.
    pub fn resolve(&self, tool: &str) -> Option<&ProviderConnection<C>> {
        self.connections.iter().find(|c| c.has_tool(tool))
    }

    /// Concatenation of every connection's catalog, in registration order.
    pub fn catalog(&self) -> Vec<ToolDescriptor> {
        self.connections.iter().flat_map(|c| c.catalog()).collect()
    }

    /// Release every provider session.
    pub async fn cleanup(&self) {
        join_all(self.connections.iter().map(|c| c.cleanup())).await;
    }
}
