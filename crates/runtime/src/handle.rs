//! Thread-safe front door to an agent running on an [`ExecutionHost`].

use std::path::PathBuf;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::agent::Agent;
use crate::host::{ExecutionHost, HostError};
use crate::model::Model;
use crate::provider::{Connector, ToolDescriptor};
use crate::retrieval::{NoRetrieval, Retriever};
use crate::transcript::Turn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// Outcome of a handle operation, ready to hand to a UI or an HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub status: Status,
    pub message: String,
}

impl Reply {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: Status::Success,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

/// How long callers wait for each kind of operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationTimeouts {
    pub chat: Duration,
    pub index: Duration,
    pub admin: Duration,
}

impl Default for OperationTimeouts {
    fn default() -> Self {
        Self {
            chat: Duration::from_secs(300),
            index: Duration::from_secs(120),
            admin: Duration::from_secs(30),
        }
    }
}

type HostedAgent<M, R, C> = ExecutionHost<Agent<M, R, C>>;

/// Runs an [`Agent`] on its own worker and serializes every caller onto it.
pub struct AgentHandle<M, R = NoRetrieval, C = mcp::ServerConfig> {
    host: HostedAgent<M, R, C>,
    timeouts: OperationTimeouts,
}

impl<M, R, C> AgentHandle<M, R, C>
where
    M: Model + 'static,
    R: Retriever + 'static,
    C: Connector + 'static,
{
    /// Start the worker. Provider setup runs in the background; see
    /// [`wait_ready`](Self::wait_ready).
    pub fn start(agent: Agent<M, R, C>) -> Result<Self, HostError> {
        Ok(Self {
            host: ExecutionHost::start(agent)?,
            timeouts: OperationTimeouts::default(),
        })
    }

    pub fn with_timeouts(mut self, timeouts: OperationTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn is_ready(&self) -> bool {
        self.host.is_ready()
    }

    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        self.host.wait_ready(timeout).await
    }

    /// Reconnect providers that are not ready.
    pub async fn setup(&self) -> Reply {
        let outcome = self
            .host
            .submit(self.timeouts.admin, |agent: &mut Agent<M, R, C>| {
                async move { agent.setup().await }.boxed_local()
            })
            .await;
        match outcome {
            Ok(ready) => Reply::success(format!("{ready} provider(s) ready")),
            Err(e) => host_failure("setup", e),
        }
    }

    pub async fn chat(&self, query: impl Into<String>) -> Reply {
        let query = query.into();
        let outcome = self
            .host
            .submit(self.timeouts.chat, move |agent: &mut Agent<M, R, C>| {
                async move { agent.chat(&query).await }.boxed_local()
            })
            .await;
        match outcome {
            Ok(Ok(answer)) => Reply::success(answer),
            Ok(Err(e)) => Reply::error(e.to_string()),
            Err(e) => host_failure("chat", e),
        }
    }

    pub async fn update_label(&self, label: Option<String>) -> Reply {
        let message = match &label {
            Some(label) => format!("knowledge label set to `{label}`"),
            None => "knowledge label cleared".to_string(),
        };
        let outcome = self
            .host
            .submit(self.timeouts.admin, move |agent: &mut Agent<M, R, C>| {
                async move { agent.update_label(label) }.boxed_local()
            })
            .await;
        match outcome {
            Ok(()) => Reply::success(message),
            Err(e) => host_failure("update_label", e),
        }
    }

    pub async fn create_index(&self, dir: impl Into<PathBuf>, label: impl Into<String>) -> Reply {
        let (dir, label) = (dir.into(), label.into());
        let outcome = self
            .host
            .submit(self.timeouts.index, move |agent: &mut Agent<M, R, C>| {
                async move { agent.create_index(&dir, &label).await }.boxed_local()
            })
            .await;
        match outcome {
            Ok(Ok(summary)) => Reply::success(format!(
                "indexed {} file(s) into {} chunk(s) under `{}`",
                summary.files, summary.chunks, summary.label
            )),
            Ok(Err(e)) => Reply::error(e.to_string()),
            Err(e) => host_failure("create_index", e),
        }
    }

    pub async fn delete_index(&self, label: impl Into<String>) -> Reply {
        let label = label.into();
        let outcome = self
            .host
            .submit(self.timeouts.admin, move |agent: &mut Agent<M, R, C>| {
                async move {
                    agent.delete_index(&label).await?;
                    Ok::<_, crate::Error>(label)
                }
                .boxed_local()
            })
            .await;
        match outcome {
            Ok(Ok(label)) => Reply::success(format!("deleted index `{label}`")),
            Ok(Err(e)) => Reply::error(e.to_string()),
            Err(e) => host_failure("delete_index", e),
        }
    }

    /// Release every provider session. The worker keeps running.
    pub async fn cleanup(&self) -> Reply {
        let outcome = self
            .host
            .submit(self.timeouts.admin, |agent: &mut Agent<M, R, C>| {
                async move { agent.cleanup().await }.boxed_local()
            })
            .await;
        match outcome {
            Ok(()) => Reply::success("providers released"),
            Err(e) => host_failure("cleanup", e),
        }
    }

    /// Snapshot of the transcript.
    pub async fn transcript(&self) -> Result<Vec<Turn>, HostError> {
        self.host
            .submit(self.timeouts.admin, |agent: &mut Agent<M, R, C>| {
                async move { agent.transcript().turns().to_vec() }.boxed_local()
            })
            .await
    }

    /// Snapshot of the aggregated tool catalog.
    pub async fn catalog(&self) -> Result<Vec<ToolDescriptor>, HostError> {
        self.host
            .submit(self.timeouts.admin, |agent: &mut Agent<M, R, C>| {
                async move { agent.catalog() }.boxed_local()
            })
            .await
    }

    /// Clean up the agent and stop the worker.
    pub async fn shutdown(&self) {
        self.host.shutdown().await;
    }
}

fn host_failure(operation: &str, error: HostError) -> Reply {
    warn!(operation, error = %error, "operation did not complete");
    Reply::error(error.to_string())
}
