//! MCP client: one JSON-RPC channel to one server (spawn, communicate, lifecycle).

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, JsonRpcError,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListToolsResult, RequestId, Tool,
};

/// Default timeout for MCP operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Maximum output size (1MB).
/// Sized for large tool outputs (file reads, search results).
pub const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

const METHOD_NOT_FOUND: i32 = -32601;

/// Configuration for an MCP server process.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

type Reader = Box<dyn AsyncBufRead + Unpin + Send>;
type Writer = Box<dyn AsyncWrite + Unpin + Send>;

/// Both halves of the byte stream, locked together so a request and its
/// response are never interleaved with another exchange.
struct Channel {
    reader: Reader,
    writer: Writer,
}

impl Channel {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Read messages until the response carrying `id` arrives.
    ///
    /// Notifications and responses to abandoned requests are skipped. Requests
    /// initiated by the server are answered inline (`ping`) or rejected.
    async fn read_response(&mut self, id: &RequestId) -> Result<JsonRpcResponse> {
        loop {
            let mut buf = Vec::new();
            let limit = MAX_OUTPUT_SIZE as u64 + 1;
            let bytes_read = (&mut self.reader)
                .take(limit)
                .read_until(b'\n', &mut buf)
                .await?;
            if bytes_read == 0 {
                return Err(Error::ServerExited);
            }

            // The rest of an oversized line is left unread; the channel is
            // unusable afterwards.
            if buf.len() > MAX_OUTPUT_SIZE {
                return Err(Error::OutputTooLarge {
                    size: buf.len(),
                    max: MAX_OUTPUT_SIZE,
                });
            }

            let line = std::str::from_utf8(&buf)
                .map_err(|e| Error::InvalidResponse(format!("response is not UTF-8: {e}")))?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let message: Value = serde_json::from_str(line)?;
            let Some(message_id) = message.get("id").cloned() else {
                debug!(method = ?message.get("method"), "skipping server notification");
                continue;
            };

            if let Some(method) = message.get("method").and_then(Value::as_str) {
                self.answer_server_request(message_id, method).await?;
                continue;
            }

            let response: JsonRpcResponse = serde_json::from_value(message)?;
            if response.id != *id {
                warn!(expected = ?id, got = ?response.id, "discarding stale response");
                continue;
            }
            return Ok(response);
        }
    }

    async fn answer_server_request(&mut self, id: Value, method: &str) -> Result<()> {
        let reply = if method == "ping" {
            serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": {} })
        } else {
            debug!(method, "rejecting unsupported server request");
            let error = JsonRpcError {
                code: METHOD_NOT_FOUND,
                message: format!("method not found: {method}"),
                data: None,
            };
            serde_json::json!({ "jsonrpc": "2.0", "id": id, "error": error })
        };
        self.send_line(&serde_json::to_string(&reply)?).await
    }
}

/// Handle to a connected MCP server.
///
/// Exchanges are strictly sequential: a second caller waits for the first
/// request's response before its own request is written.
pub struct Client {
    name: String,
    channel: Mutex<Channel>,
    process: Option<Mutex<Child>>,
    next_id: AtomicI64,
    timeout: Duration,
}

impl Client {
    /// Wrap an already-established byte stream.
    pub fn new<R, W>(name: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            name: name.into(),
            channel: Mutex::new(Channel {
                reader: Box::new(BufReader::new(reader)),
                writer: Box::new(writer),
            }),
            process: None,
            next_id: AtomicI64::new(1),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Spawn a server process and attach to its stdin/stdout.
    pub fn spawn(config: &ServerConfig) -> Result<Self> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut process = cmd.spawn().map_err(Error::Spawn)?;

        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| Error::Spawn(std::io::Error::other("failed to capture stdin")))?;

        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn(std::io::Error::other("failed to capture stdout")))?;

        let mut client = Self::new(config.name.clone(), stdout, stdin);
        client.process = Some(Mutex::new(process));
        Ok(client)
    }

    /// Set the timeout applied to each request/response exchange.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Get the server name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Perform the capability handshake.
    pub async fn initialize(&self) -> Result<InitializeResult> {
        let result: InitializeResult = self
            .request("initialize", Some(InitializeParams::default()))
            .await?;
        self.notify("notifications/initialized").await?;
        debug!(
            server = %self.name,
            remote = %result.server_info.name,
            protocol = %result.protocol_version,
            "handshake complete"
        );
        Ok(result)
    }

    /// Fetch the server's tool catalog.
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        let result: ListToolsResult = self.request("tools/list", None::<()>).await?;
        Ok(result.tools)
    }

    /// Call a tool by name.
    pub async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<CallToolResult> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };

        let result: CallToolResult = self.request("tools/call", Some(params)).await?;

        if result.is_error {
            return Err(Error::ToolCallFailed(result.text()));
        }

        Ok(result)
    }

    /// Check if the server process is still running.
    ///
    /// Clients built over a plain stream report `true`.
    pub async fn is_running(&self) -> bool {
        let Some(process) = &self.process else {
            return true;
        };
        let mut process = process.lock().await;
        matches!(process.try_wait(), Ok(None))
    }

    /// Terminate the server process. Safe to call more than once.
    pub async fn shutdown(&self) {
        let Some(process) = &self.process else {
            return;
        };
        let mut process = process.lock().await;
        if let Err(e) = process.kill().await {
            debug!(server = %self.name, error = %e, "kill failed (process already gone?)");
        }
    }

    // --- Internal methods ---

    fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn request<P, R>(&self, method: &str, params: Option<P>) -> Result<R>
    where
        P: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        let id = self.next_request_id();
        let mut request = JsonRpcRequest::new(id.clone(), method);
        if let Some(p) = params {
            request = request.with_params(p);
        }
        let request_json = serde_json::to_string(&request)?;

        let mut channel = self.channel.lock().await;
        let exchange = async {
            channel.send_line(&request_json).await?;
            channel.read_response(&id).await
        };
        let response = timeout(self.timeout, exchange)
            .await
            .map_err(|_| Error::Timeout(self.timeout))??;

        let result_value = response.into_result()?;
        let result: R = serde_json::from_value(result_value)?;

        Ok(result)
    }

    async fn notify(&self, method: &str) -> Result<()> {
        let notification_json = serde_json::to_string(&JsonRpcNotification::new(method))?;
        self.channel
            .lock()
            .await
            .send_line(&notification_json)
            .await
    }
}
