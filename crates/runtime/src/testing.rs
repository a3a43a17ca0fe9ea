//! Test doubles shared by the unit tests in this crate.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, WriteHalf};

use crate::model::{Model, ModelError};
use crate::provider::{Connector, ToolDescriptor};
use crate::retrieval::{IndexSummary, RetrievalError, Retriever};
use crate::transcript::{ToolCallRequest, Turn};

#[derive(Default)]
struct MockState {
    tools: Vec<String>,
    failing_tools: Vec<String>,
    call_delay: Duration,
    handshake_delay: Duration,
    refusing: AtomicBool,
    fail_calls: AtomicUsize,
    connects: AtomicUsize,
    handshakes: AtomicUsize,
    in_flight: AtomicUsize,
    overlapped: AtomicBool,
    calls: Mutex<Vec<String>>,
}

/// An in-process MCP provider served over `tokio::io::duplex`.
///
/// Each `connect` starts a fresh server task. Clones share configuration
/// and counters, so a test can keep one to inspect what the connection did.
#[derive(Clone)]
pub struct MockProvider {
    state: Arc<MockState>,
}

impl MockProvider {
    pub fn new(tools: &[&str]) -> Self {
        Self {
            state: Arc::new(MockState {
                tools: tools.iter().map(|t| t.to_string()).collect(),
                ..MockState::default()
            }),
        }
    }

    fn configure(mut self, f: impl FnOnce(&mut MockState)) -> Self {
        f(Arc::get_mut(&mut self.state).expect("configure a mock before cloning it"));
        self
    }

    pub fn with_call_delay(self, delay: Duration) -> Self {
        self.configure(|s| s.call_delay = delay)
    }

    pub fn with_handshake_delay(self, delay: Duration) -> Self {
        self.configure(|s| s.handshake_delay = delay)
    }

    /// Tool answers `isError: true` for this tool.
    pub fn with_failing_tool(self, tool: &str) -> Self {
        self.configure(|s| s.failing_tools.push(tool.to_string()))
    }

    /// Drop the connection instead of answering the next `n` tool calls.
    pub fn failing_next_calls(self, n: usize) -> Self {
        self.state.fail_calls.store(n, Ordering::SeqCst);
        self
    }

    pub fn refusing_connections(self) -> Self {
        self.set_refusing(true);
        self
    }

    pub fn set_refusing(&self, refusing: bool) {
        self.state.refusing.store(refusing, Ordering::SeqCst);
    }

    pub fn fail_next_calls(&self, n: usize) {
        self.state.fail_calls.store(n, Ordering::SeqCst);
    }

    /// Connection attempts, including refused ones.
    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// `initialize` requests answered.
    pub fn handshakes(&self) -> usize {
        self.state.handshakes.load(Ordering::SeqCst)
    }

    /// Names of tools invoked, in arrival order.
    pub fn calls(&self) -> Vec<String> {
        self.state.calls.lock().unwrap().clone()
    }

    /// Whether two tool calls were ever being served at the same time.
    pub fn overlapped(&self) -> bool {
        self.state.overlapped.load(Ordering::SeqCst)
    }
}

impl Connector for MockProvider {
    async fn connect(&self) -> mcp::Result<mcp::Client> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        if !self.state.handshake_delay.is_zero() {
            tokio::time::sleep(self.state.handshake_delay).await;
        }
        if self.state.refusing.load(Ordering::SeqCst) {
            return Err(mcp::Error::Spawn(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "mock provider refused",
            )));
        }

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(client_io);
        tokio::spawn(serve(self.state.clone(), server_io));
        Ok(mcp::Client::new("mock", reader, writer))
    }
}

type SharedWriter = Arc<tokio::sync::Mutex<WriteHalf<DuplexStream>>>;

async fn serve(state: Arc<MockState>, io: DuplexStream) {
    let (reader, writer) = tokio::io::split(io);
    let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(writer));
    let mut lines = BufReader::new(reader).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        // Notifications carry no id and need no answer.
        let Some(id) = message.get("id").cloned() else {
            continue;
        };

        match message["method"].as_str().unwrap_or_default() {
            "initialize" => {
                state.handshakes.fetch_add(1, Ordering::SeqCst);
                let capabilities = if state.tools.is_empty() {
                    json!({})
                } else {
                    json!({ "tools": {} })
                };
                let result = json!({
                    "protocolVersion": mcp::PROTOCOL_VERSION,
                    "capabilities": capabilities,
                    "serverInfo": { "name": "mock", "version": "0.0.0" },
                });
                respond(&writer, id, json!({ "result": result })).await;
            }
            "tools/list" => {
                let tools: Vec<Value> = state
                    .tools
                    .iter()
                    .map(|name| {
                        json!({
                            "name": name,
                            "description": format!("the {name} tool"),
                            "inputSchema": { "type": "object" },
                        })
                    })
                    .collect();
                respond(&writer, id, json!({ "result": { "tools": tools } })).await;
            }
            "tools/call" => {
                let drop_connection = state
                    .fail_calls
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if drop_connection {
                    return;
                }
                let state = state.clone();
                let writer = writer.clone();
                let params = message["params"].clone();
                tokio::spawn(async move { answer_call(&state, &writer, id, params).await });
            }
            method => {
                let error = json!({ "code": -32601, "message": format!("unknown method {method}") });
                respond(&writer, id, json!({ "error": error })).await;
            }
        }
    }
}

async fn answer_call(state: &MockState, writer: &SharedWriter, id: Value, params: Value) {
    let name = params["name"].as_str().unwrap_or_default().to_string();
    state.calls.lock().unwrap().push(name.clone());

    if state.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
        state.overlapped.store(true, Ordering::SeqCst);
    }
    if !state.call_delay.is_zero() {
        tokio::time::sleep(state.call_delay).await;
    }
    state.in_flight.fetch_sub(1, Ordering::SeqCst);

    let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
    let result = if state.failing_tools.contains(&name) {
        json!({
            "content": [{ "type": "text", "text": format!("{name} exploded") }],
            "isError": true,
        })
    } else {
        json!({ "content": [{ "type": "text", "text": format!("{name}: {arguments}") }] })
    };
    respond(writer, id, json!({ "result": result })).await;
}

async fn respond(writer: &SharedWriter, id: Value, mut body: Value) {
    body["jsonrpc"] = json!("2.0");
    body["id"] = id;
    let mut line = body.to_string();
    line.push('\n');
    let mut writer = writer.lock().await;
    let _ = writer.write_all(line.as_bytes()).await;
    let _ = writer.flush().await;
}

/// A model that replays a fixed script of turns.
#[derive(Default)]
pub struct ScriptedModel {
    script: Mutex<VecDeque<Result<Turn, String>>>,
    looping_tool: Option<(String, Value)>,
    seen: Mutex<Vec<Seen>>,
}

/// What the model was shown on one completion call.
#[derive(Debug, Clone)]
pub struct Seen {
    pub transcript: Vec<Turn>,
    pub tools: Vec<String>,
}

impl ScriptedModel {
    pub fn new(turns: impl IntoIterator<Item = Turn>) -> Self {
        Self {
            script: Mutex::new(turns.into_iter().map(Ok).collect()),
            ..Self::default()
        }
    }

    /// A model that fails every call.
    pub fn failing(message: &str) -> Self {
        Self {
            script: Mutex::new(VecDeque::from([Err(message.to_string())])),
            ..Self::default()
        }
    }

    /// A model that requests the same tool forever.
    pub fn looping(tool: &str, arguments: Value) -> Self {
        Self {
            looping_tool: Some((tool.to_string(), arguments)),
            ..Self::default()
        }
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn completions(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

/// Assistant turn requesting a single tool.
pub fn call(id: &str, tool: &str, arguments: Value) -> Turn {
    Turn::tool_request(None, vec![ToolCallRequest::new(id, tool, arguments)])
}

impl Model for ScriptedModel {
    async fn complete(&self, transcript: &[Turn], tools: &[ToolDescriptor]) -> Result<Turn, ModelError> {
        let round = {
            let mut seen = self.seen.lock().unwrap();
            seen.push(Seen {
                transcript: transcript.to_vec(),
                tools: tools.iter().map(|t| t.name.clone()).collect(),
            });
            seen.len()
        };

        if let Some((tool, arguments)) = &self.looping_tool {
            return Ok(call(&format!("call-{round}"), tool, arguments.clone()));
        }

        let mut script = self.script.lock().unwrap();
        match script.pop_front() {
            Some(Ok(turn)) => Ok(turn),
            Some(Err(message)) => {
                script.push_front(Err(message.clone()));
                Err(ModelError::Api(message))
            }
            None => Err(ModelError::Api("script exhausted".to_string())),
        }
    }
}

/// Retriever that returns fixed context for any label and remembers every
/// query. With no label it returns nothing.
#[derive(Default)]
pub struct RecordingRetriever {
    context: String,
    queries: Mutex<Vec<(String, Option<String>)>>,
}

impl RecordingRetriever {
    pub fn with_context(context: &str) -> Self {
        Self {
            context: context.to_string(),
            ..Self::default()
        }
    }

    pub fn queries(&self) -> Vec<(String, Option<String>)> {
        self.queries.lock().unwrap().clone()
    }
}

impl Retriever for RecordingRetriever {
    async fn retrieve(&self, query: &str, label: Option<&str>) -> Result<String, RetrievalError> {
        self.queries
            .lock()
            .unwrap()
            .push((query.to_string(), label.map(str::to_string)));
        Ok(label.map(|_| self.context.clone()).unwrap_or_default())
    }

    async fn create_index(&self, _dir: &std::path::Path, _label: &str) -> Result<IndexSummary, RetrievalError> {
        Err(RetrievalError::Unsupported)
    }

    async fn delete_index(&self, _label: &str) -> Result<(), RetrievalError> {
        Err(RetrievalError::Unsupported)
    }
}

impl Retriever for Arc<RecordingRetriever> {
    async fn retrieve(&self, query: &str, label: Option<&str>) -> Result<String, RetrievalError> {
        (**self).retrieve(query, label).await
    }

    async fn create_index(&self, dir: &std::path::Path, label: &str) -> Result<IndexSummary, RetrievalError> {
        (**self).create_index(dir, label).await
    }

    async fn delete_index(&self, label: &str) -> Result<(), RetrievalError> {
        (**self).delete_index(label).await
    }
}
