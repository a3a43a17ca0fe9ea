//! MCP (Model Context Protocol) client library.
//!
//! Tool providers are child processes speaking JSON-RPC 2.0, one message per
//! line, over stdin/stdout. This crate owns that wire format and nothing else:
//! connection state, reconnects, and tool routing live in `runtime`.
//!
//! # Example
//!
//! ```no_run
//! use mcp::{Client, ServerConfig};
//! use std::collections::HashMap;
//!
//! # async fn example() -> mcp::Result<()> {
//! let config = ServerConfig {
//!     name: "filesystem".to_string(),
//!     command: "mcp-filesystem".to_string(),
//!     args: vec!["--root".to_string(), "./workspace".to_string()],
//!     env: HashMap::new(),
//! };
//!
//! let client = Client::spawn(&config)?;
//! client.initialize().await?;
//!
//! for tool in client.list_tools().await? {
//!     println!("Tool: {}", tool.name);
//! }
//!
//! let result = client
//!     .call_tool("read_file", Some(serde_json::json!({ "path": "./README.md" })))
//!     .await?;
//! println!("{}", result.text());
//!
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod protocol;

pub use client::{Client, DEFAULT_TIMEOUT, MAX_OUTPUT_SIZE, ServerConfig};
pub use error::{Error, Result};
pub use protocol::{
    CallToolParams, CallToolResult, EmbeddedResource, InitializeParams, InitializeResult,
    JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListToolsResult,
    PROTOCOL_VERSION, RequestId, ServerCapabilities, ServerInfo, Tool, ToolContent,
};
