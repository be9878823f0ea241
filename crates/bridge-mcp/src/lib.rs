//! JSON-RPC 2.0 over stdio, as spoken by MCP servers.
//!
//! This crate is intentionally scoped to what the bridge daemon needs:
//! - the JSON-RPC envelope types (line-delimited, one object per line)
//! - the MCP payload shapes the bridge inspects (tool listings, tool results)
//! - [`StdioAdapter`], which owns a single MCP server subprocess and
//!   multiplexes concurrent id-correlated calls over its stdin/stdout.
//!
//! Everything protocol-method-specific (which tools exist, what their
//! arguments mean) is opaque to this crate; payloads travel as
//! `serde_json::Value`.

mod adapter;
mod jsonrpc;
mod types;

pub use adapter::{AdapterError, AdapterOptions, AdapterState, LaunchSpec, StdioAdapter};
pub use jsonrpc::{
    JsonRpcError, JsonRpcId, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};
pub use types::{CallToolParams, CallToolResult, ContentBlock, ListToolsResult, Tool};
