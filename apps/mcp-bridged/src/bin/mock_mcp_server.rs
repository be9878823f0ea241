//! Line-delimited JSON-RPC stdio server used by the integration tests.
//!
//! Requests are handled on their own tasks (responses funnel through a
//! single writer), so the bridge's per-session serialization is observable:
//! overlapping `record_call` invocations would interleave their start/end
//! markers in `calls.log`.

use std::time::Duration;

use bridge_mcp::{
    CallToolParams, JsonRpcError, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, ListToolsResult,
    Tool,
};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    let (out_tx, mut out_rx) = mpsc::channel::<JsonRpcResponse>(64);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(resp) = out_rx.recv().await {
            let Ok(mut line) = serde_json::to_string(&resp) else {
                continue;
            };
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        let Ok(JsonRpcMessage::Request(req)) = serde_json::from_str::<JsonRpcMessage>(&line)
        else {
            continue; // notifications and junk are ignored
        };
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            let _ = out_tx.send(handle(req).await).await;
        });
    }

    drop(out_tx);
    let _ = writer.await;
}

async fn handle(req: JsonRpcRequest) -> JsonRpcResponse {
    match req.method.as_str() {
        "initialize" => JsonRpcResponse::ok(
            req.id,
            json!({
                "protocolVersion": "2025-06-18",
                "capabilities": { "tools": { "listChanged": false } },
                "serverInfo": { "name": "mock-mcp-server", "version": "0.0.0" }
            }),
        ),
        "tools/list" => {
            let tools = ListToolsResult {
                tools: vec![
                    tool("create_presentation", "start a new presentation"),
                    tool("save_presentation", "write the presentation to disk"),
                    tool("whoami", "report the server process id"),
                ],
                next_cursor: None,
            };
            JsonRpcResponse::ok(
                req.id,
                serde_json::to_value(tools).unwrap_or(Value::Null),
            )
        }
        "tools/call" => {
            let params = match req
                .params
                .clone()
                .and_then(|p| serde_json::from_value::<CallToolParams>(p).ok())
            {
                Some(p) => p,
                None => return error(req.id, -32602, "invalid params"),
            };
            call_tool(req.id, params).await
        }
        _ => error(req.id, -32601, "method not found"),
    }
}

fn tool(name: &str, description: &str) -> Tool {
    Tool {
        name: name.to_string(),
        title: None,
        description: Some(description.to_string()),
        input_schema: json!({ "type": "object" }),
    }
}

async fn call_tool(id: bridge_mcp::JsonRpcId, params: CallToolParams) -> JsonRpcResponse {
    let args = params.arguments.unwrap_or_else(|| json!({}));
    match params.name.as_str() {
        "whoami" => JsonRpcResponse::ok(
            id,
            json!({
                "content": [ { "type": "text", "text": format!("pid {}", std::process::id()) } ],
                "pid": std::process::id()
            }),
        ),
        "create_presentation" => {
            let pres = args.get("id").and_then(Value::as_str).unwrap_or("?");
            JsonRpcResponse::ok(
                id,
                json!({
                    "content": [ { "type": "text", "text": format!("presentation {pres} created") } ]
                }),
            )
        }
        "save_presentation" => {
            let Some(path) = args.get("file_path").and_then(Value::as_str) else {
                return error(id, -32602, "missing file_path");
            };
            if tokio::fs::write(path, b"pptx-bytes").await.is_err() {
                return error(id, -32603, "write failed");
            }
            let basename = std::path::Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_string());
            JsonRpcResponse::ok(
                id,
                json!({
                    "content": [ { "type": "text", "text": format!("{basename} saved") } ],
                    "file_path": path
                }),
            )
        }
        "record_call" => {
            let tag = args.get("tag").and_then(Value::as_str).unwrap_or("?").to_string();
            let hold_ms = args.get("hold_ms").and_then(Value::as_u64).unwrap_or(0);
            append_log(&format!("start {tag}")).await;
            tokio::time::sleep(Duration::from_millis(hold_ms)).await;
            append_log(&format!("end {tag}")).await;
            JsonRpcResponse::ok(
                id,
                json!({ "content": [ { "type": "text", "text": format!("recorded {tag}") } ] }),
            )
        }
        "sleep" => {
            let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            JsonRpcResponse::ok(
                id,
                json!({ "content": [ { "type": "text", "text": "awake" } ] }),
            )
        }
        "boom" => error(id, -32001, "boom tool failed"),
        _ => error(id, -32602, "unknown tool"),
    }
}

async fn append_log(entry: &str) {
    if let Ok(mut f) = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open("calls.log")
        .await
    {
        let _ = f.write_all(format!("{entry}\n").as_bytes()).await;
    }
}

fn error(id: bridge_mcp::JsonRpcId, code: i64, message: &str) -> JsonRpcResponse {
    JsonRpcResponse::err(
        id,
        JsonRpcError {
            code,
            message: message.to_string(),
            data: None,
        },
    )
}
