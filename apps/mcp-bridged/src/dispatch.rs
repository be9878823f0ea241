//! Top-level request dispatch: classify, locate-or-spawn, exchange, rewrite.
//!
//! HTTP status is reserved for envelope-level failures (unknown server,
//! malformed body, capacity, timeout); everything the subprocess itself has
//! an opinion about travels as a JSON-RPC `error` member in a 200 response.
//! The response always carries the caller's original id; the adapter's
//! internal ids never leak.

use std::net::IpAddr;

use axum::Json;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bridge_mcp::{AdapterError, JsonRpcError, JsonRpcId, JsonRpcResponse, StdioAdapter};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::app::AppState;
use crate::config::ServerSpec;
use crate::enrich;
use crate::jobs::{JobStatus, Workspace};
use crate::pathmap;
use crate::session::{self, RegistryError, SessionKey};

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// One parsed JSON-RPC exchange. `caller_id: None` means notification.
struct RpcCall {
    method: String,
    params: Option<Value>,
    caller_id: Option<Value>,
}

impl RpcCall {
    fn id(&self) -> JsonRpcId {
        self.caller_id
            .as_ref()
            .map(JsonRpcId::from_value)
            .unwrap_or(JsonRpcId::Null)
    }
}

pub async fn dispatch(
    state: &AppState,
    proto: &'static str,
    server_name: &str,
    headers: &HeaderMap,
    peer: Option<IpAddr>,
    body: &[u8],
) -> Response {
    let Some(spec) = state.catalog.get(server_name) else {
        return http_error(
            StatusCode::NOT_FOUND,
            "server_unknown",
            format!("unknown server: {server_name}"),
        );
    };

    let envelope: Value = match serde_json::from_slice(body) {
        Ok(v @ Value::Object(_)) => v,
        _ => {
            return http_error(
                StatusCode::BAD_REQUEST,
                "parse_error",
                "request body is not a JSON-RPC 2.0 object".to_string(),
            );
        }
    };
    let Some(method) = envelope.get("method").and_then(Value::as_str) else {
        return http_error(
            StatusCode::BAD_REQUEST,
            "parse_error",
            "missing method".to_string(),
        );
    };
    let call = RpcCall {
        method: method.to_string(),
        params: envelope.get("params").cloned(),
        caller_id: envelope.get("id").cloned(),
    };

    let ip = session::client_ip(headers, peer);
    let key = SessionKey::derive(headers, &ip);
    info!(proto, server = server_name, key = %key, method = %call.method, "dispatching");

    // The synthetic documentation tool is answered locally; the subprocess
    // is never contacted.
    if call.method == "tools/call"
        && let Some(guide) = spec.usage_guide.as_deref()
        && invoked_tool(&call) == Some(enrich::USAGE_TOOL_NAME)
    {
        return rpc_ok(call.id(), enrich::usage_tool_result(guide));
    }

    if state.catalog.is_stateful(spec, &state.settings) {
        dispatch_stateful(state, server_name, spec, key, call).await
    } else {
        dispatch_ephemeral(state, server_name, spec, key, call).await
    }
}

fn invoked_tool(call: &RpcCall) -> Option<&str> {
    call.params.as_ref()?.get("name")?.as_str()
}

async fn dispatch_stateful(
    state: &AppState,
    server_name: &str,
    spec: &ServerSpec,
    key: SessionKey,
    mut call: RpcCall,
) -> Response {
    let idle_timeout = state.catalog.idle_timeout(spec, &state.settings);
    let max_per_session = state.catalog.max_per_session(spec, &state.settings);

    let handle = match state
        .registry
        .acquire(server_name, key, spec, &state.jobs, idle_timeout, max_per_session)
        .await
    {
        Ok(h) => h,
        Err(RegistryError::CapacityExceeded) => {
            return http_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "capacity_exceeded",
                "too many concurrent sessions".to_string(),
            );
        }
        Err(RegistryError::Spawn(e)) => {
            warn!(server = server_name, error = %e, "session spawn failed");
            return rpc_err(call.id(), -32603, format!("failed to start MCP server: {e}"));
        }
        Err(RegistryError::Workspace(e)) => {
            warn!(server = server_name, error = %e, "workspace allocation failed");
            return rpc_err(call.id(), -32603, "failed to allocate workspace".to_string());
        }
    };
    let session = handle.session().clone();

    // Arrival-order serialization: one exchange at a time per session.
    let _serialized = session.lock.lock().await;

    if call.caller_id.is_none() {
        return match session.adapter.notify(&call.method, call.params).await {
            Ok(()) => (StatusCode::OK, Json(serde_json::json!({}))).into_response(),
            Err(e) => {
                state.registry.invalidate(&session).await;
                rpc_err(JsonRpcId::Null, -32000, format!("adapter terminated: {e}"))
            }
        };
    }

    if let Some(params) = call.params.as_mut()
        && let Err(escape) =
            pathmap::resolve_inbound(params, &session.workspace.dir, &spec.resolve_path_fields)
    {
        return rpc_err(call.id(), -32602, escape.to_string());
    }

    let outcome = exchange(state, &session.adapter, &call).await;
    match outcome {
        Err(AdapterError::Terminated) | Err(AdapterError::Transport(_)) => {
            state.registry.invalidate(&session).await;
        }
        // Timeouts and upstream errors leave the session usable; the next
        // request reuses it.
        _ => {}
    }
    finish(state, spec, &session.workspace, call, outcome).await
}

async fn dispatch_ephemeral(
    state: &AppState,
    server_name: &str,
    spec: &ServerSpec,
    key: SessionKey,
    mut call: RpcCall,
) -> Response {
    let workspace = match state.jobs.create(server_name, Some(&key.to_string())).await {
        Ok(w) => w,
        Err(e) => {
            warn!(server = server_name, error = %e, "workspace allocation failed");
            return rpc_err(call.id(), -32603, "failed to allocate workspace".to_string());
        }
    };

    // Refused paths must never launch a process.
    if let Some(params) = call.params.as_mut()
        && let Err(escape) =
            pathmap::resolve_inbound(params, &workspace.dir, &spec.resolve_path_fields)
    {
        state
            .jobs
            .update_status(&workspace, JobStatus::Failed, Some(&escape.to_string()))
            .await;
        return rpc_err(call.id(), -32602, escape.to_string());
    }

    let launch = session::launch_spec(server_name, spec, &workspace);
    let adapter = match StdioAdapter::spawn(&launch).await {
        Ok(a) => a,
        Err(e) => {
            warn!(server = server_name, error = %e, "ephemeral spawn failed");
            state
                .jobs
                .update_status(&workspace, JobStatus::Failed, Some(&e.to_string()))
                .await;
            return rpc_err(call.id(), -32603, format!("failed to start MCP server: {e}"));
        }
    };

    if call.caller_id.is_none() {
        let sent = adapter.notify(&call.method, call.params).await;
        tokio::spawn(async move { adapter.close().await });
        return match sent {
            Ok(()) => (StatusCode::OK, Json(serde_json::json!({}))).into_response(),
            Err(e) => rpc_err(JsonRpcId::Null, -32000, format!("adapter terminated: {e}")),
        };
    }

    let outcome = exchange(state, &adapter, &call).await;
    // One request, one process. The workspace stays behind so download URLs
    // remain valid until the GC sweep ages it out.
    tokio::spawn(async move { adapter.close().await });
    finish(state, spec, &workspace, call, outcome).await
}

/// The single subprocess exchange, bounded by the global concurrency cap.
async fn exchange(
    state: &AppState,
    adapter: &StdioAdapter,
    call: &RpcCall,
) -> Result<Value, AdapterError> {
    let _permit = state
        .call_permits
        .acquire()
        .await
        .map_err(|_| AdapterError::Terminated)?;
    adapter
        .call(&call.method, call.params.clone(), state.settings.timeout)
        .await
}

/// Map the exchange outcome onto the wire: enrichment and outbound path
/// rewriting on success, status mapping on failure.
async fn finish(
    state: &AppState,
    spec: &ServerSpec,
    workspace: &Workspace,
    call: RpcCall,
    outcome: Result<Value, AdapterError>,
) -> Response {
    match outcome {
        Ok(mut result) => {
            if call.method == "tools/list" {
                if let Some(guide) = spec.usage_guide.as_deref() {
                    enrich::append_usage_tool(&mut result, guide);
                }
            } else {
                let exposed = pathmap::expose_downloads(
                    &mut result,
                    &workspace.dir,
                    workspace.job_id,
                    &state.settings.base_url,
                    &spec.file_path_fields,
                );
                pathmap::append_file_links(&mut result, &exposed);
            }
            state
                .jobs
                .update_status(workspace, JobStatus::Completed, None)
                .await;
            rpc_ok(call.id(), result)
        }
        // Domain errors from the server are a completed exchange; forward
        // the error member verbatim under the caller's id.
        Err(AdapterError::Rpc(upstream)) => {
            state
                .jobs
                .update_status(workspace, JobStatus::Completed, None)
                .await;
            (
                StatusCode::OK,
                Json(JsonRpcResponse::err(call.id(), upstream)),
            )
                .into_response()
        }
        Err(AdapterError::Timeout(d)) => {
            state
                .jobs
                .update_status(workspace, JobStatus::Failed, Some("timeout"))
                .await;
            http_error(
                StatusCode::GATEWAY_TIMEOUT,
                "timeout",
                format!("MCP server did not answer within {}s", d.as_secs()),
            )
        }
        Err(e) => {
            state
                .jobs
                .update_status(workspace, JobStatus::Failed, Some(&e.to_string()))
                .await;
            rpc_err(call.id(), -32000, format!("adapter terminated: {e}"))
        }
    }
}

fn rpc_ok(id: JsonRpcId, result: Value) -> Response {
    (StatusCode::OK, Json(JsonRpcResponse::ok(id, result))).into_response()
}

fn rpc_err(id: JsonRpcId, code: i64, message: String) -> Response {
    (
        StatusCode::OK,
        Json(JsonRpcResponse::err(
            id,
            JsonRpcError {
                code,
                message,
                data: None,
            },
        )),
    )
        .into_response()
}

fn http_error(status: StatusCode, code: &str, message: String) -> Response {
    (
        status,
        Json(ErrorBody {
            code: code.to_string(),
            message,
        }),
    )
        .into_response()
}
