// crates/keygate-server/src/web/mcp.rs
// JSON-RPC endpoint: local dispatch for gateway tools, forwarding for the rest

use std::time::{Duration, Instant};

use axum::Json;
use axum::extract::{Extension, State};
use chrono::Utc;
use keygate_types::{CallerIdentity, MeterRecord};
use serde_json::{Value, json};
use tracing::debug;

use crate::proxy::dispatch::text_result;
use crate::web::state::AppState;

/// MCP protocol version the gateway itself speaks to callers.
const PROTOCOL_VERSION: &str = "2024-11-05";

/// Deadline for one forwarded child exchange. A stuck child surfaces here
/// instead of pinning the HTTP connection open.
const CHILD_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// `POST /mcp` — one JSON-RPC request, one response.
pub async fn handle(
    State(state): State<AppState>,
    Extension(identity): Extension<CallerIdentity>,
    Json(request): Json<Value>,
) -> Json<Value> {
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let method = request
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    if method.is_empty() {
        return Json(rpc_error(id, -32600, "missing method"));
    }

    // Notifications (no id) are forwarded best-effort and acknowledged with
    // an empty body.
    if request.get("id").is_none() {
        if let Some(proxy) = &state.proxy {
            let _ = proxy.notify(&request).await;
        }
        return Json(json!({}));
    }

    debug!(method = %method, caller = %identity.display(), "MCP request");

    match method.as_str() {
        "initialize" => Json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {"listChanged": true}},
                "serverInfo": {"name": "keygate", "version": env!("CARGO_PKG_VERSION")},
            },
        })),

        "tools/list" => Json(tools_list(&state, &request, id).await),

        "tools/call" => Json(tools_call(&state, &identity, &request, id).await),

        _ => match &state.proxy {
            Some(proxy) => match forward_with_deadline(proxy, &request).await {
                Ok(response) => Json(response),
                Err(e) => Json(rpc_error(id, -32000, &e)),
            },
            None => Json(rpc_error(id, -32601, &format!("method not available: {method}"))),
        },
    }
}

async fn forward_with_deadline(
    proxy: &crate::proxy::McpProxy,
    request: &Value,
) -> Result<Value, String> {
    match tokio::time::timeout(CHILD_RPC_TIMEOUT, proxy.rpc(request)).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("child request timed out".to_string()),
    }
}

/// Child list plus gateway tools when the child answers; gateway-only
/// otherwise.
async fn tools_list(state: &AppState, request: &Value, id: Value) -> Value {
    if let Some(proxy) = &state.proxy {
        if proxy.is_running() {
            match tokio::time::timeout(CHILD_RPC_TIMEOUT, proxy.forward(request)).await {
                Ok(Ok(response)) => return response,
                Ok(Err(e)) => debug!(error = %e, "Child tools/list failed, serving gateway tools"),
                Err(_) => debug!("Child tools/list timed out, serving gateway tools"),
            }
        }
    }
    state.registry.standalone_response(id)
}

async fn tools_call(
    state: &AppState,
    identity: &CallerIdentity,
    request: &Value,
    id: Value,
) -> Value {
    let params = request.get("params").cloned().unwrap_or_else(|| json!({}));
    let tool = match params.get("name").and_then(Value::as_str) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => return rpc_error(id, -32602, "missing tool name"),
    };
    let args = params
        .get("arguments")
        .cloned()
        .unwrap_or_else(|| json!({}));

    let started = Instant::now();
    let response = if state.dispatcher.is_local(&tool) {
        match state.dispatcher.dispatch(identity, &tool, &args).await {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err(e) => {
                let mut result = text_result(e);
                result["isError"] = json!(true);
                json!({"jsonrpc": "2.0", "id": id, "result": result})
            }
        }
    } else {
        match &state.proxy {
            Some(proxy) => match forward_with_deadline(proxy, request).await {
                Ok(response) => response,
                Err(e) => rpc_error(id, -32000, &e),
            },
            None => rpc_error(id, -32601, &format!("unknown tool: {tool}")),
        }
    };

    // Per-tool-call metering hook: the first of the three ingest feeds.
    let is_error = response.get("error").is_some()
        || response["result"]["isError"].as_bool().unwrap_or(false);
    state.meter.record(&MeterRecord {
        agent: identity.login.clone(),
        campaign_id: args
            .get("campaign_id")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        tool_name: tool,
        request_bytes: args.to_string().len() as u64,
        response_bytes: response.to_string().len() as u64,
        duration_ms: started.elapsed().as_millis() as u64,
        timestamp: Utc::now(),
        is_error,
        input_tokens: 0,
        output_tokens: 0,
    });

    response
}

fn rpc_error(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message},
    })
}
