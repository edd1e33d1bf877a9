//! Integration tests for the gateway surface
//!
//! These exercise whole request paths across components: the HTTP router,
//! the local tool dispatcher, the meter pipeline, and the subprocess bridge
//! with a scripted stand-in for the MCP helper.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use keygate::audit::AuditLog;
use keygate::meter::MeterStore;
use keygate::meter::webhook::WebhookReceiver;
use keygate::proxy::dispatch::LocalDispatcher;
use keygate::proxy::registry::ToolRegistry;
use keygate::proxy::{McpProxy, ProxyState};
use keygate::secrets::Resolver;
use keygate::tools::ApertureUsage;
use keygate::web::create_router;
use keygate::web::state::AppState;

fn gateway_state(proxy: Option<Arc<McpProxy>>) -> AppState {
    let audit = Arc::new(AuditLog::default());
    let meter = Arc::new(MeterStore::new());
    let registry = Arc::new(ToolRegistry::new());
    let resolver = Arc::new(Resolver::new(
        vec!["env".into()],
        None,
        None,
        audit.clone(),
    ));
    let usage = Arc::new(ApertureUsage::new(
        reqwest::Client::new(),
        None,
        Some(meter.clone()),
    ));
    let dispatcher = Arc::new(LocalDispatcher::new(
        registry.clone(),
        resolver.clone(),
        None,
        audit.clone(),
        None,
        None,
        usage.clone(),
    ));
    let webhook = Arc::new(WebhookReceiver::new("", meter.clone()));
    AppState {
        proxy,
        registry,
        dispatcher,
        resolver,
        audit,
        meter,
        setec: None,
        webhook,
        usage,
    }
}

async fn post_json(app: axum::Router, path: &str, body: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::post(path)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_webhook_ingest_shows_up_in_portal_aggregate() {
    let state = gateway_state(None);
    let app = create_router(state);

    let payload = r#"[
        {"type":"llm_call","agent":"openclaw","campaign_id":"oc-smoketest","model":"m","input_tokens":1200,"output_tokens":350},
        {"type":"llm_call","agent":"openclaw","campaign_id":"oc-smoketest","model":"m","tokens":500}
    ]"#;
    let (status, body) = post_json(app.clone(), "/aperture/webhook", payload).await;
    assert_eq!(status, StatusCode::OK, "webhook ingest failed: {body}");
    assert_eq!(body["accepted"], 2);

    let response = app
        .oneshot(Request::get("/portal/api").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let aggregate: Value = serde_json::from_slice(&bytes).unwrap();

    let buckets = aggregate["buckets"].as_array().unwrap();
    assert_eq!(buckets.len(), 1, "expected one (agent, campaign) bucket");
    assert_eq!(buckets[0]["agent"], "openclaw");
    assert_eq!(buckets[0]["input_tokens"], 1200);
    assert_eq!(buckets[0]["output_tokens"], 850);
    assert_eq!(buckets[0]["tool_calls"], 2);
    assert_eq!(aggregate["webhook_events"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_resolve_tool_call_audits_with_caller_identity() {
    unsafe {
        std::env::set_var("KEYGATE_INTEGRATION_TOKEN", "tok");
    }
    let state = gateway_state(None);
    let audit = state.audit.clone();
    let app = create_router(state);

    let request = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "tools/call",
        "params": {
            "name": "keygate_resolve",
            "arguments": {"query": "KEYGATE_INTEGRATION_TOKEN"},
        },
    });
    let response = app
        .oneshot(
            Request::post("/mcp")
                .header("content-type", "application/json")
                .header("x-agent-identity", "openclaw")
                .body(Body::from(request.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    unsafe {
        std::env::remove_var("KEYGATE_INTEGRATION_TOKEN");
    }
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();

    let text = body["result"]["content"][0]["text"].as_str().unwrap();
    let resolved: Value = serde_json::from_str(text).unwrap();
    assert_eq!(resolved["value"], "tok");
    assert_eq!(resolved["source"], "env");

    // The audit entry carries the in-cluster caller identity and the same
    // source the caller saw.
    let entry = &audit.recent(1)[0];
    assert_eq!(entry.caller.login, "openclaw");
    assert_eq!(entry.source, "env");
    assert!(entry.allowed);
}

#[cfg(unix)]
mod with_scripted_child {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    /// A stand-in helper: answers every request line (anything carrying an
    /// id) with a canned two-tool `tools/list` result, ignores
    /// notifications, like the real helper's framing.
    fn scripted_child() -> tempfile::TempPath {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"#!/bin/sh
while read line; do
  case "$line" in
    *'"id"'*) printf '{{"jsonrpc":"2.0","id":1,"result":{{"tools":[{{"name":"chapel_a"}},{{"name":"chapel_b"}}]}}}}\n' ;;
  esac
done"#
        )
        .unwrap();
        let path = file.into_temp_path();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[tokio::test]
    async fn test_tools_list_is_union_of_child_and_gateway() {
        let registry = Arc::new(ToolRegistry::new());
        let gateway_count = registry.len();
        let proxy = Arc::new(McpProxy::new(registry));

        let script = scripted_child();
        proxy.start(script.to_str().unwrap()).await.unwrap();
        assert_eq!(proxy.state(), ProxyState::Running);

        let state = gateway_state(Some(proxy.clone()));
        let app = create_router(state);
        let (status, body) = post_json(
            app,
            "/mcp",
            r#"{"jsonrpc":"2.0","id":5,"method":"tools/list"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let tools = body["result"]["tools"].as_array().unwrap();
        assert_eq!(
            tools.len(),
            2 + gateway_count,
            "expected child tools plus the gateway set"
        );
        assert_eq!(tools[0]["name"], "chapel_a");
        assert!(tools.iter().any(|t| t["name"] == "keygate_resolve"));

        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_tools_list_degrades_to_gateway_set_when_child_gone() {
        let registry = Arc::new(ToolRegistry::new());
        let gateway_count = registry.len();
        let proxy = Arc::new(McpProxy::new(registry));

        let script = scripted_child();
        proxy.start(script.to_str().unwrap()).await.unwrap();
        proxy.stop().await;

        let state = gateway_state(Some(proxy));
        let app = create_router(state);
        let (status, body) = post_json(
            app,
            "/mcp",
            r#"{"jsonrpc":"2.0","id":6,"method":"tools/list"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], 6);
        assert_eq!(
            body["result"]["tools"].as_array().unwrap().len(),
            gateway_count
        );
    }
}
