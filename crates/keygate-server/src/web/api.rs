// crates/keygate-server/src/web/api.rs
// REST handlers: health, resolution, audit, secret store, webhook, portal data

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Extension, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use keygate_types::CallerIdentity;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::meter::webhook::WEBHOOK_SECRET_HEADER;
use crate::web::state::AppState;

pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "keygate",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Deserialize)]
pub struct ResolveRequest {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub sources: Vec<String>,
}

/// `POST /resolve` — composite secret resolution for HTTP callers.
pub async fn resolve(
    State(state): State<AppState>,
    Extension(identity): Extension<CallerIdentity>,
    Json(req): Json<ResolveRequest>,
) -> impl IntoResponse {
    if req.query.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "query is required"})),
        )
            .into_response();
    }
    let result = state.resolver.resolve(&identity, &req.query, &req.sources).await;
    Json(result).into_response()
}

/// `GET /audit` — the 50 newest credential-access entries.
pub async fn audit_recent(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"entries": state.audit.recent(50)}))
}

/// `GET /setec/list` — secret names and versions, never values.
pub async fn setec_list(
    State(state): State<AppState>,
    Extension(identity): Extension<CallerIdentity>,
) -> impl IntoResponse {
    let setec = match &state.setec {
        Some(s) => s,
        None => return unconfigured("secret store"),
    };
    let result = setec.list().await;
    let (allowed, reason) = outcome(&result);
    state
        .audit
        .log_access(&identity, "setec_list", "*", "setec", allowed, reason, None);
    match result {
        Ok(infos) => Json(json!({"secrets": infos})).into_response(),
        Err(e) => upstream_error(e.to_string()),
    }
}

#[derive(Deserialize)]
pub struct SecretGetRequest {
    pub name: String,
}

/// `POST /setec/get` — fetch one secret value.
pub async fn setec_get(
    State(state): State<AppState>,
    Extension(identity): Extension<CallerIdentity>,
    Json(req): Json<SecretGetRequest>,
) -> impl IntoResponse {
    let setec = match &state.setec {
        Some(s) => s,
        None => return unconfigured("secret store"),
    };
    if req.name.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "name is required"})),
        )
            .into_response();
    }
    let result = setec.get(&req.name).await;
    let (allowed, reason) = outcome(&result);
    state.audit.log_access(
        &identity,
        "setec_get",
        &req.name,
        "setec",
        allowed,
        reason,
        None,
    );
    match result {
        Ok((value, cached)) => {
            Json(json!({"name": req.name, "value": value, "cached": cached})).into_response()
        }
        Err(e) => upstream_error(e.to_string()),
    }
}

/// `POST /aperture/webhook` — LLM-usage event ingest, both dialects.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let provided = headers
        .get(WEBHOOK_SECRET_HEADER)
        .and_then(|v| v.to_str().ok());
    if !state.webhook.authorized(provided) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "missing or invalid webhook secret"})),
        )
            .into_response();
    }
    match state.webhook.ingest(&body) {
        Ok(accepted) => Json(json!({
            "accepted": accepted,
            "total": state.webhook.total(),
        }))
        .into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, Json(json!({"error": e}))).into_response(),
    }
}

/// `GET /portal/api` — the aggregate view the dashboard polls.
pub async fn portal_api(State(state): State<AppState>) -> Json<Value> {
    let proxy_state = match &state.proxy {
        Some(p) => format!("{:?}", p.state()),
        None => "Disabled".to_string(),
    };
    Json(json!({
        "proxy": proxy_state,
        "total_calls": state.meter.total_calls(),
        "buckets": state.meter.query("", ""),
        "audit": state.audit.recent(20),
        "webhook_events": state.webhook.recent(20),
        "webhook_total": state.webhook.total(),
    }))
}

fn outcome<T, E: ToString>(result: &Result<T, E>) -> (bool, Option<String>) {
    match result {
        Ok(_) => (true, None),
        Err(e) => (false, Some(e.to_string())),
    }
}

fn unconfigured(what: &str) -> axum::response::Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"error": format!("{what} not configured")})),
    )
        .into_response()
}

fn upstream_error(message: String) -> axum::response::Response {
    (StatusCode::BAD_GATEWAY, Json(json!({"error": message}))).into_response()
}
