// crates/keygate-server/src/web/mod.rs
// HTTP surface of the gateway

pub mod api;
pub mod mcp;
pub mod portal;
pub mod sse;
pub mod state;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::identity::identity_middleware;
use crate::web::state::AppState;

/// Build the gateway router. The same router serves both the tailnet
/// listener and the optional in-cluster listener; the identity middleware
/// sorts callers out per request.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(api::health))
        .route("/mcp", post(mcp::handle))
        .route("/mcp/sse", get(sse::handler))
        .route("/resolve", post(api::resolve))
        .route("/audit", get(api::audit_recent))
        .route("/setec/list", get(api::setec_list))
        .route("/setec/get", post(api::setec_get))
        .route("/aperture/webhook", post(api::webhook))
        .route("/portal", get(portal::page))
        .route("/portal/api", get(api::portal_api))
        .layer(middleware::from_fn(identity_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
