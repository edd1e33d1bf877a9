// crates/keygate-server/src/web/state.rs
// Shared state for the HTTP layer

use std::sync::Arc;

use crate::audit::AuditLog;
use crate::meter::MeterStore;
use crate::meter::webhook::WebhookReceiver;
use crate::proxy::McpProxy;
use crate::proxy::dispatch::LocalDispatcher;
use crate::proxy::registry::ToolRegistry;
use crate::secrets::{Resolver, SecretClient};
use crate::tools::ApertureUsage;

/// Shared application state. Every component is constructed once by the
/// orchestrator; handlers only ever see these references.
#[derive(Clone)]
pub struct AppState {
    /// Child subprocess bridge. Absent when no helper binary is configured;
    /// the gateway then serves only its native tools.
    pub proxy: Option<Arc<McpProxy>>,
    pub registry: Arc<ToolRegistry>,
    pub dispatcher: Arc<LocalDispatcher>,
    pub resolver: Arc<Resolver>,
    pub audit: Arc<AuditLog>,
    pub meter: Arc<MeterStore>,
    pub setec: Option<Arc<SecretClient>>,
    pub webhook: Arc<WebhookReceiver>,
    pub usage: Arc<ApertureUsage>,
}
