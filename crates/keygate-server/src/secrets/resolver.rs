// crates/keygate-server/src/secrets/resolver.rs
// Precedence-ordered composite secret resolution

use std::sync::Arc;

use async_trait::async_trait;
use keygate_types::{CallerIdentity, ResolveResult};
use serde_json::json;
use tracing::debug;

use crate::audit::AuditLog;
use crate::secrets::SecretClient;

/// Child tool names the resolver routes through the MCP subprocess.
const SOPS_TOOL: &str = "juggler_keys_sops_export";
const KDBX_TOOL: &str = "juggler_keys_resolve";

/// The slice of the MCP proxy the resolver consumes: a single tool call
/// against the child subprocess.
#[async_trait]
pub trait ChildToolCaller: Send + Sync {
    async fn call_tool(&self, name: &str, args: serde_json::Value) -> Result<String, String>;
}

/// Composite lookup over heterogeneous secret backends with short-circuit
/// semantics. Every resolve emits exactly one audit entry.
pub struct Resolver {
    default_precedence: Vec<String>,
    child: Option<Arc<dyn ChildToolCaller>>,
    setec: Option<Arc<SecretClient>>,
    audit: Arc<AuditLog>,
}

impl Resolver {
    pub fn new(
        default_precedence: Vec<String>,
        child: Option<Arc<dyn ChildToolCaller>>,
        setec: Option<Arc<SecretClient>>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            default_precedence,
            child,
            setec,
            audit,
        }
    }

    /// Resolve `query` against `sources` in order, falling back to the
    /// configured default precedence when `sources` is empty. The first
    /// source returning a non-empty value with no error wins.
    pub async fn resolve(
        &self,
        caller: &CallerIdentity,
        query: &str,
        sources: &[String],
    ) -> ResolveResult {
        let order: &[String] = if sources.is_empty() {
            &self.default_precedence
        } else {
            sources
        };

        let mut result = ResolveResult::default();

        for name in order {
            result.sources_checked.push(name.clone());
            match self.try_source(name, query).await {
                Ok(Some((value, cached))) => {
                    result.value = value;
                    result.source = name.clone();
                    result.cached = cached;
                    self.audit.log_access(
                        caller,
                        "resolve_composite",
                        query,
                        &result.source,
                        true,
                        None,
                        None,
                    );
                    return result;
                }
                Ok(None) => debug!(source = %name, query = %query, "Source had no value"),
                Err(e) => debug!(source = %name, query = %query, error = %e, "Source failed"),
            }
        }

        let error = format!("secret {query:?} not found in any source");
        self.audit.log_access(
            caller,
            "resolve_composite",
            query,
            "",
            false,
            Some(error.clone()),
            None,
        );
        result.error = Some(error);
        result
    }

    /// Dispatch one source by name. `Ok(None)` is a miss; `Err` is a source
    /// failure. Both continue the precedence walk.
    async fn try_source(&self, name: &str, query: &str) -> Result<Option<(String, bool)>, String> {
        match name {
            "env" => Ok(std::env::var(query)
                .ok()
                .filter(|v| !v.is_empty())
                .map(|v| (v, false))),
            "sops" => self.call_child(SOPS_TOOL, query).await,
            "kdbx" => self.call_child(KDBX_TOOL, query).await,
            "setec" => {
                let setec = self
                    .setec
                    .as_ref()
                    .ok_or_else(|| "secret store not configured".to_string())?;
                let (value, cached) = setec.get(query).await.map_err(|e| e.to_string())?;
                Ok(if value.is_empty() {
                    None
                } else {
                    Some((value, cached))
                })
            }
            other => Err(format!("unknown source: {other}")),
        }
    }

    async fn call_child(&self, tool: &str, query: &str) -> Result<Option<(String, bool)>, String> {
        let child = self
            .child
            .as_ref()
            .ok_or_else(|| "subprocess unavailable".to_string())?;
        let value = child.call_tool(tool, json!({"name": query})).await?;
        Ok(if value.is_empty() {
            None
        } else {
            Some((value, false))
        })
    }
}
