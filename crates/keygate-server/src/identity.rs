// crates/keygate-server/src/identity.rs
// Caller identity extraction for per-request audit attribution

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;

use keygate_types::CallerIdentity;

/// Identity-platform headers set by the tailnet ingress.
const HDR_LOGIN: &str = "tailscale-user-login";
const HDR_NAME: &str = "tailscale-user-name";
const HDR_NODE: &str = "tailscale-node";
const HDR_CAPS: &str = "tailscale-caps";

/// Fallback header for in-cluster callers that bypass the tailnet ingress.
const HDR_AGENT: &str = "x-agent-identity";

/// Build a caller identity from request metadata using the fallback chain:
/// 1. Identity-platform headers (tailnet ingress)
/// 2. `X-Agent-Identity` (in-cluster callers)
/// 3. Remote address
pub fn extract_identity(headers: &HeaderMap, remote: Option<SocketAddr>) -> CallerIdentity {
    let header = |name: &str| -> String {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .trim()
            .to_string()
    };

    let login = header(HDR_LOGIN);
    if !login.is_empty() {
        let capabilities = header(HDR_CAPS)
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        return CallerIdentity {
            node: header(HDR_NODE),
            user: header(HDR_NAME),
            login,
            capabilities,
            tailnet_ip: remote.map(|a| a.ip().to_string()).unwrap_or_default(),
        };
    }

    let agent = header(HDR_AGENT);
    if !agent.is_empty() {
        return CallerIdentity {
            node: "in-cluster".to_string(),
            user: agent.clone(),
            login: agent,
            capabilities: Vec::new(),
            tailnet_ip: remote.map(|a| a.ip().to_string()).unwrap_or_default(),
        };
    }

    match remote {
        Some(addr) => CallerIdentity {
            login: addr.ip().to_string(),
            tailnet_ip: addr.ip().to_string(),
            ..Default::default()
        },
        None => CallerIdentity::anonymous(),
    }
}

/// Axum middleware: resolve the caller identity once and stash it in request
/// extensions for every downstream handler.
pub async fn identity_middleware(mut req: Request, next: Next) -> Response {
    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0);
    let identity = extract_identity(req.headers(), remote);
    req.extensions_mut().insert(identity);
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn addr() -> SocketAddr {
        "100.64.0.7:55012".parse().unwrap()
    }

    #[test]
    fn test_tailnet_headers_primary() {
        let mut headers = HeaderMap::new();
        headers.insert(HDR_LOGIN, HeaderValue::from_static("alice@example.com"));
        headers.insert(HDR_NAME, HeaderValue::from_static("Alice"));
        headers.insert(HDR_NODE, HeaderValue::from_static("alice-laptop"));
        headers.insert(HDR_CAPS, HeaderValue::from_static("secrets:read, audit:read"));
        headers.insert(HDR_AGENT, HeaderValue::from_static("ignored"));

        let id = extract_identity(&headers, Some(addr()));
        assert_eq!(id.login, "alice@example.com");
        assert_eq!(id.user, "Alice");
        assert_eq!(id.node, "alice-laptop");
        assert_eq!(id.capabilities, vec!["secrets:read", "audit:read"]);
        assert_eq!(id.tailnet_ip, "100.64.0.7");
    }

    #[test]
    fn test_agent_header_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert(HDR_AGENT, HeaderValue::from_static("openclaw"));

        let id = extract_identity(&headers, Some(addr()));
        assert_eq!(id.login, "openclaw");
        assert_eq!(id.node, "in-cluster");
        assert!(id.capabilities.is_empty());
    }

    #[test]
    fn test_remote_addr_last_resort() {
        let id = extract_identity(&HeaderMap::new(), Some(addr()));
        assert_eq!(id.login, "100.64.0.7");
        assert_eq!(id.tailnet_ip, "100.64.0.7");
    }

    #[test]
    fn test_anonymous_when_nothing_known() {
        let id = extract_identity(&HeaderMap::new(), None);
        assert_eq!(id.login, "anonymous");
    }
}
