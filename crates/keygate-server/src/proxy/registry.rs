// crates/keygate-server/src/proxy/registry.rs
// Static catalogue of gateway-native tool descriptors

use serde_json::{Value, json};

/// Catalogue of the tools the gateway services locally.
///
/// The descriptor list is fixed at startup. Two operations exist: append the
/// descriptors to a child `tools/list` result, and synthesize a standalone
/// `tools/list` response for when the child is unreachable.
pub struct ToolRegistry {
    tools: Vec<Value>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: build_descriptors(),
        }
    }

    pub fn tools(&self) -> &[Value] {
        &self.tools
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Whether `name` is a gateway-native tool.
    pub fn contains(&self, name: &str) -> bool {
        self.tools
            .iter()
            .any(|t| t.get("name").and_then(Value::as_str) == Some(name))
    }

    /// Append the gateway tools to a `tools/list` response envelope,
    /// preserving the rest of it. Anything that does not look like a
    /// `tools/list` result passes through unchanged: degradation over
    /// corruption.
    pub fn inject(&self, mut envelope: Value) -> Value {
        let tools = match envelope
            .get_mut("result")
            .and_then(|r| r.get_mut("tools"))
            .and_then(Value::as_array_mut)
        {
            Some(tools) => tools,
            None => return envelope,
        };
        tools.extend(self.tools.iter().cloned());
        envelope
    }

    /// A gateway-only `tools/list` response carrying the request's id.
    pub fn standalone_response(&self, id: Value) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {"tools": self.tools},
        })
    }
}

fn tool(name: &str, description: &str, schema: Value) -> Value {
    json!({"name": name, "description": description, "inputSchema": schema})
}

fn build_descriptors() -> Vec<Value> {
    let no_args = || json!({"type": "object", "properties": {}});

    vec![
        tool(
            "keygate_resolve",
            "Resolve a secret through the composite precedence chain (env, sops, kdbx, setec)",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Secret name to resolve"},
                    "sources": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Override the configured source precedence",
                    },
                },
                "required": ["query"],
            }),
        ),
        tool(
            "setec_list",
            "List secret names known to the secret store",
            no_args(),
        ),
        tool(
            "setec_get",
            "Fetch one secret value from the secret store",
            json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string"},
                },
                "required": ["name"],
            }),
        ),
        tool(
            "setec_put",
            "Store a secret value in the secret store",
            json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string"},
                    "value": {"type": "string"},
                },
                "required": ["name", "value"],
            }),
        ),
        tool(
            "audit_query",
            "Return recent credential-access audit entries",
            json!({
                "type": "object",
                "properties": {
                    "limit": {"type": "integer", "description": "Max entries, default 50"},
                },
            }),
        ),
        tool(
            "campaign_trigger",
            "Trigger a campaign run on the campaign runner",
            json!({
                "type": "object",
                "properties": {
                    "campaign_id": {"type": "string"},
                },
                "required": ["campaign_id"],
            }),
        ),
        tool("campaign_list", "List campaigns on the campaign runner", no_args()),
        tool(
            "campaign_status",
            "Fetch the status of one campaign",
            json!({
                "type": "object",
                "properties": {
                    "campaign_id": {"type": "string"},
                },
                "required": ["campaign_id"],
            }),
        ),
        tool(
            "llm_usage",
            "Summarize LLM usage by agent and campaign",
            json!({
                "type": "object",
                "properties": {
                    "agent": {"type": "string"},
                    "campaign_id": {"type": "string"},
                },
            }),
        ),
        tool(
            "github_fetch",
            "Fetch a GitHub REST resource by path",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "e.g. repos/{owner}/{repo}/pulls"},
                },
                "required": ["path"],
            }),
        ),
        tool(
            "github_list_alerts",
            "List open Dependabot alerts for a repository",
            json!({
                "type": "object",
                "properties": {
                    "owner": {"type": "string"},
                    "repo": {"type": "string"},
                },
                "required": ["owner", "repo"],
            }),
        ),
        tool(
            "github_get_alert",
            "Fetch one Dependabot alert",
            json!({
                "type": "object",
                "properties": {
                    "owner": {"type": "string"},
                    "repo": {"type": "string"},
                    "number": {"type": "integer"},
                },
                "required": ["owner", "repo", "number"],
            }),
        ),
        tool(
            "github_create_branch",
            "Create a branch from a base ref",
            json!({
                "type": "object",
                "properties": {
                    "owner": {"type": "string"},
                    "repo": {"type": "string"},
                    "branch": {"type": "string"},
                    "from": {"type": "string", "description": "Base branch, default the repo default"},
                },
                "required": ["owner", "repo", "branch"],
            }),
        ),
        tool(
            "github_update_file",
            "Create or replace one file on a branch",
            json!({
                "type": "object",
                "properties": {
                    "owner": {"type": "string"},
                    "repo": {"type": "string"},
                    "branch": {"type": "string"},
                    "path": {"type": "string"},
                    "content": {"type": "string"},
                    "message": {"type": "string"},
                },
                "required": ["owner", "repo", "branch", "path", "content", "message"],
            }),
        ),
        tool(
            "github_patch_file",
            "Apply a find/replace edit to one file on a branch",
            json!({
                "type": "object",
                "properties": {
                    "owner": {"type": "string"},
                    "repo": {"type": "string"},
                    "branch": {"type": "string"},
                    "path": {"type": "string"},
                    "find": {"type": "string"},
                    "replace": {"type": "string"},
                    "message": {"type": "string"},
                },
                "required": ["owner", "repo", "branch", "path", "find", "replace", "message"],
            }),
        ),
        tool(
            "github_create_pr",
            "Open a pull request",
            json!({
                "type": "object",
                "properties": {
                    "owner": {"type": "string"},
                    "repo": {"type": "string"},
                    "title": {"type": "string"},
                    "head": {"type": "string"},
                    "base": {"type": "string"},
                    "body": {"type": "string"},
                },
                "required": ["owner", "repo", "title", "head", "base"],
            }),
        ),
        tool(
            "github_create_issue",
            "Open an issue",
            json!({
                "type": "object",
                "properties": {
                    "owner": {"type": "string"},
                    "repo": {"type": "string"},
                    "title": {"type": "string"},
                    "body": {"type": "string"},
                },
                "required": ["owner", "repo", "title"],
            }),
        ),
        tool(
            "discussion_list",
            "List discussions in a repository",
            json!({
                "type": "object",
                "properties": {
                    "owner": {"type": "string"},
                    "repo": {"type": "string"},
                    "limit": {"type": "integer"},
                },
                "required": ["owner", "repo"],
            }),
        ),
        tool(
            "discussion_get",
            "Fetch one discussion with its comments",
            json!({
                "type": "object",
                "properties": {
                    "owner": {"type": "string"},
                    "repo": {"type": "string"},
                    "number": {"type": "integer"},
                },
                "required": ["owner", "repo", "number"],
            }),
        ),
        tool(
            "discussion_search",
            "Search discussions by text",
            json!({
                "type": "object",
                "properties": {
                    "owner": {"type": "string"},
                    "repo": {"type": "string"},
                    "query": {"type": "string"},
                },
                "required": ["owner", "repo", "query"],
            }),
        ),
        tool(
            "discussion_reply",
            "Add a comment to a discussion",
            json!({
                "type": "object",
                "properties": {
                    "owner": {"type": "string"},
                    "repo": {"type": "string"},
                    "number": {"type": "integer"},
                    "body": {"type": "string"},
                },
                "required": ["owner", "repo", "number", "body"],
            }),
        ),
        tool(
            "discussion_label",
            "Add a label to a discussion",
            json!({
                "type": "object",
                "properties": {
                    "owner": {"type": "string"},
                    "repo": {"type": "string"},
                    "number": {"type": "integer"},
                    "label": {"type": "string"},
                },
                "required": ["owner", "repo", "number", "label"],
            }),
        ),
        tool(
            "secret_request",
            "File a request for a secret the caller is missing; an operator provisions it out of band",
            json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string"},
                    "reason": {"type": "string"},
                },
                "required": ["name"],
            }),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_contains() {
        let reg = ToolRegistry::new();
        assert!(reg.contains("keygate_resolve"));
        assert!(reg.contains("setec_get"));
        assert!(reg.contains("discussion_label"));
        assert!(!reg.contains("tools/list"));
        assert!(!reg.contains(""));
    }

    #[test]
    fn test_descriptors_are_well_formed() {
        let reg = ToolRegistry::new();
        for t in reg.tools() {
            assert!(t["name"].is_string());
            assert!(t["description"].is_string());
            assert_eq!(t["inputSchema"]["type"], "object");
        }
    }

    #[test]
    fn test_inject_appends_to_child_tools() {
        let reg = ToolRegistry::new();
        let envelope = json!({
            "jsonrpc": "2.0",
            "id": 7,
            "result": {
                "tools": [
                    {"name": "child_a", "inputSchema": {"type": "object"}},
                    {"name": "child_b", "inputSchema": {"type": "object"}},
                ],
            },
        });
        let injected = reg.inject(envelope);
        let tools = injected["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 2 + reg.len());
        assert_eq!(tools[0]["name"], "child_a");
        // Envelope fields outside result.tools are preserved
        assert_eq!(injected["id"], 7);
    }

    #[test]
    fn test_inject_passes_through_non_tool_responses() {
        let reg = ToolRegistry::new();
        let envelope = json!({"jsonrpc": "2.0", "id": 1, "result": {"ok": true}});
        assert_eq!(reg.inject(envelope.clone()), envelope);

        let error = json!({"jsonrpc": "2.0", "id": 2, "error": {"code": -32000}});
        assert_eq!(reg.inject(error.clone()), error);
    }

    #[test]
    fn test_standalone_response_preserves_id() {
        let reg = ToolRegistry::new();
        let resp = reg.standalone_response(json!("req-9"));
        assert_eq!(resp["id"], "req-9");
        assert_eq!(
            resp["result"]["tools"].as_array().unwrap().len(),
            reg.len()
        );
    }
}
