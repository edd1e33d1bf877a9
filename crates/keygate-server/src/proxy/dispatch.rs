// crates/keygate-server/src/proxy/dispatch.rs
// Local servicing of the gateway-native tool whitelist

use std::sync::Arc;

use keygate_types::CallerIdentity;
use serde_json::{Value, json};

use crate::audit::AuditLog;
use crate::proxy::registry::ToolRegistry;
use crate::secrets::{Resolver, SecretClient};
use crate::tools::{ApertureUsage, CampaignClient, GithubClient};

/// Services `tools/call` requests whose tool is gateway-native, never
/// touching the child subprocess. Tool names dispatch through one closed
/// match; there is no open handler registry.
pub struct LocalDispatcher {
    registry: Arc<ToolRegistry>,
    resolver: Arc<Resolver>,
    setec: Option<Arc<SecretClient>>,
    audit: Arc<AuditLog>,
    campaigns: Option<Arc<CampaignClient>>,
    github: Option<Arc<GithubClient>>,
    usage: Arc<ApertureUsage>,
}

impl LocalDispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        resolver: Arc<Resolver>,
        setec: Option<Arc<SecretClient>>,
        audit: Arc<AuditLog>,
        campaigns: Option<Arc<CampaignClient>>,
        github: Option<Arc<GithubClient>>,
        usage: Arc<ApertureUsage>,
    ) -> Self {
        Self {
            registry,
            resolver,
            setec,
            audit,
            campaigns,
            github,
            usage,
        }
    }

    /// Whether a tool call should be serviced locally instead of forwarded.
    pub fn is_local(&self, tool: &str) -> bool {
        self.registry.contains(tool)
    }

    /// Execute one whitelisted tool. The returned value is an MCP tool
    /// result (`content` array); errors become `isError` results upstream.
    pub async fn dispatch(
        &self,
        caller: &CallerIdentity,
        tool: &str,
        args: &Value,
    ) -> Result<Value, String> {
        match tool {
            "keygate_resolve" => {
                let query = str_arg(args, "query")?;
                let sources = args
                    .get("sources")
                    .and_then(Value::as_array)
                    .map(|a| {
                        a.iter()
                            .filter_map(Value::as_str)
                            .map(String::from)
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                let result = self.resolver.resolve(caller, query, &sources).await;
                json_result(&result)
            }

            "setec_list" => {
                let setec = self.setec()?;
                let result = setec.list().await;
                self.audit_setec(caller, "setec_list", "*", &result);
                let infos = result.map_err(|e| e.to_string())?;
                json_result(&infos)
            }
            "setec_get" => {
                let setec = self.setec()?;
                let name = str_arg(args, "name")?;
                let result = setec.get(name).await;
                self.audit_setec(caller, "setec_get", name, &result);
                let (value, _cached) = result.map_err(|e| e.to_string())?;
                Ok(text_result(value))
            }
            "setec_put" => {
                let setec = self.setec()?;
                let name = str_arg(args, "name")?;
                let value = str_arg(args, "value")?;
                let result = setec.put(name, value).await;
                self.audit_setec(caller, "setec_put", name, &result);
                let version = result.map_err(|e| e.to_string())?;
                json_result(&json!({"name": name, "version": version}))
            }

            "audit_query" => {
                let limit = args
                    .get("limit")
                    .and_then(Value::as_u64)
                    .unwrap_or(50)
                    .min(500) as usize;
                json_result(&self.audit.recent(limit))
            }

            "campaign_trigger" => {
                let campaigns = self.campaigns()?;
                let id = str_arg(args, "campaign_id")?;
                json_result(&campaigns.trigger(id).await?)
            }
            "campaign_list" => {
                let campaigns = self.campaigns()?;
                json_result(&campaigns.list().await?)
            }
            "campaign_status" => {
                let campaigns = self.campaigns()?;
                let id = str_arg(args, "campaign_id")?;
                json_result(&campaigns.status(id).await?)
            }

            "llm_usage" => {
                let agent = opt_str_arg(args, "agent");
                let campaign = opt_str_arg(args, "campaign_id");
                json_result(&self.usage.summary(agent, campaign).await?)
            }

            "github_fetch" => {
                let gh = self.github()?;
                json_result(&gh.fetch(str_arg(args, "path")?).await?)
            }
            "github_list_alerts" => {
                let gh = self.github()?;
                json_result(
                    &gh.list_alerts(str_arg(args, "owner")?, str_arg(args, "repo")?)
                        .await?,
                )
            }
            "github_get_alert" => {
                let gh = self.github()?;
                json_result(
                    &gh.get_alert(
                        str_arg(args, "owner")?,
                        str_arg(args, "repo")?,
                        u64_arg(args, "number")?,
                    )
                    .await?,
                )
            }
            "github_create_branch" => {
                let gh = self.github()?;
                json_result(
                    &gh.create_branch(
                        str_arg(args, "owner")?,
                        str_arg(args, "repo")?,
                        str_arg(args, "branch")?,
                        args.get("from").and_then(Value::as_str),
                    )
                    .await?,
                )
            }
            "github_update_file" => {
                let gh = self.github()?;
                json_result(
                    &gh.update_file(
                        str_arg(args, "owner")?,
                        str_arg(args, "repo")?,
                        str_arg(args, "branch")?,
                        str_arg(args, "path")?,
                        str_arg(args, "content")?,
                        str_arg(args, "message")?,
                    )
                    .await?,
                )
            }
            "github_patch_file" => {
                let gh = self.github()?;
                json_result(
                    &gh.patch_file(
                        str_arg(args, "owner")?,
                        str_arg(args, "repo")?,
                        str_arg(args, "branch")?,
                        str_arg(args, "path")?,
                        str_arg(args, "find")?,
                        str_arg(args, "replace")?,
                        str_arg(args, "message")?,
                    )
                    .await?,
                )
            }
            "github_create_pr" => {
                let gh = self.github()?;
                json_result(
                    &gh.create_pr(
                        str_arg(args, "owner")?,
                        str_arg(args, "repo")?,
                        str_arg(args, "title")?,
                        str_arg(args, "head")?,
                        str_arg(args, "base")?,
                        opt_str_arg(args, "body"),
                    )
                    .await?,
                )
            }
            "github_create_issue" => {
                let gh = self.github()?;
                json_result(
                    &gh.create_issue(
                        str_arg(args, "owner")?,
                        str_arg(args, "repo")?,
                        str_arg(args, "title")?,
                        opt_str_arg(args, "body"),
                    )
                    .await?,
                )
            }

            "discussion_list" => {
                let gh = self.github()?;
                let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(20);
                json_result(
                    &gh.discussion_list(str_arg(args, "owner")?, str_arg(args, "repo")?, limit)
                        .await?,
                )
            }
            "discussion_get" => {
                let gh = self.github()?;
                json_result(
                    &gh.discussion_get(
                        str_arg(args, "owner")?,
                        str_arg(args, "repo")?,
                        u64_arg(args, "number")?,
                    )
                    .await?,
                )
            }
            "discussion_search" => {
                let gh = self.github()?;
                json_result(
                    &gh.discussion_search(
                        str_arg(args, "owner")?,
                        str_arg(args, "repo")?,
                        str_arg(args, "query")?,
                    )
                    .await?,
                )
            }
            "discussion_reply" => {
                let gh = self.github()?;
                json_result(
                    &gh.discussion_reply(
                        str_arg(args, "owner")?,
                        str_arg(args, "repo")?,
                        u64_arg(args, "number")?,
                        str_arg(args, "body")?,
                    )
                    .await?,
                )
            }
            "discussion_label" => {
                let gh = self.github()?;
                json_result(
                    &gh.discussion_label(
                        str_arg(args, "owner")?,
                        str_arg(args, "repo")?,
                        u64_arg(args, "number")?,
                        str_arg(args, "label")?,
                    )
                    .await?,
                )
            }

            "secret_request" => {
                let name = str_arg(args, "name")?;
                let reason = opt_str_arg(args, "reason");
                self.audit.log_access(
                    caller,
                    "secret_request",
                    name,
                    "",
                    true,
                    if reason.is_empty() {
                        None
                    } else {
                        Some(reason.to_string())
                    },
                    None,
                );
                Ok(text_result(format!(
                    "Secret request for {name:?} recorded; an operator will provision it out of band."
                )))
            }

            other => Err(format!("unknown tool: {other}")),
        }
    }

    fn setec(&self) -> Result<&Arc<SecretClient>, String> {
        self.setec
            .as_ref()
            .ok_or_else(|| "secret store not configured".to_string())
    }

    fn campaigns(&self) -> Result<&Arc<CampaignClient>, String> {
        self.campaigns
            .as_ref()
            .ok_or_else(|| "campaign runner not configured".to_string())
    }

    fn github(&self) -> Result<&Arc<GithubClient>, String> {
        self.github
            .as_ref()
            .ok_or_else(|| "github access not configured".to_string())
    }

    /// One audit entry per secret-store access, success or failure.
    fn audit_setec<T, E: ToString>(
        &self,
        caller: &CallerIdentity,
        action: &str,
        name: &str,
        result: &Result<T, E>,
    ) {
        let (allowed, reason) = match result {
            Ok(_) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        };
        self.audit
            .log_access(caller, action, name, "setec", allowed, reason, None);
    }
}

/// Build an MCP text result.
pub fn text_result(text: impl Into<String>) -> Value {
    json!({"content": [{"type": "text", "text": text.into()}]})
}

/// Build an MCP text result carrying pretty-printed JSON.
fn json_result<T: serde::Serialize>(value: &T) -> Result<Value, String> {
    let text = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    Ok(text_result(text))
}

fn str_arg<'a>(args: &'a Value, name: &str) -> Result<&'a str, String> {
    args.get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| format!("missing required argument: {name}"))
}

fn opt_str_arg<'a>(args: &'a Value, name: &str) -> &'a str {
    args.get(name).and_then(Value::as_str).unwrap_or("")
}

fn u64_arg(args: &Value, name: &str) -> Result<u64, String> {
    args.get(name)
        .and_then(Value::as_u64)
        .ok_or_else(|| format!("missing required argument: {name}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meter::MeterStore;

    fn dispatcher() -> (LocalDispatcher, Arc<AuditLog>) {
        let audit = Arc::new(AuditLog::default());
        let registry = Arc::new(ToolRegistry::new());
        let resolver = Arc::new(Resolver::new(
            vec!["env".into()],
            None,
            None,
            audit.clone(),
        ));
        let usage = Arc::new(ApertureUsage::new(reqwest::Client::new(), None, None));
        (
            LocalDispatcher::new(registry, resolver, None, audit.clone(), None, None, usage),
            audit,
        )
    }

    fn text_of(result: &Value) -> &str {
        result["content"][0]["text"].as_str().unwrap()
    }

    #[test]
    fn test_is_local_tracks_registry() {
        let (d, _) = dispatcher();
        assert!(d.is_local("keygate_resolve"));
        assert!(d.is_local("github_create_pr"));
        assert!(!d.is_local("some_child_tool"));
    }

    #[tokio::test]
    async fn test_resolve_tool_round_trip() {
        unsafe {
            std::env::set_var("KEYGATE_DISPATCH_TEST", "v");
        }
        let (d, _) = dispatcher();
        let result = d
            .dispatch(
                &CallerIdentity::anonymous(),
                "keygate_resolve",
                &json!({"query": "KEYGATE_DISPATCH_TEST"}),
            )
            .await
            .unwrap();
        unsafe {
            std::env::remove_var("KEYGATE_DISPATCH_TEST");
        }
        let parsed: Value = serde_json::from_str(text_of(&result)).unwrap();
        assert_eq!(parsed["value"], "v");
        assert_eq!(parsed["source"], "env");
    }

    #[tokio::test]
    async fn test_missing_argument_is_caller_error() {
        let (d, _) = dispatcher();
        let err = d
            .dispatch(&CallerIdentity::anonymous(), "keygate_resolve", &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, "missing required argument: query");
    }

    #[tokio::test]
    async fn test_unconfigured_backends_error() {
        let (d, _) = dispatcher();
        let caller = CallerIdentity::anonymous();
        assert!(
            d.dispatch(&caller, "setec_get", &json!({"name": "n"}))
                .await
                .unwrap_err()
                .contains("secret store not configured")
        );
        assert!(
            d.dispatch(&caller, "campaign_list", &json!({}))
                .await
                .unwrap_err()
                .contains("campaign runner not configured")
        );
        assert!(
            d.dispatch(&caller, "github_fetch", &json!({"path": "p"}))
                .await
                .unwrap_err()
                .contains("github access not configured")
        );
    }

    #[tokio::test]
    async fn test_audit_query_returns_recent() {
        let (d, audit) = dispatcher();
        let caller = CallerIdentity::anonymous();
        audit.log_access(&caller, "setec_get", "q", "setec", true, None, None);

        let result = d
            .dispatch(&caller, "audit_query", &json!({"limit": 10}))
            .await
            .unwrap();
        let entries: Vec<Value> = serde_json::from_str(text_of(&result)).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["action"], "setec_get");
    }

    #[tokio::test]
    async fn test_secret_request_audited() {
        let (d, audit) = dispatcher();
        let caller = CallerIdentity::anonymous();
        let result = d
            .dispatch(
                &caller,
                "secret_request",
                &json!({"name": "prod-db", "reason": "campaign oc-1"}),
            )
            .await
            .unwrap();
        assert!(text_of(&result).contains("prod-db"));

        let entry = &audit.recent(1)[0];
        assert_eq!(entry.action, "secret_request");
        assert_eq!(entry.query, "prod-db");
        assert_eq!(entry.reason.as_deref(), Some("campaign oc-1"));
    }

    #[tokio::test]
    async fn test_llm_usage_without_sources() {
        let (d, _) = dispatcher();
        let result = d
            .dispatch(&CallerIdentity::anonymous(), "llm_usage", &json!({}))
            .await
            .unwrap();
        let parsed: Value = serde_json::from_str(text_of(&result)).unwrap();
        assert_eq!(parsed["source"], "none");
    }

    #[tokio::test]
    async fn test_llm_usage_with_meter() {
        let audit = Arc::new(AuditLog::default());
        let registry = Arc::new(ToolRegistry::new());
        let resolver = Arc::new(Resolver::new(vec![], None, None, audit.clone()));
        let store = Arc::new(MeterStore::new());
        store.record(&keygate_types::MeterRecord {
            agent: "a".into(),
            campaign_id: "c".into(),
            tool_name: "llm:m".into(),
            input_tokens: 9,
            ..Default::default()
        });
        let usage = Arc::new(ApertureUsage::new(
            reqwest::Client::new(),
            None,
            Some(store),
        ));
        let d = LocalDispatcher::new(registry, resolver, None, audit, None, None, usage);

        let result = d
            .dispatch(
                &CallerIdentity::anonymous(),
                "llm_usage",
                &json!({"agent": "a"}),
            )
            .await
            .unwrap();
        let parsed: Value = serde_json::from_str(text_of(&result)).unwrap();
        assert_eq!(parsed["source"], "meter");
        assert_eq!(parsed["total_calls"], 1);
        assert_eq!(parsed["input_tokens"], 9);
    }
}
