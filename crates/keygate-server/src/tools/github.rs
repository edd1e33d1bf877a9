// crates/keygate-server/src/tools/github.rs
// Thin GitHub REST and GraphQL adapters for the gateway tool surface

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Method;
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use serde_json::{Value, json};

/// Where the GitHub token comes from. The gateway wires this to the
/// composite resolver so every token access is audited like any other
/// credential.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<String, String>;
}

/// Adapters over the GitHub REST and GraphQL APIs.
///
/// Each method is a thin call: build the request, surface the first error as
/// a string, no internal retries.
pub struct GithubClient {
    client: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
    api_base: String,
}

impl GithubClient {
    pub fn new(client: reqwest::Client, tokens: Arc<dyn TokenProvider>) -> Self {
        Self::with_base(client, tokens, "https://api.github.com")
    }

    pub fn with_base(
        client: reqwest::Client,
        tokens: Arc<dyn TokenProvider>,
        api_base: impl Into<String>,
    ) -> Self {
        Self {
            client,
            tokens,
            api_base: api_base.into(),
        }
    }

    /// Fetch an arbitrary REST resource by path.
    pub async fn fetch(&self, path: &str) -> Result<Value, String> {
        self.rest(Method::GET, path, None).await
    }

    pub async fn list_alerts(&self, owner: &str, repo: &str) -> Result<Value, String> {
        self.rest(
            Method::GET,
            &format!("repos/{owner}/{repo}/dependabot/alerts?state=open"),
            None,
        )
        .await
    }

    pub async fn get_alert(&self, owner: &str, repo: &str, number: u64) -> Result<Value, String> {
        self.rest(
            Method::GET,
            &format!("repos/{owner}/{repo}/dependabot/alerts/{number}"),
            None,
        )
        .await
    }

    /// Create `branch` from `from` (or the repository default branch).
    pub async fn create_branch(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        from: Option<&str>,
    ) -> Result<Value, String> {
        let base = match from {
            Some(b) => b.to_string(),
            None => {
                let repo_info = self.rest(Method::GET, &format!("repos/{owner}/{repo}"), None).await?;
                repo_info
                    .get("default_branch")
                    .and_then(Value::as_str)
                    .unwrap_or("main")
                    .to_string()
            }
        };
        let base_ref = self
            .rest(
                Method::GET,
                &format!("repos/{owner}/{repo}/git/ref/heads/{base}"),
                None,
            )
            .await?;
        let sha = base_ref["object"]["sha"]
            .as_str()
            .ok_or_else(|| format!("no sha for base branch {base}"))?
            .to_string();
        self.rest(
            Method::POST,
            &format!("repos/{owner}/{repo}/git/refs"),
            Some(json!({"ref": format!("refs/heads/{branch}"), "sha": sha})),
        )
        .await
    }

    /// Create or replace one file on a branch.
    pub async fn update_file(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        path: &str,
        content: &str,
        message: &str,
    ) -> Result<Value, String> {
        let mut body = json!({
            "message": message,
            "content": BASE64.encode(content.as_bytes()),
            "branch": branch,
        });
        // An existing file needs its blob sha for the replace.
        if let Ok(existing) = self
            .rest(
                Method::GET,
                &format!("repos/{owner}/{repo}/contents/{path}?ref={branch}"),
                None,
            )
            .await
        {
            if let Some(sha) = existing.get("sha").and_then(Value::as_str) {
                body["sha"] = json!(sha);
            }
        }
        self.rest(
            Method::PUT,
            &format!("repos/{owner}/{repo}/contents/{path}"),
            Some(body),
        )
        .await
    }

    /// Apply one find/replace edit to an existing file.
    pub async fn patch_file(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        path: &str,
        find: &str,
        replace: &str,
        message: &str,
    ) -> Result<Value, String> {
        let existing = self
            .rest(
                Method::GET,
                &format!("repos/{owner}/{repo}/contents/{path}?ref={branch}"),
                None,
            )
            .await?;
        let sha = existing["sha"]
            .as_str()
            .ok_or_else(|| format!("no sha for {path}"))?;
        let encoded = existing["content"].as_str().unwrap_or("").replace('\n', "");
        let content = BASE64
            .decode(&encoded)
            .map_err(|e| format!("undecodable content for {path}: {e}"))
            .and_then(|bytes| {
                String::from_utf8(bytes).map_err(|e| format!("non-UTF-8 content for {path}: {e}"))
            })?;
        if !content.contains(find) {
            return Err(format!("pattern not found in {path}"));
        }
        let patched = content.replace(find, replace);
        self.rest(
            Method::PUT,
            &format!("repos/{owner}/{repo}/contents/{path}"),
            Some(json!({
                "message": message,
                "content": BASE64.encode(patched.as_bytes()),
                "branch": branch,
                "sha": sha,
            })),
        )
        .await
    }

    pub async fn create_pr(
        &self,
        owner: &str,
        repo: &str,
        title: &str,
        head: &str,
        base: &str,
        body: &str,
    ) -> Result<Value, String> {
        self.rest(
            Method::POST,
            &format!("repos/{owner}/{repo}/pulls"),
            Some(json!({"title": title, "head": head, "base": base, "body": body})),
        )
        .await
    }

    pub async fn create_issue(
        &self,
        owner: &str,
        repo: &str,
        title: &str,
        body: &str,
    ) -> Result<Value, String> {
        self.rest(
            Method::POST,
            &format!("repos/{owner}/{repo}/issues"),
            Some(json!({"title": title, "body": body})),
        )
        .await
    }

    pub async fn discussion_list(
        &self,
        owner: &str,
        repo: &str,
        limit: u64,
    ) -> Result<Value, String> {
        self.graphql(
            r#"query($owner: String!, $repo: String!, $first: Int!) {
                repository(owner: $owner, name: $repo) {
                    discussions(first: $first, orderBy: {field: UPDATED_AT, direction: DESC}) {
                        nodes { number title category { name } updatedAt author { login } }
                    }
                }
            }"#,
            json!({"owner": owner, "repo": repo, "first": limit.clamp(1, 100)}),
        )
        .await
    }

    pub async fn discussion_get(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<Value, String> {
        self.graphql(
            r#"query($owner: String!, $repo: String!, $number: Int!) {
                repository(owner: $owner, name: $repo) {
                    discussion(number: $number) {
                        number title body author { login }
                        comments(first: 50) { nodes { body author { login } createdAt } }
                    }
                }
            }"#,
            json!({"owner": owner, "repo": repo, "number": number}),
        )
        .await
    }

    pub async fn discussion_search(
        &self,
        owner: &str,
        repo: &str,
        query: &str,
    ) -> Result<Value, String> {
        self.graphql(
            r#"query($q: String!) {
                search(query: $q, type: DISCUSSION, first: 20) {
                    nodes { ... on Discussion { number title repository { nameWithOwner } } }
                }
            }"#,
            json!({"q": format!("repo:{owner}/{repo} {query}")}),
        )
        .await
    }

    pub async fn discussion_reply(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<Value, String> {
        let id = self.discussion_id(owner, repo, number).await?;
        self.graphql(
            r#"mutation($id: ID!, $body: String!) {
                addDiscussionComment(input: {discussionId: $id, body: $body}) {
                    comment { id url }
                }
            }"#,
            json!({"id": id, "body": body}),
        )
        .await
    }

    pub async fn discussion_label(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        label: &str,
    ) -> Result<Value, String> {
        let ids = self
            .graphql(
                r#"query($owner: String!, $repo: String!, $number: Int!, $label: String!) {
                    repository(owner: $owner, name: $repo) {
                        discussion(number: $number) { id }
                        label(name: $label) { id }
                    }
                }"#,
                json!({"owner": owner, "repo": repo, "number": number, "label": label}),
            )
            .await?;
        let discussion_id = ids["repository"]["discussion"]["id"]
            .as_str()
            .ok_or_else(|| format!("discussion {number} not found"))?
            .to_string();
        let label_id = ids["repository"]["label"]["id"]
            .as_str()
            .ok_or_else(|| format!("label {label:?} not found"))?
            .to_string();
        self.graphql(
            r#"mutation($labelable: ID!, $labels: [ID!]!) {
                addLabelsToLabelable(input: {labelableId: $labelable, labelIds: $labels}) {
                    labelable { ... on Discussion { number } }
                }
            }"#,
            json!({"labelable": discussion_id, "labels": [label_id]}),
        )
        .await
    }

    async fn discussion_id(&self, owner: &str, repo: &str, number: u64) -> Result<String, String> {
        let data = self
            .graphql(
                r#"query($owner: String!, $repo: String!, $number: Int!) {
                    repository(owner: $owner, name: $repo) { discussion(number: $number) { id } }
                }"#,
                json!({"owner": owner, "repo": repo, "number": number}),
            )
            .await?;
        data["repository"]["discussion"]["id"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| format!("discussion {number} not found"))
    }

    async fn rest(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, String> {
        let token = self.tokens.token().await?;
        let url = format!("{}/{}", self.api_base, path.trim_start_matches('/'));
        let mut request = self
            .client
            .request(method, &url)
            .header(USER_AGENT, "keygate")
            .header(ACCEPT, "application/vnd.github+json")
            .header(AUTHORIZATION, format!("Bearer {token}"));
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| format!("github request failed: {e}"))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| format!("github body read failed: {e}"))?;
        let value: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        if !status.is_success() {
            let message = value["message"].as_str().unwrap_or("").to_string();
            return Err(format!("github returned {status}: {message}"));
        }
        Ok(value)
    }

    /// One GraphQL round trip; the first reported error surfaces.
    async fn graphql(&self, query: &str, variables: Value) -> Result<Value, String> {
        let token = self.tokens.token().await?;
        let response = self
            .client
            .post(format!("{}/graphql", self.api_base))
            .header(USER_AGENT, "keygate")
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .json(&json!({"query": query, "variables": variables}))
            .send()
            .await
            .map_err(|e| format!("github graphql failed: {e}"))?;
        let status = response.status();
        let value: Value = response
            .json()
            .await
            .map_err(|e| format!("github graphql body: {e}"))?;
        if !status.is_success() {
            return Err(format!("github graphql returned {status}"));
        }
        if let Some(errors) = value.get("errors").and_then(Value::as_array) {
            if let Some(first) = errors.first() {
                return Err(format!(
                    "github graphql error: {}",
                    first["message"].as_str().unwrap_or("unknown")
                ));
            }
        }
        Ok(value["data"].clone())
    }
}
