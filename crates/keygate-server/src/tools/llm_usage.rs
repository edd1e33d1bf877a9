// crates/keygate-server/src/tools/llm_usage.rs
// Combined LLM-usage summary over the remote telemetry plane and the local meter

use std::sync::Arc;

use keygate_types::MeterBucket;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::meter::MeterStore;

/// Aggregate answer for the `llm_usage` tool and the portal.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageSummary {
    pub total_calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// `combined`, `remote`, `meter`, or `none`.
    pub source: String,
    pub buckets: Vec<MeterBucket>,
}

#[derive(Debug, Default, Deserialize)]
struct RemoteUsage {
    #[serde(default)]
    total_calls: u64,
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Usage reader over two backends. With both a remote endpoint and a meter
/// store configured the totals are summed and marked `combined`; with one,
/// that source is reported; with neither, `none`.
pub struct ApertureUsage {
    client: reqwest::Client,
    remote_url: Option<String>,
    meter: Option<Arc<MeterStore>>,
}

impl ApertureUsage {
    pub fn new(
        client: reqwest::Client,
        remote_url: Option<String>,
        meter: Option<Arc<MeterStore>>,
    ) -> Self {
        Self {
            client,
            remote_url: remote_url.filter(|u| !u.is_empty()),
            meter,
        }
    }

    pub async fn summary(&self, agent: &str, campaign_id: &str) -> Result<UsageSummary, String> {
        let mut summary = UsageSummary::default();
        let mut sources: Vec<&str> = Vec::new();

        if let Some(base) = &self.remote_url {
            let remote = self.fetch_remote(base, agent, campaign_id).await?;
            summary.total_calls += remote.total_calls;
            summary.input_tokens += remote.input_tokens;
            summary.output_tokens += remote.output_tokens;
            sources.push("remote");
        }

        if let Some(meter) = &self.meter {
            let buckets = meter.query(agent, campaign_id);
            for b in &buckets {
                summary.total_calls += b.tool_calls;
                summary.input_tokens += b.input_tokens;
                summary.output_tokens += b.output_tokens;
            }
            summary.buckets = buckets;
            sources.push("meter");
        }

        summary.source = match sources.as_slice() {
            ["remote", "meter"] => "combined".to_string(),
            [one] => (*one).to_string(),
            _ => "none".to_string(),
        };
        Ok(summary)
    }

    async fn fetch_remote(
        &self,
        base: &str,
        agent: &str,
        campaign_id: &str,
    ) -> Result<RemoteUsage, String> {
        let url = format!(
            "{}/usage?agent={}&campaign_id={}",
            base.trim_end_matches('/'),
            urlencoding::encode(agent),
            urlencoding::encode(campaign_id),
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("usage endpoint failed: {e}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("usage endpoint returned {status}"));
        }
        let value: Value = response
            .json()
            .await
            .map_err(|e| format!("usage endpoint body: {e}"))?;
        serde_json::from_value(value).map_err(|e| format!("usage endpoint shape: {e}"))
    }
}
