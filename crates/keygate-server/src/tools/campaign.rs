// crates/keygate-server/src/tools/campaign.rs
// Client for the campaign-runner service

use serde_json::Value;

/// Narrow client over the campaign runner's HTTP API: trigger a run, list
/// campaigns, fetch one campaign's status.
pub struct CampaignClient {
    client: reqwest::Client,
    base_url: String,
}

impl CampaignClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub async fn trigger(&self, campaign_id: &str) -> Result<Value, String> {
        let url = format!("{}/api/campaigns/{}/trigger", self.base_url, campaign_id);
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| format!("campaign trigger failed: {e}"))?;
        parse_response(response, "trigger").await
    }

    pub async fn list(&self) -> Result<Value, String> {
        let url = format!("{}/api/campaigns", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("campaign list failed: {e}"))?;
        parse_response(response, "list").await
    }

    pub async fn status(&self, campaign_id: &str) -> Result<Value, String> {
        let url = format!("{}/api/campaigns/{}", self.base_url, campaign_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("campaign status failed: {e}"))?;
        parse_response(response, "status").await
    }
}

async fn parse_response(response: reqwest::Response, op: &str) -> Result<Value, String> {
    let status = response.status();
    if !status.is_success() {
        return Err(format!("campaign runner {op} returned {status}"));
    }
    response
        .json::<Value>()
        .await
        .map_err(|e| format!("campaign runner {op} body: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = CampaignClient::new(reqwest::Client::new(), "http://runner:8080/");
        assert_eq!(client.base_url, "http://runner:8080");
    }

    #[tokio::test]
    async fn test_unreachable_runner_surfaces_error() {
        let client = CampaignClient::new(reqwest::Client::new(), "http://127.0.0.1:9");
        let err = client.list().await.unwrap_err();
        assert!(err.contains("campaign list failed"));
    }
}
