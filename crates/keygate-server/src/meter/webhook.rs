// crates/keygate-server/src/meter/webhook.rs
// Normalizes LLM-usage webhook payloads and feeds the meter store

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use keygate_types::{MeterRecord, NormalizedEvent};
use serde::Deserialize;
use tracing::debug;

use crate::meter::MeterStore;

/// Header carrying the shared webhook secret.
pub const WEBHOOK_SECRET_HEADER: &str = "x-webhook-secret";

/// Forensic ring capacity.
const EVENT_RING_CAPACITY: usize = 500;

/// The rich upstream dialect: a full request report with nested metadata.
/// Recognized iff `metadata.model` is non-empty.
#[derive(Debug, Deserialize)]
struct RichPayload {
    #[serde(default)]
    metadata: RichMetadata,
    #[serde(default)]
    tool_calls: Vec<RichToolCall>,
    #[serde(default)]
    response: RichResponse,
    #[serde(default)]
    duration_ms: u64,
    #[serde(default)]
    error: String,
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
struct RichMetadata {
    #[serde(default)]
    model: String,
    #[serde(default)]
    agent: String,
    #[serde(default)]
    campaign_id: String,
}

#[derive(Debug, Deserialize)]
struct RichToolCall {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct RichResponse {
    #[serde(default)]
    usage: RichUsage,
}

#[derive(Debug, Default, Deserialize)]
struct RichUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// The simple normalized dialect, one object or an array of them.
#[derive(Debug, Deserialize)]
struct SimpleEvent {
    #[serde(rename = "type", default)]
    event_type: String,
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    agent: String,
    #[serde(default)]
    campaign_id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    /// Legacy single-token field; attributed to output tokens because usage
    /// reports historically counted only completion tokens.
    #[serde(default)]
    tokens: u64,
    #[serde(default)]
    duration_ms: u64,
    #[serde(default)]
    error: String,
    #[serde(default)]
    tool_names: Vec<String>,
}

/// Accepts usage webhooks, normalizes both dialects, keeps a bounded
/// forensic ring, and meters `llm_call` events.
pub struct WebhookReceiver {
    secret: String,
    store: Arc<MeterStore>,
    events: Mutex<VecDeque<NormalizedEvent>>,
    accepted_total: AtomicU64,
}

impl WebhookReceiver {
    pub fn new(secret: impl Into<String>, store: Arc<MeterStore>) -> Self {
        Self {
            secret: secret.into(),
            store,
            events: Mutex::new(VecDeque::new()),
            accepted_total: AtomicU64::new(0),
        }
    }

    /// Check the shared-secret header. Always passes when no secret is
    /// configured.
    pub fn authorized(&self, provided: Option<&str>) -> bool {
        self.secret.is_empty() || provided == Some(self.secret.as_str())
    }

    /// Parse one request body and ingest its events. Returns the number of
    /// accepted events, or an error for unrecognized shapes (HTTP 400).
    pub fn ingest(&self, body: &[u8]) -> Result<usize, String> {
        let events = normalize_payload(body)?;
        let mut accepted = 0;
        for event in events {
            if event.event_type.is_empty() {
                debug!("Skipping webhook event with empty type");
                continue;
            }
            if event.event_type == "llm_call" {
                self.store.record(&meter_record(&event));
            }
            let mut ring = self.lock();
            if ring.len() >= EVENT_RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(event);
            accepted += 1;
        }
        self.accepted_total.fetch_add(accepted as u64, Ordering::Relaxed);
        Ok(accepted)
    }

    /// Lifetime count of accepted events.
    pub fn total(&self) -> u64 {
        self.accepted_total.load(Ordering::Relaxed)
    }

    /// The newest `n` events, newest first.
    pub fn recent(&self, n: usize) -> Vec<NormalizedEvent> {
        let ring = self.lock();
        ring.iter().rev().take(n).cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<NormalizedEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Dialect detection: rich first, then array-of-simple, then single simple.
fn normalize_payload(body: &[u8]) -> Result<Vec<NormalizedEvent>, String> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| format!("invalid JSON: {e}"))?;

    if value.is_object() {
        if let Ok(rich) = serde_json::from_value::<RichPayload>(value.clone()) {
            if !rich.metadata.model.is_empty() {
                return Ok(vec![normalize_rich(rich, body)]);
            }
        }
    }

    if let Some(items) = value.as_array() {
        let mut events = Vec::with_capacity(items.len());
        for item in items {
            let simple: SimpleEvent = serde_json::from_value(item.clone())
                .map_err(|e| format!("invalid event in array: {e}"))?;
            events.push(normalize_simple(simple, body));
        }
        return Ok(events);
    }

    if value.is_object() {
        let simple: SimpleEvent =
            serde_json::from_value(value).map_err(|e| format!("invalid event: {e}"))?;
        return Ok(vec![normalize_simple(simple, body)]);
    }

    Err("unrecognized payload shape".to_string())
}

fn normalize_rich(rich: RichPayload, raw: &[u8]) -> NormalizedEvent {
    NormalizedEvent {
        event_type: "llm_call".to_string(),
        timestamp: rich.timestamp.unwrap_or_else(Utc::now),
        agent: rich.metadata.agent,
        campaign_id: rich.metadata.campaign_id,
        model: rich.metadata.model,
        input_tokens: rich.response.usage.prompt_tokens,
        output_tokens: rich.response.usage.completion_tokens,
        duration_ms: rich.duration_ms,
        error: rich.error,
        tool_names: rich
            .tool_calls
            .into_iter()
            .map(|t| t.name)
            .filter(|n| !n.is_empty())
            .collect(),
        raw: raw.to_vec(),
    }
}

fn normalize_simple(simple: SimpleEvent, raw: &[u8]) -> NormalizedEvent {
    let (input_tokens, output_tokens) =
        if simple.input_tokens == 0 && simple.output_tokens == 0 && simple.tokens > 0 {
            (0, simple.tokens)
        } else {
            (simple.input_tokens, simple.output_tokens)
        };
    NormalizedEvent {
        event_type: simple.event_type,
        timestamp: simple.timestamp.unwrap_or_else(Utc::now),
        agent: simple.agent,
        campaign_id: simple.campaign_id,
        model: simple.model,
        input_tokens,
        output_tokens,
        duration_ms: simple.duration_ms,
        error: simple.error,
        tool_names: simple.tool_names,
        raw: raw.to_vec(),
    }
}

fn meter_record(event: &NormalizedEvent) -> MeterRecord {
    MeterRecord {
        agent: event.agent.clone(),
        campaign_id: event.campaign_id.clone(),
        tool_name: format!("llm:{}", event.model),
        request_bytes: 0,
        response_bytes: 0,
        duration_ms: event.duration_ms,
        timestamp: event.timestamp,
        is_error: !event.error.is_empty(),
        input_tokens: event.input_tokens,
        output_tokens: event.output_tokens,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receiver() -> (WebhookReceiver, Arc<MeterStore>) {
        let store = Arc::new(MeterStore::new());
        (WebhookReceiver::new("", store.clone()), store)
    }

    #[test]
    fn test_authorized() {
        let (open, _) = receiver();
        assert!(open.authorized(None));

        let locked = WebhookReceiver::new("s3cret", Arc::new(MeterStore::new()));
        assert!(!locked.authorized(None));
        assert!(!locked.authorized(Some("wrong")));
        assert!(locked.authorized(Some("s3cret")));
    }

    #[test]
    fn test_array_dialect_with_legacy_tokens() {
        let (rx, store) = receiver();
        let body = br#"[
            {"type":"llm_call","agent":"openclaw","campaign_id":"oc-smoketest","model":"m","input_tokens":1200,"output_tokens":350},
            {"type":"llm_call","agent":"openclaw","campaign_id":"oc-smoketest","model":"m","tokens":500}
        ]"#;
        assert_eq!(rx.ingest(body).unwrap(), 2);

        let buckets = store.query("openclaw", "oc-smoketest");
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].input_tokens, 1200);
        assert_eq!(buckets[0].output_tokens, 850);
        assert_eq!(buckets[0].tool_calls, 2);
    }

    #[test]
    fn test_rich_dialect() {
        let (rx, store) = receiver();
        let body = br#"{
            "metadata": {"model": "m", "agent": "openclaw", "campaign_id": "oc-1"},
            "tool_calls": [{"name": "github_fetch"}, {"name": "setec_get"}],
            "response": {"usage": {"prompt_tokens": 90, "completion_tokens": 10}},
            "duration_ms": 420
        }"#;
        assert_eq!(rx.ingest(body).unwrap(), 1);

        let events = rx.recent(1);
        assert_eq!(events[0].event_type, "llm_call");
        assert_eq!(events[0].tool_names, vec!["github_fetch", "setec_get"]);

        let buckets = store.query("openclaw", "oc-1");
        assert_eq!(buckets[0].input_tokens, 90);
        assert_eq!(buckets[0].output_tokens, 10);
        assert_eq!(buckets[0].tool_calls, 1);
    }

    #[test]
    fn test_rich_and_simple_produce_identical_deltas() {
        let (rx_rich, store_rich) = receiver();
        let (rx_simple, store_simple) = receiver();

        rx_rich
            .ingest(br#"{
                "metadata": {"model": "m", "agent": "a", "campaign_id": "c"},
                "response": {"usage": {"prompt_tokens": 7, "completion_tokens": 3}}
            }"#)
            .unwrap();
        rx_simple
            .ingest(br#"{"type":"llm_call","agent":"a","campaign_id":"c","model":"m","input_tokens":7,"output_tokens":3}"#)
            .unwrap();

        let rich = &store_rich.query("a", "c")[0];
        let simple = &store_simple.query("a", "c")[0];
        assert_eq!(rich.input_tokens, simple.input_tokens);
        assert_eq!(rich.output_tokens, simple.output_tokens);
        assert_eq!(rich.tool_calls, simple.tool_calls);
    }

    #[test]
    fn test_empty_type_skipped_and_non_llm_not_metered() {
        let (rx, store) = receiver();
        let body = br#"[
            {"agent":"a"},
            {"type":"rate_limit","agent":"a","campaign_id":"c"}
        ]"#;
        assert_eq!(rx.ingest(body).unwrap(), 1);
        assert!(store.query("", "").is_empty());
        assert_eq!(rx.recent(5).len(), 1);
        assert_eq!(rx.recent(5)[0].event_type, "rate_limit");
    }

    #[test]
    fn test_unrecognized_shape_rejected() {
        let (rx, _) = receiver();
        assert!(rx.ingest(b"42").is_err());
        assert!(rx.ingest(b"not json at all").is_err());
    }

    #[test]
    fn test_ring_capacity_bounded() {
        let (rx, _) = receiver();
        for i in 0..(EVENT_RING_CAPACITY + 10) {
            let body = format!(r#"{{"type":"rate_limit","agent":"a{i}"}}"#);
            rx.ingest(body.as_bytes()).unwrap();
        }
        assert_eq!(rx.recent(usize::MAX).len(), EVENT_RING_CAPACITY);
        assert_eq!(rx.total(), (EVENT_RING_CAPACITY + 10) as u64);
    }
}
