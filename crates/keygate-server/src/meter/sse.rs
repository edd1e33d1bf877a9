// crates/keygate-server/src/meter/sse.rs
// Long-lived server-sent-events consumer for the LLM proxy's metric feed

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use keygate_types::MeterRecord;
use reqwest::header::ACCEPT;
use reqwest_eventsource::{Event, EventSource};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::meter::MeterStore;

/// Consumes the telemetry plane's event stream and meters `metric` frames.
///
/// The loop is connect → scan → on disconnect wait the reconnect interval →
/// retry, forever. The HTTP client handed in here must carry no total
/// request timeout; stream liveness is the reconnect loop's problem.
pub struct SseIngester {
    client: reqwest::Client,
    url: String,
    reconnect: Duration,
    store: Arc<MeterStore>,
}

impl SseIngester {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        reconnect: Duration,
        store: Arc<MeterStore>,
    ) -> Self {
        Self {
            client,
            url: format!("{}/events", base_url.trim_end_matches('/')),
            reconnect,
            store,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = self.consume_stream() => {}
                _ = shutdown.changed() => return,
            }
            tokio::select! {
                _ = tokio::time::sleep(self.reconnect) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    /// One connection attempt: scan frames until the stream errors or ends.
    async fn consume_stream(&self) {
        let request = self
            .client
            .get(&self.url)
            .header(ACCEPT, "text/event-stream");
        let mut stream = match EventSource::new(request) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(url = %self.url, error = %e, "Failed to build SSE request");
                return;
            }
        };

        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Open) => debug!(url = %self.url, "SSE stream open"),
                Ok(Event::Message(msg)) => {
                    ingest_frame(&self.store, &msg.event, &msg.data);
                }
                Err(e) => {
                    warn!(url = %self.url, error = %e, "SSE stream error, will reconnect");
                    stream.close();
                    return;
                }
            }
        }
    }
}

/// Handle one SSE frame. Exactly one record is emitted per successfully
/// parsed `metric` frame; everything else is ignored.
fn ingest_frame(store: &MeterStore, event: &str, data: &str) -> bool {
    if event != "metric" {
        return false;
    }
    match serde_json::from_str::<MeterRecord>(data) {
        Ok(rec) => {
            store.record(&rec);
            true
        }
        Err(e) => {
            warn!(error = %e, "Discarding malformed metric frame");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_frame_emits_one_record() {
        let store = MeterStore::new();
        let recorded = ingest_frame(
            &store,
            "metric",
            r#"{"agent":"a","campaign_id":"c","tool_name":"llm:m","input_tokens":5}"#,
        );
        assert!(recorded);
        let buckets = store.query("a", "c");
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].tool_calls, 1);
        assert_eq!(buckets[0].input_tokens, 5);
    }

    #[test]
    fn test_non_metric_events_ignored() {
        let store = MeterStore::new();
        assert!(!ingest_frame(&store, "heartbeat", "{}"));
        assert!(!ingest_frame(&store, "message", r#"{"agent":"a"}"#));
        assert!(store.query("", "").is_empty());
    }

    #[test]
    fn test_malformed_metric_discarded() {
        let store = MeterStore::new();
        assert!(!ingest_frame(&store, "metric", "{not json"));
        assert!(store.query("", "").is_empty());
    }
}
