// crates/keygate-server/src/meter/batch.rs
// Periodic object-store ingest of batched usage exports

use std::sync::Arc;
use std::time::Duration;

use keygate_types::MeterRecord;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::Result;
use crate::meter::MeterStore;
use crate::objectstore::ObjectStoreClient;

/// Polls the export bucket and replays new objects into the meter store.
///
/// Keys are processed in lexicographic order; the last-processed key is the
/// resume point, so each list requests keys strictly after it.
pub struct BatchIngester {
    store: Arc<MeterStore>,
    objects: Arc<ObjectStoreClient>,
    prefix: String,
    interval: Duration,
}

impl BatchIngester {
    pub fn new(
        store: Arc<MeterStore>,
        objects: Arc<ObjectStoreClient>,
        prefix: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            objects,
            prefix: prefix.into(),
            interval,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut last_key = String::new();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.poll_once(&mut last_key).await {
                        Ok(0) => {}
                        Ok(n) => debug!(records = n, "Batch ingest complete"),
                        Err(e) => warn!(error = %e, "Batch ingest failed, will retry next tick"),
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// One list/get cycle. Returns the number of records ingested.
    async fn poll_once(&self, last_key: &mut String) -> Result<usize> {
        let listed = self.objects.list_objects(&self.prefix, last_key).await?;
        let mut ingested = 0;
        for object in listed {
            let bytes = self.objects.get_object(&object.key).await?;
            match parse_export(&bytes) {
                Ok(records) => {
                    for rec in &records {
                        self.store.record(rec);
                    }
                    ingested += records.len();
                }
                // A malformed line aborts the object; the key is still
                // consumed so one bad export cannot wedge the feed.
                Err(e) => warn!(key = %object.key, error = %e, "Malformed export object"),
            }
            *last_key = object.key;
        }
        Ok(ingested)
    }
}

/// Parse one export object: NDJSON (one record per line, blank lines
/// skipped) or a single JSON array. Any malformed line aborts the object.
fn parse_export(bytes: &[u8]) -> std::result::Result<Vec<MeterRecord>, String> {
    let text = std::str::from_utf8(bytes).map_err(|e| format!("not UTF-8: {e}"))?;
    let trimmed = text.trim_start();

    if trimmed.starts_with('[') {
        return serde_json::from_str::<Vec<MeterRecord>>(trimmed)
            .map_err(|e| format!("bad JSON array: {e}"));
    }

    let mut records = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let rec: MeterRecord = serde_json::from_str(line)
            .map_err(|e| format!("line {}: {e}", lineno + 1))?;
        records.push(rec);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ndjson_with_blank_lines() {
        let body = b"{\"agent\":\"a\",\"tool_name\":\"t\"}\n\n{\"agent\":\"b\",\"tool_name\":\"t\"}\n";
        let records = parse_export(body).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].agent, "a");
        assert_eq!(records[1].agent, "b");
    }

    #[test]
    fn test_parse_json_array() {
        let body = br#"[{"agent":"a","tool_name":"t"},{"agent":"b","tool_name":"t"}]"#;
        let records = parse_export(body).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_malformed_line_aborts_object() {
        let body = b"{\"agent\":\"a\"}\nnot json\n{\"agent\":\"b\"}\n";
        let err = parse_export(body).unwrap_err();
        assert!(err.starts_with("line 2:"));
    }

    #[test]
    fn test_empty_object_is_empty() {
        assert!(parse_export(b"").unwrap().is_empty());
        assert!(parse_export(b"\n\n").unwrap().is_empty());
    }
}
