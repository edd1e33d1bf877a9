// crates/keygate-server/src/meter/mod.rs
// Concurrent aggregation of usage records into (agent, campaign) buckets

pub mod batch;
pub mod sse;
pub mod webhook;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use keygate_types::{MeterBucket, MeterRecord};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Agent name used in bucket keys when the record carries none.
pub const UNKNOWN_AGENT: &str = "unknown";

/// Destination for flushed bucket snapshots.
#[async_trait]
pub trait MeterSink: Send + Sync {
    async fn flush(&self, buckets: &[MeterBucket]) -> Result<(), String>;
}

fn normalize_agent(agent: &str) -> &str {
    if agent.is_empty() { UNKNOWN_AGENT } else { agent }
}

/// Bucket map key. Empty agent normalizes to `"unknown"`; empty campaign is
/// allowed and keeps its empty segment.
pub fn bucket_key(agent: &str, campaign_id: &str) -> String {
    format!("{}:{}", normalize_agent(agent), campaign_id)
}

struct Inner {
    buckets: HashMap<String, MeterBucket>,
    sink: Option<Arc<dyn MeterSink>>,
}

/// Thread-safe aggregator over the three ingest feeds.
///
/// The store exclusively owns its bucket map; all state leaves through deep
/// copies. `flush` hands a snapshot to the configured sink and restores it
/// on sink failure, so no record is lost short of process death.
pub struct MeterStore {
    inner: Mutex<Inner>,
}

impl Default for MeterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MeterStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                buckets: HashMap::new(),
                sink: None,
            }),
        }
    }

    pub fn set_sink(&self, sink: Arc<dyn MeterSink>) {
        self.lock().sink = Some(sink);
    }

    /// Fold one record into its bucket. Safe under unbounded concurrency.
    pub fn record(&self, rec: &MeterRecord) {
        let key = bucket_key(&rec.agent, &rec.campaign_id);
        let mut inner = self.lock();
        let bucket = inner.buckets.entry(key).or_insert_with(|| MeterBucket {
            // The un-normalized agent is preserved in the bucket fields.
            agent: rec.agent.clone(),
            campaign_id: rec.campaign_id.clone(),
            first_seen: rec.timestamp,
            last_seen: rec.timestamp,
            ..Default::default()
        });
        bucket.absorb(rec);
    }

    /// Deep-copied buckets matching the filter. Empty strings mean "no
    /// filter on that dimension"; agent filters match the normalized name.
    pub fn query(&self, agent: &str, campaign_id: &str) -> Vec<MeterBucket> {
        let inner = self.lock();
        inner
            .buckets
            .values()
            .filter(|b| agent.is_empty() || normalize_agent(&b.agent) == agent)
            .filter(|b| campaign_id.is_empty() || b.campaign_id == campaign_id)
            .cloned()
            .collect()
    }

    /// Sum of `tool_calls` across all live buckets.
    pub fn total_calls(&self) -> u64 {
        self.lock().buckets.values().map(|b| b.tool_calls).sum()
    }

    /// Hand the current buckets to the sink and reset them.
    ///
    /// The live map is swapped for an empty one under the lock, so records
    /// arriving during the sink call land in the new generation. On sink
    /// failure every snapshot bucket is merged back, summing with whatever
    /// arrived in the meantime. Returns the number of buckets the sink saw.
    pub async fn flush(&self) -> Result<usize, String> {
        let (snapshot, sink) = {
            let mut inner = self.lock();
            let sink = match inner.sink.clone() {
                Some(s) => s,
                None => return Ok(0),
            };
            let map = std::mem::take(&mut inner.buckets);
            (map, sink)
        };

        if snapshot.is_empty() {
            return Ok(0);
        }

        let buckets: Vec<MeterBucket> = snapshot.values().cloned().collect();
        match sink.flush(&buckets).await {
            Ok(()) => {
                debug!(buckets = buckets.len(), "Flushed meter buckets");
                Ok(buckets.len())
            }
            Err(e) => {
                let mut inner = self.lock();
                for (key, bucket) in snapshot {
                    match inner.buckets.get_mut(&key) {
                        Some(live) => live.merge(&bucket),
                        None => {
                            inner.buckets.insert(key, bucket);
                        }
                    }
                }
                Err(e)
            }
        }
    }

    /// Ticker-driven flush until shutdown, then one final flush so shutdown
    /// never discards data.
    pub async fn flush_loop(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.flush().await {
                        error!(error = %e, "Meter flush failed, buckets restored");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        // Final flush on an independent, bounded deadline.
        match tokio::time::timeout(Duration::from_secs(10), self.flush()).await {
            Ok(Ok(n)) if n > 0 => info!(buckets = n, "Final meter flush complete"),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!(error = %e, "Final meter flush failed"),
            Err(_) => error!("Final meter flush timed out"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
