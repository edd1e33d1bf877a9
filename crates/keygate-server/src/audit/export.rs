// crates/keygate-server/src/audit/export.rs
// Periodic incremental export of the audit ring to the object store

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::audit::AuditLog;
use crate::error::Result;
use crate::objectstore::ObjectStoreClient;

/// Drains new audit entries on an interval and writes them as NDJSON
/// objects. The drain cursor only advances on a successful PUT, so a failed
/// export is retried with the same entries on the next tick.
pub struct AuditExporter {
    log: Arc<AuditLog>,
    objects: Arc<ObjectStoreClient>,
    prefix: String,
    interval: Duration,
}

impl AuditExporter {
    pub fn new(
        log: Arc<AuditLog>,
        objects: Arc<ObjectStoreClient>,
        prefix: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            log,
            objects,
            prefix: prefix.into(),
            interval,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut cursor: u64 = 0;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.export_once(&mut cursor).await {
                        Ok(0) => {}
                        Ok(n) => debug!(entries = n, "Audit export complete"),
                        Err(e) => warn!(error = %e, "Audit export failed, cursor unchanged"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        // Final export on an independent, bounded deadline.
        match tokio::time::timeout(Duration::from_secs(10), self.export_once(&mut cursor)).await {
            Ok(Ok(n)) if n > 0 => info!(entries = n, "Final audit export complete"),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "Final audit export failed"),
            Err(_) => warn!("Final audit export timed out"),
        }
    }

    /// Export entries past `cursor`, advancing it only on success.
    async fn export_once(&self, cursor: &mut u64) -> Result<usize> {
        let (entries, next) = self.log.drain(*cursor);
        if entries.is_empty() {
            return Ok(0);
        }

        let mut body = Vec::with_capacity(entries.len() * 256);
        for entry in &entries {
            serde_json::to_writer(&mut body, entry)?;
            body.push(b'\n');
        }

        let key = export_key(&self.prefix, Utc::now());
        self.objects
            .put_object(&key, body, "application/x-ndjson")
            .await?;
        *cursor = next;
        Ok(entries.len())
    }
}

/// `{prefix}{YYYY-MM-DD}/audit-{YYYYMMDDTHHMMSSZ}.ndjson`
fn export_key(prefix: &str, now: DateTime<Utc>) -> String {
    format!(
        "{}{}/audit-{}.ndjson",
        prefix,
        now.format("%Y-%m-%d"),
        now.format("%Y%m%dT%H%M%SZ")
    )
}
