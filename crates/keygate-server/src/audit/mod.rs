// crates/keygate-server/src/audit/mod.rs
// Ring-buffered audit log for credential-access events

pub mod export;

use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use keygate_types::{AuditEntry, CallerIdentity};
use tracing::info;

/// Default ring capacity.
const DEFAULT_CAPACITY: usize = 1000;

struct Inner {
    entries: Vec<AuditEntry>,
    /// Entries evicted from the ring over the process lifetime. The drain
    /// cursor is an absolute position into the lifetime append sequence, so
    /// eviction never invalidates it.
    dropped: u64,
}

/// Append-only recorder of credential-access events.
///
/// The ring holds the most recent entries for the `/audit` endpoint and the
/// `audit_query` tool; long-term history lives in the object-store export.
/// On overflow the oldest 10% are dropped in bulk, which keeps the per-log
/// cost flat under sustained pressure.
pub struct AuditLog {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: Vec::new(),
                dropped: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    /// Record one event. The timestamp is stamped here, not by the caller.
    pub fn log(&self, mut entry: AuditEntry) {
        entry.timestamp = Utc::now();

        info!(
            action = %entry.action,
            query = %entry.query,
            source = %entry.source,
            allowed = entry.allowed,
            caller = %entry.caller.display(),
            "audit"
        );

        let mut inner = self.lock();
        if inner.entries.len() >= self.capacity {
            let drop_count = (self.capacity / 10).max(1);
            inner.entries.drain(..drop_count);
            inner.dropped += drop_count as u64;
        }
        inner.entries.push(entry);
    }

    /// Convenience constructor for the common access-event shape.
    pub fn log_access(
        &self,
        caller: &CallerIdentity,
        action: &str,
        query: &str,
        source: &str,
        allowed: bool,
        reason: Option<String>,
        campaign_id: Option<String>,
    ) {
        self.log(AuditEntry {
            timestamp: Utc::now(),
            caller: caller.clone(),
            action: action.to_string(),
            query: query.to_string(),
            source: source.to_string(),
            allowed,
            reason,
            campaign_id,
        });
    }

    /// The newest `n` entries, newest first.
    pub fn recent(&self, n: usize) -> Vec<AuditEntry> {
        let inner = self.lock();
        inner.entries.iter().rev().take(n).cloned().collect()
    }

    /// All entries from absolute position `since` to the end, plus the new
    /// cursor (the lifetime append count at drain time). Entries already
    /// evicted from the ring are simply gone; the cursor stays additive.
    pub fn drain(&self, since: u64) -> (Vec<AuditEntry>, u64) {
        let inner = self.lock();
        let total = inner.dropped + inner.entries.len() as u64;
        let start = since.saturating_sub(inner.dropped).min(inner.entries.len() as u64) as usize;
        (inner.entries[start..].to_vec(), total)
    }

    /// Current ring size (not the lifetime count).
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(action: &str) -> AuditEntry {
        AuditEntry {
            timestamp: Utc::now(),
            caller: CallerIdentity::anonymous(),
            action: action.to_string(),
            query: "q".to_string(),
            source: "env".to_string(),
            allowed: true,
            reason: None,
            campaign_id: None,
        }
    }

    #[test]
    fn test_recent_newest_first() {
        let log = AuditLog::new(10);
        for i in 0..5 {
            log.log(entry(&format!("a{i}")));
        }
        let recent = log.recent(3);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].action, "a4");
        assert_eq!(recent[2].action, "a2");
        // Strictly non-increasing timestamps
        assert!(recent[0].timestamp >= recent[1].timestamp);
        assert!(recent[1].timestamp >= recent[2].timestamp);
    }

    #[test]
    fn test_overflow_drops_oldest_tenth() {
        let log = AuditLog::new(1000);
        for i in 0..1100 {
            log.log(entry(&format!("a{i}")));
        }
        assert_eq!(log.len(), 1000);
        let newest = &log.recent(1)[0];
        assert_eq!(newest.action, "a1099");
    }

    #[test]
    fn test_drain_cursor_is_additive() {
        let log = AuditLog::new(100);
        for i in 0..5 {
            log.log(entry(&format!("a{i}")));
        }
        let (batch, cursor) = log.drain(0);
        assert_eq!(batch.len(), 5);
        assert_eq!(cursor, 5);

        log.log(entry("a5"));
        let (batch, cursor) = log.drain(cursor);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].action, "a5");
        assert_eq!(cursor, 6);

        // Draining at the tip yields nothing
        let (batch, _) = log.drain(cursor);
        assert!(batch.is_empty());
    }

    #[test]
    fn test_drain_survives_eviction() {
        let log = AuditLog::new(10);
        for i in 0..10 {
            log.log(entry(&format!("a{i}")));
        }
        let (_, cursor) = log.drain(0);
        assert_eq!(cursor, 10);

        // Force an overflow: one entry is appended after the drop
        log.log(entry("a10"));
        let (batch, cursor) = log.drain(cursor);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].action, "a10");
        assert_eq!(cursor, 11);
    }
}
