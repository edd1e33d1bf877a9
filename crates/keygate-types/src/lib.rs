// crates/keygate-types/src/lib.rs

//! Shared data contracts between the Keygate server and its clients.
//!
//! This crate provides the core domain model for:
//! - **Audit**: structured credential-access events
//! - **Metering**: per-(agent, campaign) usage records and aggregates
//! - **Resolution**: composite secret lookup results
//! - **Identity**: the caller tuple attached to every audited action
//!
//! These types carry no behavior beyond construction helpers and are safe to
//! serialize across process boundaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ===================================================
// IDENTITY
// ===================================================

/// The authenticated caller tuple extracted from request metadata.
///
/// Built once per request by the identity middleware and never mutated
/// afterwards. Persisted only as part of [`AuditEntry`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallerIdentity {
    /// Node name on the tailnet (or cluster pod name for in-cluster callers).
    #[serde(default)]
    pub node: String,
    /// Display name of the human or agent behind the request.
    #[serde(default)]
    pub user: String,
    /// Login identifier (e.g. `alice@example.com`).
    #[serde(default)]
    pub login: String,
    /// Capability tokens granted to the caller.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Tailnet IP the request arrived from.
    #[serde(default)]
    pub tailnet_ip: String,
}

impl CallerIdentity {
    /// Identity used when no header or address information is available.
    pub fn anonymous() -> Self {
        Self {
            login: "anonymous".to_string(),
            ..Default::default()
        }
    }

    /// Short display form for log lines: login when present, else node.
    pub fn display(&self) -> &str {
        if !self.login.is_empty() {
            &self.login
        } else if !self.node.is_empty() {
            &self.node
        } else {
            "unknown"
        }
    }
}

// ===================================================
// AUDIT
// ===================================================

/// A single credential-access event.
///
/// Entries are append-only; the timestamp is assigned by the audit log at
/// record time, never by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub caller: CallerIdentity,
    /// Short verb, e.g. `resolve_composite` or `setec_get`.
    pub action: String,
    /// The name being looked up. Never the value.
    pub query: String,
    /// Which backend answered, when one did.
    #[serde(default)]
    pub source: String,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
}

// ===================================================
// METERING
// ===================================================

/// One usage event from any of the three ingest feeds.
///
/// `tool_name` is `llm:<model>` for LLM events and a plain tool identifier
/// otherwise.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeterRecord {
    #[serde(default)]
    pub agent: String,
    #[serde(default)]
    pub campaign_id: String,
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub request_bytes: u64,
    #[serde(default)]
    pub response_bytes: u64,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// Aggregated usage for one `(agent, campaign)` pair.
///
/// Counters are monotonic between flushes; a successful flush resets the
/// captured buckets to zero by removing them from the live map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeterBucket {
    pub agent: String,
    pub campaign_id: String,
    pub tool_calls: u64,
    pub request_bytes: u64,
    pub response_bytes: u64,
    pub error_count: u64,
    pub total_duration_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl MeterBucket {
    /// Fold one record into the bucket. `first_seen` is the caller's concern:
    /// it is set on bucket creation and left untouched here.
    pub fn absorb(&mut self, rec: &MeterRecord) {
        self.tool_calls += 1;
        self.request_bytes += rec.request_bytes;
        self.response_bytes += rec.response_bytes;
        self.total_duration_ms += rec.duration_ms;
        self.input_tokens += rec.input_tokens;
        self.output_tokens += rec.output_tokens;
        if rec.is_error {
            self.error_count += 1;
        }
        // Clock skew across ingest sources is tolerated: no monotonicity check.
        self.last_seen = rec.timestamp;
    }

    /// Merge a flushed-back bucket into this one after a failed flush.
    pub fn merge(&mut self, other: &MeterBucket) {
        self.tool_calls += other.tool_calls;
        self.request_bytes += other.request_bytes;
        self.response_bytes += other.response_bytes;
        self.error_count += other.error_count;
        self.total_duration_ms += other.total_duration_ms;
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        if other.first_seen < self.first_seen {
            self.first_seen = other.first_seen;
        }
        if other.last_seen > self.last_seen {
            self.last_seen = other.last_seen;
        }
    }
}

// ===================================================
// WEBHOOK EVENTS
// ===================================================

/// A webhook payload normalized from either ingest dialect.
///
/// `raw` keeps the original payload bytes for forensics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NormalizedEvent {
    /// Event kind, e.g. `llm_call` or `rate_limit`.
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub agent: String,
    #[serde(default)]
    pub campaign_id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub tool_names: Vec<String>,
    #[serde(skip)]
    pub raw: Vec<u8>,
}

// ===================================================
// RESOLUTION
// ===================================================

/// Outcome of a composite secret lookup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolveResult {
    /// The resolved value. Empty when no source answered.
    pub value: String,
    /// The source that answered, or empty on failure.
    pub source: String,
    /// Sources actually queried, in query order.
    pub sources_checked: Vec<String>,
    /// Whether the answering source served from its cache.
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ===================================================
// SECRET STORE
// ===================================================

/// Metadata for one secret known to the store (values never travel here).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedSecretInfo {
    pub name: String,
    pub version: i64,
    pub fetched_at: DateTime<Utc>,
}
