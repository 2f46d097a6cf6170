use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Item Record lifecycle states. Transitions are monotonic except for the
/// FAILED -> QUEUED edge taken by the poller's retry sweep.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ItemStatus {
    Queued,
    Processed,
    Failed,
    PermanentlyFailed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Queued => "QUEUED",
            ItemStatus::Processed => "PROCESSED",
            ItemStatus::Failed => "FAILED",
            ItemStatus::PermanentlyFailed => "PERMANENTLY_FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(ItemStatus::Queued),
            "PROCESSED" => Some(ItemStatus::Processed),
            "FAILED" => Some(ItemStatus::Failed),
            "PERMANENTLY_FAILED" => Some(ItemStatus::PermanentlyFailed),
            _ => None,
        }
    }
}

/// Closed taxonomy of failure classes written to the store. Transient
/// failures never appear here; they stay on the queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailureReason {
    ContentUnavailable,
    ContentUnavailableExhausted,
    DependencyMissing,
    SummaryRejected,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::ContentUnavailable => "CONTENT_UNAVAILABLE",
            FailureReason::ContentUnavailableExhausted => "CONTENT_UNAVAILABLE_EXHAUSTED",
            FailureReason::DependencyMissing => "DEPENDENCY_MISSING",
            FailureReason::SummaryRejected => "SUMMARY_REJECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CONTENT_UNAVAILABLE" => Some(FailureReason::ContentUnavailable),
            "CONTENT_UNAVAILABLE_EXHAUSTED" => Some(FailureReason::ContentUnavailableExhausted),
            "DEPENDENCY_MISSING" => Some(FailureReason::DependencyMissing),
            "SUMMARY_REJECTED" => Some(FailureReason::SummaryRejected),
            _ => None,
        }
    }
}

/// Work queue payload, serialized as UTF-8 JSON. Replay-safe: carries only
/// immutable item metadata, so redelivered copies are interchangeable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkItem {
    pub item_id: String,
    pub title: String,
    pub source_label: String,
    pub published_at: DateTime<Utc>,
}

/// One candidate returned by the external listing API.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveredItem {
    pub item_id: String,
    pub title: String,
    pub source_label: String,
    pub published_at: DateTime<Utc>,
}

/// Item Record as stored.
#[derive(Debug, Clone)]
pub struct ItemRecord {
    pub item_id: String,
    pub title: String,
    pub source_id: String,
    pub source_label: String,
    pub published_at: DateTime<Utc>,
    pub status: ItemStatus,
    pub failure_reason: Option<FailureReason>,
    pub last_error: Option<String>,
    pub retry_count: i64,
    pub queued_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub first_failed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Digest-Ready Summary as stored.
#[derive(Debug, Clone)]
pub struct SummaryRecord {
    pub item_id: String,
    pub title: String,
    pub source_label: String,
    pub summary: String,
    pub published_at: DateTime<Utc>,
    pub summarized_at: DateTime<Utc>,
    pub newsletter_sent_at: Option<DateTime<Utc>>,
    pub newsletter_sent_count: i64,
}

/// A leased queue message. Holding one does not remove it from the queue;
/// only an explicit ack does. The payload stays raw here so a malformed
/// body can be classified by the consumer instead of poisoning the lease.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub id: i64,
    pub message_id: String,
    pub payload: String,
    pub deliveries: i64,
}
