//! Per-tenant batching of intelligence submissions.
//!
//! Items are buffered per tenant in [`registry::TenantRegistry`] and flushed
//! to the extraction service by [`queue::BatchQueue`]. Items unsuited to
//! batching go through [`fallback::FallbackProcessor`] one at a time.

pub mod fallback;
pub mod queue;
pub mod registry;

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::warn;

use crate::notify::{Notification, NotificationKind, Notifier};
use crate::pipeline::types::{InboundMessage, Priority};
use crate::store::{MessageStore, OutcomePath, OutcomeRecord, PendingRecord};

pub use fallback::{FallbackProcessor, FallbackReason};
pub use queue::{BatchQueue, EnqueueOutcome, ShutdownReport};
pub use registry::TenantRegistry;

/// A tenant-scoped intelligence item waiting for extraction.
#[derive(Debug, Clone)]
pub struct QueuedItem {
    pub message_id: String,
    pub subject: String,
    pub body: String,
    pub submitter: String,
    pub received_at: DateTime<Utc>,
    pub tenant_id: String,
    /// Persisted inbound record this item belongs to.
    pub record_id: String,
    pub retry_count: u32,
    pub priority: Priority,
    /// When the item entered memory; drives the max-wait policy.
    pub enqueued_at: Instant,
}

impl QueuedItem {
    pub fn from_message(msg: &InboundMessage, tenant_id: &str, record_id: &str) -> Self {
        Self {
            message_id: msg.message_id.clone(),
            subject: msg.subject.clone(),
            body: msg.body.clone(),
            submitter: msg.sender.clone(),
            received_at: msg.received_at,
            tenant_id: tenant_id.to_string(),
            record_id: record_id.to_string(),
            retry_count: 0,
            priority: msg.priority,
            enqueued_at: Instant::now(),
        }
    }

    /// Rebuild an item from a record left queued by a previous run.
    pub fn from_pending(record: PendingRecord) -> Self {
        Self {
            message_id: record.message_id,
            subject: record.subject,
            body: record.body,
            submitter: record.sender,
            received_at: record.received_at,
            tenant_id: record.tenant_id,
            record_id: record.record_id,
            retry_count: 0,
            priority: record.priority,
            enqueued_at: Instant::now(),
        }
    }

    /// Combined subject and body length, in characters.
    pub fn content_len(&self) -> usize {
        self.subject.chars().count() + self.body.chars().count()
    }
}

/// Why a flush was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Emergency,
    BatchFull,
    MaxWait,
    Tick,
    Retry,
    Shutdown,
}

impl FlushReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Emergency => "emergency",
            Self::BatchFull => "batch_full",
            Self::MaxWait => "max_wait",
            Self::Tick => "tick",
            Self::Retry => "retry",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Per-item result of a flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemOutcome {
    pub message_id: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Summary of one flush.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub tenant_id: String,
    pub processed: usize,
    pub insight_count: usize,
    pub elapsed: Duration,
    pub outcomes: Vec<ItemOutcome>,
}

impl BatchResult {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.success).count()
    }
}

/// Mark an item processed, append its outcome and tell the submitter.
/// Store and notifier failures are logged; the item is done either way.
pub(crate) async fn complete_item(
    store: &dyn MessageStore,
    notifier: &dyn Notifier,
    item: &QueuedItem,
    path: OutcomePath,
    insight_count: usize,
) {
    if let Err(e) = store.mark_processed(&item.message_id, path.as_str()).await {
        warn!(message_id = %item.message_id, error = %e, "Failed to mark item processed");
    }
    let outcome = OutcomeRecord {
        message_id: item.message_id.clone(),
        tenant_id: item.tenant_id.clone(),
        path,
        insight_count,
    };
    if let Err(e) = store.append_outcome(&outcome).await {
        warn!(message_id = %item.message_id, error = %e, "Failed to append outcome");
    }
    notify_submitter(notifier, item, NotificationKind::Processed { insight_count }).await;
}

/// Mark an item permanently failed and tell the submitter.
pub(crate) async fn fail_item(
    store: &dyn MessageStore,
    notifier: &dyn Notifier,
    item: &QueuedItem,
    error: &str,
) {
    if let Err(e) = store.mark_failed(&item.message_id, error).await {
        warn!(message_id = %item.message_id, error = %e, "Failed to mark item failed");
    }
    notify_submitter(
        notifier,
        item,
        NotificationKind::Failed {
            error: error.to_string(),
        },
    )
    .await;
}

async fn notify_submitter(notifier: &dyn Notifier, item: &QueuedItem, kind: NotificationKind) {
    let notification = Notification {
        recipient: item.submitter.clone(),
        message_id: item.message_id.clone(),
        tenant_id: item.tenant_id.clone(),
        subject: item.subject.clone(),
        kind,
    };
    if let Err(e) = notifier.notify(&notification).await {
        warn!(message_id = %item.message_id, error = %e, "Failed to notify submitter");
    }
}

#[cfg(test)]
pub(crate) fn test_item(tenant: &str, id: &str) -> QueuedItem {
    QueuedItem {
        message_id: id.to_string(),
        subject: format!("subject {id}"),
        body: "quarterly numbers attached".into(),
        submitter: "alice@example.com".into(),
        received_at: Utc::now(),
        tenant_id: tenant.to_string(),
        record_id: format!("rec-{id}"),
        retry_count: 0,
        priority: Priority::Normal,
        enqueued_at: Instant::now(),
    }
}
