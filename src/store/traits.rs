//! `MessageStore` trait: the single async persistence boundary.
//!
//! The pipeline only talks to this trait. `LibSqlStore` is the default
//! implementation; tests may substitute their own.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::pipeline::types::{InboundMessage, Priority, RouteDecision};

/// Lifecycle of a persisted inbound record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    /// Recorded, handled synchronously by a work handler.
    Received,
    /// Waiting in a batch queue or the fallback path.
    Queued,
    /// Fully handled. Terminal.
    Processed,
    /// Gave up after retries. Terminal.
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Queued => "queued",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "queued" => Self::Queued,
            "processed" => Self::Processed,
            "failed" => Self::Failed,
            _ => Self::Received,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Processed | Self::Failed)
    }
}

/// A unit of work created from direct-task or catch-all mail.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkUnit {
    /// Numeric id; also the `#123` reference used in subjects.
    pub id: i64,
    pub thread_id: String,
    pub subject: String,
    pub submitter: String,
    pub tenant_id: String,
    pub lane: String,
    pub created_at: DateTime<Utc>,
}

/// Fields needed to open a new work unit.
#[derive(Debug, Clone)]
pub struct NewWorkUnit<'a> {
    pub thread_id: &'a str,
    pub message_id: &'a str,
    pub subject: &'a str,
    pub body: &'a str,
    pub submitter: &'a str,
    pub tenant_id: &'a str,
    pub lane: RouteDecision,
}

/// How an item reached the extraction service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomePath {
    Batch,
    Fallback,
}

impl OutcomePath {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Batch => "batch",
            Self::Fallback => "fallback",
        }
    }
}

/// Result of extracting one queued message.
#[derive(Debug, Clone)]
pub struct OutcomeRecord {
    pub message_id: String,
    pub tenant_id: String,
    pub path: OutcomePath,
    pub insight_count: usize,
}

/// A recorded inbound message. Re-recording a known message id returns the
/// tenant and lane stored the first time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRecord {
    pub record_id: String,
    pub tenant_id: String,
    pub lane: RouteDecision,
    /// False when the message id was already recorded.
    pub created: bool,
}

/// An intelligence record still waiting for extraction.
#[derive(Debug, Clone)]
pub struct PendingRecord {
    pub record_id: String,
    pub message_id: String,
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub tenant_id: String,
    pub priority: Priority,
    pub received_at: DateTime<Utc>,
}

/// Persistence operations used by the ingestion pipeline.
///
/// Implementations must be safe to call concurrently from different
/// tenants' flushes.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Whether the message already carries a terminal marker
    /// (processed or failed).
    async fn is_processed(&self, message_id: &str) -> Result<bool, DatabaseError>;

    /// Record an inbound message. Recording the same message id again
    /// leaves the stored tenant and lane untouched and returns them.
    async fn record_inbound(
        &self,
        msg: &InboundMessage,
        lane: RouteDecision,
        tenant_id: &str,
    ) -> Result<InboundRecord, DatabaseError>;

    /// Set the processed marker.
    async fn mark_processed(&self, message_id: &str, reason: &str) -> Result<(), DatabaseError>;

    /// Mark the record permanently failed.
    async fn mark_failed(&self, message_id: &str, error: &str) -> Result<(), DatabaseError>;

    /// Find the work unit a thread belongs to, by root thread id or by
    /// the id of any message already attached to it.
    async fn find_work_unit_by_thread(
        &self,
        thread_id: &str,
    ) -> Result<Option<WorkUnit>, DatabaseError>;

    /// Find a work unit by its numeric reference.
    async fn find_work_unit_by_reference(
        &self,
        reference: i64,
    ) -> Result<Option<WorkUnit>, DatabaseError>;

    /// Append one queued message's extraction outcome.
    async fn append_outcome(&self, outcome: &OutcomeRecord) -> Result<(), DatabaseError>;

    /// Tenant a sender address is registered to, if any.
    async fn tenant_for_sender(&self, sender: &str) -> Result<Option<String>, DatabaseError>;

    /// Register (or move) a sender to a tenant.
    async fn assign_sender_tenant(&self, sender: &str, tenant_id: &str)
    -> Result<(), DatabaseError>;

    /// Intelligence records still queued, oldest first.
    async fn pending_intelligence(&self) -> Result<Vec<PendingRecord>, DatabaseError>;

    /// Open a new work unit, attaching the originating message.
    async fn create_work_unit(&self, unit: &NewWorkUnit<'_>) -> Result<WorkUnit, DatabaseError>;

    /// Attach a follow-up message to an existing work unit.
    async fn attach_to_work_unit(
        &self,
        work_unit_id: i64,
        message_id: &str,
        sender: &str,
        body: &str,
    ) -> Result<(), DatabaseError>;

    /// Record an opt-out request from a sender.
    async fn record_unsubscribe(&self, sender: &str, message_id: &str)
    -> Result<(), DatabaseError>;
}
