//! Shared types for the ingestion pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::PipelineError;

// ── Inbound message ─────────────────────────────────────────────────

/// One parsed email. Built once by the parser and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Message-ID without angle brackets (generated when missing).
    pub message_id: String,
    pub sender: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
    pub in_reply_to: Option<String>,
    /// `References` chain, oldest first.
    pub references: Vec<String>,
    /// Root of the conversation this message belongs to.
    pub thread_id: String,
    pub attachments: Vec<Attachment>,
    /// Priority signalled by the message headers or subject tag.
    pub priority: Priority,
    /// Mailbox sequence number or submission counter that produced it.
    pub sequence: u32,
}

impl InboundMessage {
    /// Every recipient: direct, cc and bcc.
    pub fn all_recipients(&self) -> impl Iterator<Item = &str> {
        self.to
            .iter()
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .map(String::as_str)
    }
}

/// A decoded attachment part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    #[serde(skip)]
    pub data: Vec<u8>,
}

// ── Priority ────────────────────────────────────────────────────────

/// Queue priority of an intelligence item.
///
/// `High` jumps ahead of normal items in its tenant queue; `Urgent`
/// bypasses batching entirely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Routing ─────────────────────────────────────────────────────────

/// Processing lane chosen for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteDecision {
    DirectTask,
    BatchedIntelligence,
    CatchAll,
    None,
}

impl RouteDecision {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::DirectTask => "direct_task",
            Self::BatchedIntelligence => "batched_intelligence",
            Self::CatchAll => "catch_all",
            Self::None => "none",
        }
    }

    /// Inverse of [`label`](Self::label). Unknown labels map to `None`.
    pub fn parse(label: &str) -> Self {
        match label {
            "direct_task" => Self::DirectTask,
            "batched_intelligence" => Self::BatchedIntelligence,
            "catch_all" => Self::CatchAll,
            _ => Self::None,
        }
    }
}

/// Routing result: lane plus whatever the address told us about the tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub decision: RouteDecision,
    pub tenant_id: Option<String>,
    pub agent_type: Option<String>,
}

impl Route {
    pub fn unrouted() -> Self {
        Self {
            decision: RouteDecision::None,
            tenant_id: None,
            agent_type: None,
        }
    }

    pub fn lane(decision: RouteDecision) -> Self {
        Self {
            decision,
            tenant_id: None,
            agent_type: None,
        }
    }
}

// ── Ingest plumbing ─────────────────────────────────────────────────

/// Where a raw message came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestSource {
    /// A supervised mailbox, by account name.
    Mailbox { account: String },
    /// The submission listener, by authenticated username.
    Submission { username: String },
}

impl fmt::Display for IngestSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mailbox { account } => write!(f, "mailbox:{account}"),
            Self::Submission { username } => write!(f, "submission:{username}"),
        }
    }
}

/// A raw message on its way to the dispatcher, with a reply slot.
#[derive(Debug)]
pub struct IngestRequest {
    pub raw: Vec<u8>,
    pub source: IngestSource,
    pub sequence: u32,
    /// Envelope recipients not visible in the headers (SMTP `RCPT TO`).
    pub envelope_recipients: Vec<String>,
    pub ack: oneshot::Sender<Result<DispatchOutcome, PipelineError>>,
}

/// What the dispatcher did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The processed marker was already set.
    Duplicate { message_id: String },
    /// No lane matched.
    Ignored { message_id: String },
    /// A new work unit was created.
    WorkCreated { message_id: String, work_unit_id: i64 },
    /// The reply was attached to existing work.
    Attached { message_id: String, work_unit_id: i64 },
    /// Opt-out recorded.
    Unsubscribed { message_id: String },
    /// Handed to the batching queue (or its fallback path).
    Queued { message_id: String, tenant_id: String },
}

impl DispatchOutcome {
    pub fn message_id(&self) -> &str {
        match self {
            Self::Duplicate { message_id }
            | Self::Ignored { message_id }
            | Self::WorkCreated { message_id, .. }
            | Self::Attached { message_id, .. }
            | Self::Unsubscribed { message_id }
            | Self::Queued { message_id, .. } => message_id,
        }
    }

    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Duplicate { .. } => "duplicate",
            Self::Ignored { .. } => "ignored",
            Self::WorkCreated { .. } => "work_created",
            Self::Attached { .. } => "attached",
            Self::Unsubscribed { .. } => "unsubscribed",
            Self::Queued { .. } => "queued",
        }
    }
}
