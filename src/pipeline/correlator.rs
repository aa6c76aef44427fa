//! Reply correlator: attach follow-up mail to existing work.
//!
//! Lookups run in a fixed order, one query each:
//! 1. thread id (and the `In-Reply-To` id when it differs),
//! 2. a numeric reference in the subject (`#123`, `[#123]`, `ref 123`, `task 123`),
//! 3. nothing found: the message is fresh work.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::debug;

use crate::error::DatabaseError;
use crate::pipeline::types::InboundMessage;
use crate::store::{MessageStore, WorkUnit};

static SUBJECT_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:#|\b(?:ref|task)\s*[:#]?\s*)(\d+)\b").expect("valid reference regex")
});

/// How a reply was matched.
#[derive(Debug, Clone, PartialEq)]
pub enum Correlation {
    Thread(WorkUnit),
    SubjectReference(WorkUnit),
    Fresh,
}

impl Correlation {
    pub fn work_unit(&self) -> Option<&WorkUnit> {
        match self {
            Self::Thread(unit) | Self::SubjectReference(unit) => Some(unit),
            Self::Fresh => None,
        }
    }
}

pub struct ReplyCorrelator {
    store: Arc<dyn MessageStore>,
}

impl ReplyCorrelator {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    /// Find the work unit a reply belongs to.
    pub async fn correlate(&self, msg: &InboundMessage) -> Result<Correlation, DatabaseError> {
        if let Some(unit) = self.store.find_work_unit_by_thread(&msg.thread_id).await? {
            debug!(message_id = %msg.message_id, work_unit_id = unit.id, "Correlated by thread");
            return Ok(Correlation::Thread(unit));
        }
        if let Some(parent) = msg.in_reply_to.as_deref().filter(|p| *p != msg.thread_id)
            && let Some(unit) = self.store.find_work_unit_by_thread(parent).await?
        {
            debug!(message_id = %msg.message_id, work_unit_id = unit.id, "Correlated by in-reply-to");
            return Ok(Correlation::Thread(unit));
        }

        if let Some(reference) = subject_reference(&msg.subject)
            && let Some(unit) = self.store.find_work_unit_by_reference(reference).await?
        {
            debug!(message_id = %msg.message_id, work_unit_id = unit.id, "Correlated by subject reference");
            return Ok(Correlation::SubjectReference(unit));
        }

        Ok(Correlation::Fresh)
    }
}

/// First numeric work reference embedded in a subject line.
pub fn subject_reference(subject: &str) -> Option<i64> {
    SUBJECT_REFERENCE
        .captures(subject)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}
