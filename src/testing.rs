//! In-memory stand-ins for the pipeline's boundary traits, used by unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;

use crate::batch::QueuedItem;
use crate::error::{DatabaseError, ExtractionError, NotifyError};
use crate::extraction::{Analysis, Attribution, Extractor, Finding};
use crate::metrics::{MetricsRecorder, TimedMetric};
use crate::notify::{Notification, Notifier};
use crate::pipeline::types::{InboundMessage, RouteDecision};
use crate::store::{
    InboundRecord, MessageStore, NewWorkUnit, OutcomeRecord, PendingRecord, RecordStatus,
    WorkUnit,
};

// ── Extractor ───────────────────────────────────────────────────────

/// One recorded `analyze` call.
#[derive(Debug, Clone)]
pub struct ExtractCall {
    pub tenant_id: String,
    pub message_ids: Vec<String>,
    pub at: Instant,
}

/// Scriptable extractor: fails whole calls on demand, or attributes
/// individual messages as failed.
#[derive(Default)]
pub struct StubExtractor {
    calls: Mutex<Vec<ExtractCall>>,
    fail_next: Mutex<u32>,
    fail_tenants: Mutex<HashSet<String>>,
    reject_ids: Mutex<HashSet<String>>,
    delay: Option<Duration>,
}

impl StubExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps this long before answering.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Fail the next `n` calls, whatever the tenant.
    pub fn fail_next(&self, n: u32) {
        *self.fail_next.lock().unwrap() = n;
    }

    /// Fail every call for a tenant.
    pub fn fail_tenant(&self, tenant_id: &str) {
        self.fail_tenants.lock().unwrap().insert(tenant_id.to_string());
    }

    /// Succeed the call but attribute this message as failed.
    pub fn reject(&self, message_id: &str) {
        self.reject_ids.lock().unwrap().insert(message_id.to_string());
    }

    pub fn calls(&self) -> Vec<ExtractCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, tenant_id: &str) -> Vec<ExtractCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.tenant_id == tenant_id)
            .collect()
    }

    /// How many calls included this message.
    pub fn times_seen(&self, message_id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.message_ids.iter().any(|id| id == message_id))
            .count()
    }
}

#[async_trait]
impl Extractor for StubExtractor {
    async fn analyze(
        &self,
        tenant_id: &str,
        items: &[QueuedItem],
    ) -> Result<Analysis, ExtractionError> {
        self.calls.lock().unwrap().push(ExtractCall {
            tenant_id: tenant_id.to_string(),
            message_ids: items.iter().map(|i| i.message_id.clone()).collect(),
            at: Instant::now(),
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let fail = {
            let mut remaining = self.fail_next.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                true
            } else {
                self.fail_tenants.lock().unwrap().contains(tenant_id)
            }
        };
        if fail {
            return Err(ExtractionError::Status {
                status: 503,
                body: "unavailable".into(),
            });
        }

        let rejected = self.reject_ids.lock().unwrap().clone();
        Ok(Analysis {
            findings: items
                .iter()
                .filter(|i| !rejected.contains(&i.message_id))
                .map(|i| Finding {
                    kind: "summary".into(),
                    summary: i.subject.clone(),
                    message_ids: vec![i.message_id.clone()],
                    confidence: None,
                })
                .collect(),
            attributions: items
                .iter()
                .map(|i| Attribution {
                    message_id: i.message_id.clone(),
                    success: !rejected.contains(&i.message_id),
                    error: rejected
                        .contains(&i.message_id)
                        .then(|| "rejected".to_string()),
                })
                .collect(),
        })
    }
}

// ── Notifier / metrics ──────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn for_message(&self, message_id: &str) -> Vec<Notification> {
        self.sent()
            .into_iter()
            .filter(|n| n.message_id == message_id)
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingMetrics {
    metrics: Mutex<Vec<TimedMetric>>,
}

impl RecordingMetrics {
    pub fn recorded(&self) -> Vec<TimedMetric> {
        self.metrics.lock().unwrap().clone()
    }
}

impl MetricsRecorder for RecordingMetrics {
    fn record(&self, metric: TimedMetric) {
        self.metrics.lock().unwrap().push(metric);
    }
}

// ── Store ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct MemoryRecord {
    record_id: String,
    message: InboundMessage,
    tenant_id: String,
    lane: RouteDecision,
    status: RecordStatus,
}

#[derive(Default)]
struct MemoryState {
    records: HashMap<String, MemoryRecord>,
    order: Vec<String>,
    units: Vec<WorkUnit>,
    attached: Vec<(i64, String)>,
    outcomes: Vec<OutcomeRecord>,
    senders: HashMap<String, String>,
    unsubscribes: HashSet<String>,
}

/// Purely in-memory store. Keeps time-sensitive tests free of I/O.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, message_id: &str) -> Option<RecordStatus> {
        self.state
            .lock()
            .unwrap()
            .records
            .get(message_id)
            .map(|r| r.status)
    }

    pub fn outcomes(&self) -> Vec<OutcomeRecord> {
        self.state.lock().unwrap().outcomes.clone()
    }

    pub fn unsubscribed(&self, sender: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .unsubscribes
            .contains(&sender.to_lowercase())
    }

    pub fn attached_to(&self, work_unit_id: i64) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .attached
            .iter()
            .filter(|(id, _)| *id == work_unit_id)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn work_units(&self) -> Vec<WorkUnit> {
        self.state.lock().unwrap().units.clone()
    }

    fn set_status(&self, message_id: &str, status: RecordStatus) -> Result<(), DatabaseError> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .records
            .get_mut(message_id)
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "inbound_message".into(),
                id: message_id.to_string(),
            })?;
        record.status = status;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn is_processed(&self, message_id: &str) -> Result<bool, DatabaseError> {
        Ok(self.status(message_id).is_some_and(|s| s.is_terminal()))
    }

    async fn record_inbound(
        &self,
        msg: &InboundMessage,
        lane: RouteDecision,
        tenant_id: &str,
    ) -> Result<InboundRecord, DatabaseError> {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.records.get(&msg.message_id) {
            return Ok(InboundRecord {
                record_id: existing.record_id.clone(),
                tenant_id: existing.tenant_id.clone(),
                lane: existing.lane,
                created: false,
            });
        }
        let record_id = format!("rec-{}", state.order.len() + 1);
        let status = if lane == RouteDecision::BatchedIntelligence {
            RecordStatus::Queued
        } else {
            RecordStatus::Received
        };
        state.records.insert(
            msg.message_id.clone(),
            MemoryRecord {
                record_id: record_id.clone(),
                message: msg.clone(),
                tenant_id: tenant_id.to_string(),
                lane,
                status,
            },
        );
        state.order.push(msg.message_id.clone());
        Ok(InboundRecord {
            record_id,
            tenant_id: tenant_id.to_string(),
            lane,
            created: true,
        })
    }

    async fn mark_processed(&self, message_id: &str, _reason: &str) -> Result<(), DatabaseError> {
        self.set_status(message_id, RecordStatus::Processed)
    }

    async fn mark_failed(&self, message_id: &str, _error: &str) -> Result<(), DatabaseError> {
        self.set_status(message_id, RecordStatus::Failed)
    }

    async fn find_work_unit_by_thread(
        &self,
        thread_id: &str,
    ) -> Result<Option<WorkUnit>, DatabaseError> {
        let state = self.state.lock().unwrap();
        let attached_unit = state
            .attached
            .iter()
            .find(|(_, m)| m == thread_id)
            .map(|(id, _)| *id);
        Ok(state
            .units
            .iter()
            .find(|u| u.thread_id == thread_id || Some(u.id) == attached_unit)
            .cloned())
    }

    async fn find_work_unit_by_reference(
        &self,
        reference: i64,
    ) -> Result<Option<WorkUnit>, DatabaseError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .units
            .iter()
            .find(|u| u.id == reference)
            .cloned())
    }

    async fn append_outcome(&self, outcome: &OutcomeRecord) -> Result<(), DatabaseError> {
        self.state.lock().unwrap().outcomes.push(outcome.clone());
        Ok(())
    }

    async fn tenant_for_sender(&self, sender: &str) -> Result<Option<String>, DatabaseError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .senders
            .get(&sender.to_lowercase())
            .cloned())
    }

    async fn assign_sender_tenant(
        &self,
        sender: &str,
        tenant_id: &str,
    ) -> Result<(), DatabaseError> {
        self.state
            .lock()
            .unwrap()
            .senders
            .insert(sender.to_lowercase(), tenant_id.to_string());
        Ok(())
    }

    async fn pending_intelligence(&self) -> Result<Vec<PendingRecord>, DatabaseError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.records.get(id))
            .filter(|r| r.status == RecordStatus::Queued)
            .map(|r| PendingRecord {
                record_id: r.record_id.clone(),
                message_id: r.message.message_id.clone(),
                sender: r.message.sender.clone(),
                subject: r.message.subject.clone(),
                body: r.message.body.clone(),
                tenant_id: r.tenant_id.clone(),
                priority: r.message.priority,
                received_at: r.message.received_at,
            })
            .collect())
    }

    async fn create_work_unit(&self, unit: &NewWorkUnit<'_>) -> Result<WorkUnit, DatabaseError> {
        let mut state = self.state.lock().unwrap();
        let created = WorkUnit {
            id: state.units.len() as i64 + 1,
            thread_id: unit.thread_id.to_string(),
            subject: unit.subject.to_string(),
            submitter: unit.submitter.to_string(),
            tenant_id: unit.tenant_id.to_string(),
            lane: unit.lane.label().to_string(),
            created_at: Utc::now(),
        };
        state.units.push(created.clone());
        state.attached.push((created.id, unit.message_id.to_string()));
        Ok(created)
    }

    async fn attach_to_work_unit(
        &self,
        work_unit_id: i64,
        message_id: &str,
        _sender: &str,
        _body: &str,
    ) -> Result<(), DatabaseError> {
        self.state
            .lock()
            .unwrap()
            .attached
            .push((work_unit_id, message_id.to_string()));
        Ok(())
    }

    async fn record_unsubscribe(
        &self,
        sender: &str,
        _message_id: &str,
    ) -> Result<(), DatabaseError> {
        self.state
            .lock()
            .unwrap()
            .unsubscribes
            .insert(sender.to_lowercase());
        Ok(())
    }
}

/// Record a queued item's message in a store so status updates resolve.
pub async fn seed_record(store: &MemoryStore, item: &QueuedItem) {
    let msg = InboundMessage {
        message_id: item.message_id.clone(),
        sender: item.submitter.clone(),
        to: Vec::new(),
        cc: Vec::new(),
        bcc: Vec::new(),
        subject: item.subject.clone(),
        body: item.body.clone(),
        received_at: item.received_at,
        in_reply_to: None,
        references: Vec::new(),
        thread_id: item.message_id.clone(),
        attachments: Vec::new(),
        priority: item.priority,
        sequence: 0,
    };
    store
        .record_inbound(&msg, RouteDecision::BatchedIntelligence, &item.tenant_id)
        .await
        .unwrap();
}
