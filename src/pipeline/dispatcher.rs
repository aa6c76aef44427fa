//! Dispatcher: the single consumer of raw mail from every ingest source.
//!
//! For each message: parse, check the processed marker, route, resolve the
//! tenant, record the inbound message, then hand it to its lane. The
//! source is told the outcome through the request's oneshot ack and only
//! then acknowledges the mail upstream (marks it seen, replies `250`).

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batch::{BatchQueue, EnqueueOutcome, QueuedItem};
use crate::config::RoutingConfig;
use crate::error::PipelineError;
use crate::pipeline::correlator::{Correlation, ReplyCorrelator};
use crate::pipeline::handler::WorkHandler;
use crate::pipeline::parser;
use crate::pipeline::router::Router;
use crate::pipeline::types::{
    DispatchOutcome, InboundMessage, IngestRequest, IngestSource, Route, RouteDecision,
};
use crate::store::MessageStore;

/// Cloneable sending side of the ingest channel.
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<IngestRequest>,
}

impl DispatcherHandle {
    /// A bounded ingest channel: the handle plus the receiving end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<IngestRequest>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Send raw mail to the dispatcher and wait for its verdict.
    pub async fn submit(
        &self,
        raw: Vec<u8>,
        source: IngestSource,
        sequence: u32,
        envelope_recipients: Vec<String>,
    ) -> Result<DispatchOutcome, PipelineError> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(IngestRequest {
                raw,
                source,
                sequence,
                envelope_recipients,
                ack,
            })
            .await
            .map_err(|_| PipelineError::DispatcherClosed)?;
        rx.await.map_err(|_| PipelineError::DispatcherClosed)?
    }
}

pub struct Dispatcher {
    router: Router,
    store: Arc<dyn MessageStore>,
    correlator: ReplyCorrelator,
    handler: Arc<dyn WorkHandler>,
    queue: Arc<BatchQueue>,
    default_tenant: String,
}

impl Dispatcher {
    pub fn new(
        routing: &RoutingConfig,
        store: Arc<dyn MessageStore>,
        handler: Arc<dyn WorkHandler>,
        queue: Arc<BatchQueue>,
    ) -> Self {
        Self {
            router: Router::new(routing),
            correlator: ReplyCorrelator::new(Arc::clone(&store)),
            store,
            handler,
            queue,
            default_tenant: routing.default_tenant.clone(),
        }
    }

    /// Run the dispatcher on its own task. When `cancel` fires the channel
    /// is closed and already-buffered requests are still handled.
    pub fn spawn(
        self,
        capacity: usize,
        cancel: CancellationToken,
    ) -> (DispatcherHandle, JoinHandle<()>) {
        let (handle, mut rx) = DispatcherHandle::channel(capacity);
        let task = tokio::spawn(async move {
            info!("Dispatcher started");
            loop {
                let request = tokio::select! {
                    biased;
                    request = rx.recv() => request,
                    _ = cancel.cancelled(), if !rx.is_closed() => {
                        rx.close();
                        continue;
                    }
                };
                let Some(request) = request else { break };

                let result = self
                    .dispatch(&request.raw, request.sequence, &request.envelope_recipients)
                    .await;
                match &result {
                    Ok(outcome) => info!(
                        source = %request.source,
                        message_id = %outcome.message_id(),
                        outcome = outcome.label(),
                        "Message dispatched"
                    ),
                    Err(e) => warn!(
                        source = %request.source,
                        sequence = request.sequence,
                        error = %e,
                        "Dispatch failed"
                    ),
                }
                // The source may have given up waiting.
                let _ = request.ack.send(result);
            }
            info!("Dispatcher stopped");
        });
        (handle, task)
    }

    /// Handle one raw message end to end.
    pub async fn dispatch(
        &self,
        raw: &[u8],
        sequence: u32,
        envelope_recipients: &[String],
    ) -> Result<DispatchOutcome, PipelineError> {
        let msg = parser::parse(raw, sequence);
        let message_id = msg.message_id.clone();

        if self.store.is_processed(&message_id).await? {
            debug!(message_id = %message_id, "Duplicate message skipped");
            return Ok(DispatchOutcome::Duplicate { message_id });
        }

        let route = self.router.route(
            msg.all_recipients()
                .chain(envelope_recipients.iter().map(String::as_str)),
        );
        let tenant_id = self.resolve_tenant(&msg, &route).await?;
        let record = self
            .store
            .record_inbound(&msg, route.decision, &tenant_id)
            .await?;
        // A redelivered message stays with the tenant and lane it was first
        // recorded under, so it can never sit in two queues.
        if !record.created && (record.tenant_id != tenant_id || record.lane != route.decision) {
            info!(
                message_id = %message_id,
                recorded_tenant = %record.tenant_id,
                recorded_lane = record.lane.label(),
                tenant_id = %tenant_id,
                lane = route.decision.label(),
                "Redelivered message keeps its recorded tenant and lane"
            );
        }
        let tenant_id = record.tenant_id;
        debug!(
            message_id = %message_id,
            record_id = %record.record_id,
            lane = record.lane.label(),
            tenant_id = %tenant_id,
            "Inbound message recorded"
        );

        match record.lane {
            RouteDecision::None => {
                self.store.mark_processed(&message_id, "unrouted").await?;
                Ok(DispatchOutcome::Ignored { message_id })
            }
            RouteDecision::DirectTask | RouteDecision::CatchAll
                if parser::is_unsubscribe(&msg) =>
            {
                self.unsubscribe(&msg).await
            }
            RouteDecision::BatchedIntelligence if parser::is_unsubscribe_subject(&msg) => {
                self.unsubscribe(&msg).await
            }
            RouteDecision::DirectTask | RouteDecision::CatchAll => {
                self.handle_work(&msg, record.lane, &tenant_id).await
            }
            RouteDecision::BatchedIntelligence => {
                let item = QueuedItem::from_message(&msg, &tenant_id, &record.record_id);
                match self.queue.enqueue(item).await? {
                    EnqueueOutcome::Duplicate => Ok(DispatchOutcome::Duplicate { message_id }),
                    EnqueueOutcome::Fallback(_) | EnqueueOutcome::Queued { .. } => {
                        Ok(DispatchOutcome::Queued {
                            message_id,
                            tenant_id,
                        })
                    }
                }
            }
        }
    }

    /// Re-enqueue intelligence records a previous run left queued.
    pub async fn reconcile_pending(&self) -> Result<usize, PipelineError> {
        let pending = self.store.pending_intelligence().await?;
        let mut requeued = 0;
        for record in pending {
            let message_id = record.message_id.clone();
            match self.queue.enqueue(QueuedItem::from_pending(record)).await? {
                EnqueueOutcome::Duplicate => {
                    debug!(message_id = %message_id, "Pending record already handled");
                }
                _ => requeued += 1,
            }
        }
        if requeued > 0 {
            info!(requeued, "Pending intelligence records requeued");
        }
        Ok(requeued)
    }

    /// Route tenant, else the sender's registered tenant, else the default.
    /// A tenant named in the address is remembered for the sender.
    async fn resolve_tenant(
        &self,
        msg: &InboundMessage,
        route: &Route,
    ) -> Result<String, PipelineError> {
        if let Some(tenant) = &route.tenant_id {
            if !msg.sender.is_empty() {
                self.store.assign_sender_tenant(&msg.sender, tenant).await?;
            }
            return Ok(tenant.clone());
        }
        if !msg.sender.is_empty()
            && let Some(tenant) = self.store.tenant_for_sender(&msg.sender).await?
        {
            return Ok(tenant);
        }
        Ok(self.default_tenant.clone())
    }

    async fn unsubscribe(&self, msg: &InboundMessage) -> Result<DispatchOutcome, PipelineError> {
        self.handler.unsubscribe(msg).await?;
        self.store
            .mark_processed(&msg.message_id, "unsubscribe")
            .await?;
        Ok(DispatchOutcome::Unsubscribed {
            message_id: msg.message_id.clone(),
        })
    }

    async fn handle_work(
        &self,
        msg: &InboundMessage,
        lane: RouteDecision,
        tenant_id: &str,
    ) -> Result<DispatchOutcome, PipelineError> {
        let message_id = msg.message_id.clone();

        if parser::is_reply(msg) {
            if let Correlation::Thread(unit) | Correlation::SubjectReference(unit) =
                self.correlator.correlate(msg).await?
            {
                self.handler.attach(&unit, msg).await?;
                self.store.mark_processed(&message_id, "attached").await?;
                return Ok(DispatchOutcome::Attached {
                    message_id,
                    work_unit_id: unit.id,
                });
            }
        }

        let unit = self.handler.create(msg, lane, tenant_id).await?;
        self.store.mark_processed(&message_id, "work_created").await?;
        Ok(DispatchOutcome::WorkCreated {
            message_id,
            work_unit_id: unit.id,
        })
    }
}
