//! Work handlers for direct-task and catch-all mail.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::PipelineError;
use crate::pipeline::parser::strip_quoted_text;
use crate::pipeline::types::{InboundMessage, RouteDecision};
use crate::store::{MessageStore, NewWorkUnit, WorkUnit};

/// Business side of the non-batched lanes.
#[async_trait]
pub trait WorkHandler: Send + Sync {
    /// Open a new unit of work for a fresh message.
    async fn create(
        &self,
        msg: &InboundMessage,
        lane: RouteDecision,
        tenant_id: &str,
    ) -> Result<WorkUnit, PipelineError>;

    /// Attach a reply to the work it belongs to.
    async fn attach(&self, unit: &WorkUnit, msg: &InboundMessage) -> Result<(), PipelineError>;

    /// Record an opt-out request.
    async fn unsubscribe(&self, msg: &InboundMessage) -> Result<(), PipelineError>;
}

/// Persists work units through the message store.
pub struct StoreWorkHandler {
    store: Arc<dyn MessageStore>,
}

impl StoreWorkHandler {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl WorkHandler for StoreWorkHandler {
    async fn create(
        &self,
        msg: &InboundMessage,
        lane: RouteDecision,
        tenant_id: &str,
    ) -> Result<WorkUnit, PipelineError> {
        let unit = self
            .store
            .create_work_unit(&NewWorkUnit {
                thread_id: &msg.thread_id,
                message_id: &msg.message_id,
                subject: &msg.subject,
                body: &msg.body,
                submitter: &msg.sender,
                tenant_id,
                lane,
            })
            .await?;
        info!(
            work_unit_id = unit.id,
            tenant_id,
            lane = lane.label(),
            "Work unit created"
        );
        Ok(unit)
    }

    async fn attach(&self, unit: &WorkUnit, msg: &InboundMessage) -> Result<(), PipelineError> {
        // Only the new text of a reply is kept.
        let body = strip_quoted_text(&msg.body);
        self.store
            .attach_to_work_unit(unit.id, &msg.message_id, &msg.sender, &body)
            .await?;
        info!(work_unit_id = unit.id, message_id = %msg.message_id, "Reply attached");
        Ok(())
    }

    async fn unsubscribe(&self, msg: &InboundMessage) -> Result<(), PipelineError> {
        self.store
            .record_unsubscribe(&msg.sender, &msg.message_id)
            .await?;
        info!(sender = %msg.sender, "Unsubscribe recorded");
        Ok(())
    }
}
