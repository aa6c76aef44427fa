//! Per-tenant batching queue.
//!
//! Scheduling, evaluated on every enqueue, after every flush and on the
//! background tick:
//!
//! 1. length >= `emergency_threshold`: flush now (zero-delay timer task,
//!    the enqueue caller never waits on the extraction call);
//! 2. length >= `max_batch_size`: flush after `immediate_flush_delay`;
//! 3. otherwise: flush when the oldest item reaches `max_wait`.
//!
//! A tenant keeps at most one pending timer (the earliest wins) and at most
//! one flush in flight. After a failed flush only the emergency rule
//! overrides the retry timer; everything else waits out `retry_delay`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::fallback::{FallbackProcessor, FallbackReason};
use super::registry::{ScheduledFlush, TenantRegistry, TenantSlot, TenantState};
use super::{BatchResult, FlushReason, ItemOutcome, QueuedItem, complete_item, fail_item};
use crate::config::BatchConfig;
use crate::error::PipelineError;
use crate::extraction::Extractor;
use crate::metrics::{MetricsRecorder, TimedMetric};
use crate::notify::Notifier;
use crate::store::{MessageStore, OutcomePath};

/// What `enqueue` did with an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Already processed, already queued, or already in fallback.
    Duplicate,
    /// Handed to the fallback processor instead of the queue.
    Fallback(FallbackReason),
    Queued { queue_len: usize },
}

/// Result of draining the queue on shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub flushed_batches: usize,
    /// Items still unprocessed when shutdown gave up. They stay `queued`
    /// in the store and are picked up again on the next start.
    pub abandoned: usize,
}

pub struct BatchQueue {
    config: BatchConfig,
    registry: TenantRegistry,
    extractor: Arc<dyn Extractor>,
    store: Arc<dyn MessageStore>,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<dyn MetricsRecorder>,
    fallback: Arc<FallbackProcessor>,
    cancel: CancellationToken,
    accepting: AtomicBool,
    tasks: TaskTracker,
    next_timer_id: AtomicU64,
}

impl BatchQueue {
    pub fn new(
        config: BatchConfig,
        extractor: Arc<dyn Extractor>,
        store: Arc<dyn MessageStore>,
        notifier: Arc<dyn Notifier>,
        metrics: Arc<dyn MetricsRecorder>,
        fallback: Arc<FallbackProcessor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: TenantRegistry::new(),
            extractor,
            store,
            notifier,
            metrics,
            fallback,
            cancel: CancellationToken::new(),
            accepting: AtomicBool::new(true),
            tasks: TaskTracker::new(),
            next_timer_id: AtomicU64::new(1),
        })
    }

    /// Add an item to its tenant's queue, or route it to the fallback
    /// processor when it should not wait for a batch.
    pub async fn enqueue(self: &Arc<Self>, item: QueuedItem) -> Result<EnqueueOutcome, PipelineError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(PipelineError::ShuttingDown);
        }

        if self.store.is_processed(&item.message_id).await? {
            debug!(message_id = %item.message_id, "Already processed, not queueing");
            return Ok(EnqueueOutcome::Duplicate);
        }

        if let Some(reason) = self.fallback.eligibility(&item) {
            return Ok(if self.fallback.submit(item, reason) {
                EnqueueOutcome::Fallback(reason)
            } else {
                EnqueueOutcome::Duplicate
            });
        }

        let tenant_id = item.tenant_id.clone();
        let message_id = item.message_id.clone();
        let (_, queued) = self.registry.with_state(&tenant_id, |slot, state| {
            if state.contains(&item.message_id) {
                return None;
            }
            state.insert(item);
            self.schedule(slot, state);
            Some(state.items.len())
        });

        match queued {
            Some(queue_len) => {
                debug!(tenant_id = %tenant_id, message_id = %message_id, queue_len, "Item queued");
                Ok(EnqueueOutcome::Queued { queue_len })
            }
            None => {
                debug!(tenant_id = %tenant_id, message_id = %message_id, "Item already queued");
                Ok(EnqueueOutcome::Duplicate)
            }
        }
    }

    /// Start the background ticker. It stops on shutdown.
    pub fn spawn_ticker(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        self.tasks.spawn(async move {
            let mut interval = tokio::time::interval(this.config.tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = this.cancel.cancelled() => {
                        debug!("Batch ticker stopped");
                        return;
                    }
                    _ = interval.tick() => {
                        let started = this.tick();
                        if started > 0 {
                            debug!(started, "Ticker started flushes");
                        }
                    }
                }
            }
        })
    }

    /// Scan every tenant and start a flush for those that are full or whose
    /// oldest item has waited past `max_wait`. Returns the number started.
    pub fn tick(self: &Arc<Self>) -> usize {
        if self.cancel.is_cancelled() {
            return 0;
        }
        let now = Instant::now();
        let mut started = 0;
        for slot in self.registry.tenants() {
            let due = {
                let state = slot.lock();
                !state.flushing
                    && !retry_pending(&state)
                    && (state.items.len() >= self.config.max_batch_size
                        || state
                            .oldest_enqueued_at()
                            .is_some_and(|oldest| now.duration_since(oldest) >= self.config.max_wait))
            };
            if due {
                started += 1;
                let this = Arc::clone(self);
                self.tasks.spawn(async move {
                    this.flush_slot(&slot, FlushReason::Tick).await;
                });
            }
        }
        started
    }

    /// Items currently waiting for a tenant (not counting an in-flight batch).
    pub fn queued_len(&self, tenant_id: &str) -> usize {
        self.registry
            .get(tenant_id)
            .map(|slot| slot.lock().items.len())
            .unwrap_or(0)
    }

    pub fn tenant_count(&self) -> usize {
        self.registry.len()
    }

    /// Stop accepting items, cancel timers and the ticker, let in-flight
    /// flushes finish, then force-flush what is left. Everything is bounded
    /// by `timeout`.
    pub async fn shutdown(self: &Arc<Self>, timeout: Duration) -> ShutdownReport {
        let deadline = Instant::now() + timeout;
        self.accepting.store(false, Ordering::Release);
        self.cancel.cancel();
        for slot in self.registry.tenants() {
            slot.lock().cancel_timer();
        }

        self.tasks.close();
        if tokio::time::timeout_at(deadline, self.tasks.wait()).await.is_err() {
            warn!("In-flight flushes still running at shutdown deadline");
        }

        let mut report = ShutdownReport::default();
        'tenants: for slot in self.registry.tenants() {
            loop {
                let before = slot.lock().items.len();
                if before == 0 {
                    break;
                }
                match tokio::time::timeout_at(deadline, self.flush_slot(&slot, FlushReason::Shutdown))
                    .await
                {
                    Ok(Some(_)) => report.flushed_batches += 1,
                    Ok(None) => break,
                    Err(_) => {
                        warn!(tenant_id = %slot.tenant_id(), "Shutdown flush timed out");
                        break 'tenants;
                    }
                }
                if slot.lock().items.len() >= before {
                    break;
                }
            }
        }

        for slot in self.registry.tenants() {
            let state = slot.lock();
            let left: Vec<&str> = state
                .items
                .iter()
                .map(|i| i.message_id.as_str())
                .chain(state.in_flight.iter().map(String::as_str))
                .collect();
            if left.is_empty() {
                continue;
            }
            report.abandoned += left.len();
            warn!(
                tenant_id = %slot.tenant_id(),
                count = left.len(),
                message_ids = ?left,
                "Items abandoned on shutdown"
            );
        }

        info!(
            flushed_batches = report.flushed_batches,
            abandoned = report.abandoned,
            "Batch queue stopped"
        );
        report
    }

    // ── Scheduling ──────────────────────────────────────────────────

    /// Arm the tenant's timer according to the scheduling policy.
    /// Called with the slot lock held.
    fn schedule(self: &Arc<Self>, slot: &Arc<TenantSlot>, state: &mut TenantState) {
        if self.cancel.is_cancelled() || state.flushing {
            return;
        }
        let len = state.items.len();
        let now = Instant::now();
        let (deadline, reason) = if len >= self.config.emergency_threshold {
            warn!(
                tenant_id = %slot.tenant_id(),
                queue_len = len,
                retry_overridden = retry_pending(state),
                "Emergency threshold reached"
            );
            (now, FlushReason::Emergency)
        } else if retry_pending(state) {
            return;
        } else if len >= self.config.max_batch_size {
            (now + self.config.immediate_flush_delay, FlushReason::BatchFull)
        } else {
            match state.oldest_enqueued_at() {
                Some(oldest) => (oldest + self.config.max_wait, FlushReason::MaxWait),
                None => return,
            }
        };
        self.arm_timer(slot, state, deadline, reason);
    }

    /// Keep the earliest timer: a pending one that fires no later than
    /// `deadline` stays, a later one is replaced.
    fn arm_timer(
        self: &Arc<Self>,
        slot: &Arc<TenantSlot>,
        state: &mut TenantState,
        deadline: Instant,
        reason: FlushReason,
    ) {
        if state.timer.as_ref().is_some_and(|t| t.deadline <= deadline) {
            return;
        }
        state.cancel_timer();

        let id = self.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let this = Arc::clone(self);
        let timer_slot = Arc::clone(slot);
        let handle = self.tasks.spawn(async move {
            this.run_timer(timer_slot, id, deadline, reason).await;
        });
        state.timer = Some(ScheduledFlush {
            id,
            deadline,
            reason,
            handle,
        });
    }

    async fn run_timer(self: Arc<Self>, slot: Arc<TenantSlot>, id: u64, deadline: Instant, reason: FlushReason) {
        tokio::select! {
            _ = self.cancel.cancelled() => return,
            _ = tokio::time::sleep_until(deadline) => {}
        }
        {
            let mut state = slot.lock();
            if !state.timer.as_ref().is_some_and(|t| t.id == id) {
                return;
            }
            // Detach rather than abort: this is the running task.
            state.timer = None;
        }
        self.flush_slot(&slot, reason).await;
    }

    // ── Flushing ────────────────────────────────────────────────────

    /// Take up to `max_batch_size` items from the front and send them to
    /// the extractor. Returns `None` when the tenant is empty or already
    /// flushing.
    async fn flush_slot(self: &Arc<Self>, slot: &Arc<TenantSlot>, reason: FlushReason) -> Option<BatchResult> {
        let tenant_id = slot.tenant_id().to_string();
        let batch: Vec<QueuedItem> = {
            let mut state = slot.lock();
            if state.flushing || state.items.is_empty() {
                None
            } else {
                state.flushing = true;
                let take = state.items.len().min(self.config.max_batch_size);
                let batch: Vec<QueuedItem> = state.items.drain(..take).collect();
                state.in_flight = batch.iter().map(|i| i.message_id.clone()).collect();
                Some(batch)
            }
        }
        .or_else(|| {
            self.registry.remove_if_idle(&tenant_id);
            None
        })?;

        info!(
            tenant_id = %tenant_id,
            batch_size = batch.len(),
            reason = reason.as_str(),
            "Flushing batch"
        );

        let started = Instant::now();
        let result = self.extractor.analyze(&tenant_id, &batch).await;
        let elapsed = started.elapsed();
        self.metrics.record(
            TimedMetric::new("batch_queue", "flush")
                .label("tenant_id", &tenant_id)
                .label("batch_size", batch.len())
                .label("reason", reason.as_str())
                .finish(elapsed, result.is_ok()),
        );

        let processed = batch.len();
        let mut outcomes = Vec::with_capacity(processed);
        let mut insight_count = 0;
        let mut retry = Vec::new();

        match result {
            Ok(analysis) => {
                insight_count = analysis.findings.len();
                for item in batch {
                    if analysis.failed(&item.message_id) {
                        let error = analysis
                            .attribution_for(&item.message_id)
                            .and_then(|a| a.error.clone())
                            .unwrap_or_else(|| "rejected by extraction service".into());
                        warn!(
                            tenant_id = %tenant_id,
                            message_id = %item.message_id,
                            error = %error,
                            "Item rejected in batch, processing individually"
                        );
                        outcomes.push(ItemOutcome {
                            message_id: item.message_id.clone(),
                            success: false,
                            error: Some(error),
                        });
                        self.fallback.submit(item, FallbackReason::Degraded);
                    } else {
                        let insights = analysis.insights_for(&item.message_id);
                        complete_item(&*self.store, &*self.notifier, &item, OutcomePath::Batch, insights)
                            .await;
                        outcomes.push(ItemOutcome {
                            message_id: item.message_id,
                            success: true,
                            error: None,
                        });
                    }
                }
            }
            Err(e) => {
                let error = e.to_string();
                warn!(
                    tenant_id = %tenant_id,
                    batch_size = processed,
                    error = %error,
                    "Batch flush failed"
                );
                for mut item in batch {
                    item.retry_count += 1;
                    outcomes.push(ItemOutcome {
                        message_id: item.message_id.clone(),
                        success: false,
                        error: Some(error.clone()),
                    });
                    if item.retry_count >= self.config.max_retries {
                        error!(
                            tenant_id = %tenant_id,
                            message_id = %item.message_id,
                            retries = item.retry_count,
                            "Item failed permanently"
                        );
                        fail_item(&*self.store, &*self.notifier, &item, &error).await;
                    } else {
                        retry.push(item);
                    }
                }
            }
        }

        let requeued = retry.len();
        {
            let mut state = slot.lock();
            state.flushing = false;
            state.in_flight.clear();
            if retry.is_empty() {
                self.schedule(slot, &mut state);
            } else {
                state.requeue_front(retry);
                if !self.cancel.is_cancelled() {
                    state.cancel_timer();
                    let deadline = Instant::now() + self.config.retry_delay;
                    self.arm_timer(slot, &mut state, deadline, FlushReason::Retry);
                }
            }
        }
        if requeued > 0 {
            debug!(tenant_id = %tenant_id, requeued, "Items requeued for retry");
        }
        self.registry.remove_if_idle(&tenant_id);

        let result = BatchResult {
            tenant_id,
            processed,
            insight_count,
            elapsed,
            outcomes,
        };
        debug!(
            tenant_id = %result.tenant_id,
            succeeded = result.succeeded(),
            processed = result.processed,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "Flush finished"
        );
        Some(result)
    }
}

fn retry_pending(state: &TenantState) -> bool {
    state
        .timer
        .as_ref()
        .is_some_and(|t| t.reason == FlushReason::Retry)
}
