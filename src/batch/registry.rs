//! Tenant registry: owns every tenant's queue state.
//!
//! Slots are created lazily on first use and removed only when idle (empty
//! queue, no flush in flight, no timer pending). A removed slot is marked
//! retired under its own lock, so a caller that fetched it just before
//! removal retries against a fresh slot instead of writing into an orphan.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use super::{FlushReason, QueuedItem};

/// A pending flush timer.
#[derive(Debug)]
pub struct ScheduledFlush {
    pub id: u64,
    pub deadline: Instant,
    pub reason: FlushReason,
    pub handle: JoinHandle<()>,
}

/// Mutable state of one tenant's queue.
#[derive(Debug, Default)]
pub struct TenantState {
    pub items: VecDeque<QueuedItem>,
    pub flushing: bool,
    pub timer: Option<ScheduledFlush>,
    /// Message ids taken by the flush currently in flight.
    pub in_flight: HashSet<String>,
    retired: bool,
}

impl TenantState {
    pub fn is_idle(&self) -> bool {
        self.items.is_empty() && !self.flushing && self.timer.is_none()
    }

    /// Whether a message id is queued or part of the in-flight batch.
    pub fn contains(&self, message_id: &str) -> bool {
        self.in_flight.contains(message_id)
            || self.items.iter().any(|i| i.message_id == message_id)
    }

    /// Insert respecting priority: high and urgent items go after existing
    /// high items but ahead of everything else; others go to the back.
    pub fn insert(&mut self, item: QueuedItem) {
        use crate::pipeline::types::Priority;

        if item.priority >= Priority::High {
            let pos = self
                .items
                .iter()
                .position(|i| i.priority < Priority::High)
                .unwrap_or(self.items.len());
            self.items.insert(pos, item);
        } else {
            self.items.push_back(item);
        }
    }

    /// Put retried items back at the front, keeping their relative order.
    pub fn requeue_front(&mut self, items: Vec<QueuedItem>) {
        for item in items.into_iter().rev() {
            self.items.push_front(item);
        }
    }

    pub fn oldest_enqueued_at(&self) -> Option<Instant> {
        self.items.iter().map(|i| i.enqueued_at).min()
    }

    /// Abort and drop the pending timer, if any.
    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
        }
    }
}

/// One tenant's queue, shared between the enqueue path, timers and the ticker.
#[derive(Debug)]
pub struct TenantSlot {
    tenant_id: String,
    state: Mutex<TenantState>,
}

impl TenantSlot {
    fn new(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            state: Mutex::new(TenantState::default()),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Lock the slot state. Never hold the guard across an `.await`.
    pub fn lock(&self) -> MutexGuard<'_, TenantState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Map of tenant id to slot.
#[derive(Debug, Default)]
pub struct TenantRegistry {
    slots: Mutex<HashMap<String, Arc<TenantSlot>>>,
}

impl TenantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, Arc<TenantSlot>>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` against a live (non-retired) slot, creating it if needed.
    /// `f` runs under the slot lock.
    pub fn with_state<R>(
        &self,
        tenant_id: &str,
        f: impl FnOnce(&Arc<TenantSlot>, &mut TenantState) -> R,
    ) -> (Arc<TenantSlot>, R) {
        loop {
            let slot = {
                let mut map = self.map();
                Arc::clone(map.entry(tenant_id.to_string()).or_insert_with(|| {
                    debug!(tenant_id, "Tenant queue created");
                    Arc::new(TenantSlot::new(tenant_id))
                }))
            };
            let mut state = slot.lock();
            if state.retired {
                continue;
            }
            let result = f(&slot, &mut state);
            drop(state);
            return (slot, result);
        }
    }

    pub fn get(&self, tenant_id: &str) -> Option<Arc<TenantSlot>> {
        self.map().get(tenant_id).cloned()
    }

    /// Snapshot of all live slots.
    pub fn tenants(&self) -> Vec<Arc<TenantSlot>> {
        self.map().values().cloned().collect()
    }

    /// Remove a tenant's slot if it is idle. Returns whether it was removed.
    pub fn remove_if_idle(&self, tenant_id: &str) -> bool {
        let mut map = self.map();
        let Some(slot) = map.get(tenant_id).cloned() else {
            return false;
        };
        let mut state = slot.lock();
        if !state.is_idle() {
            return false;
        }
        state.retired = true;
        drop(state);
        map.remove(tenant_id);
        debug!(tenant_id, "Tenant queue removed");
        true
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }
}
