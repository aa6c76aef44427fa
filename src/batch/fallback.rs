//! Individual processing for items that should not wait in a batch.
//!
//! Each submitted item gets its own tracked task: one single-item
//! `analyze` call, retried with exponential backoff. Backoff sleeps are
//! cancelled on shutdown and the item is left queued for the next run.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::{QueuedItem, complete_item, fail_item};
use crate::config::FallbackConfig;
use crate::error::ExtractionError;
use crate::extraction::Extractor;
use crate::metrics::{MetricsRecorder, TimedMetric};
use crate::notify::Notifier;
use crate::pipeline::types::Priority;
use crate::store::{MessageStore, OutcomePath};

/// Why an item bypasses batching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    Urgent,
    Oversized,
    UrgencyKeyword,
    /// The batch call succeeded but the service rejected this item.
    Degraded,
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Urgent => "urgent",
            Self::Oversized => "oversized",
            Self::UrgencyKeyword => "urgency_keyword",
            Self::Degraded => "degraded",
        }
    }
}

pub struct FallbackProcessor {
    config: FallbackConfig,
    extractor: Arc<dyn Extractor>,
    store: Arc<dyn MessageStore>,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<dyn MetricsRecorder>,
    keywords: Option<Regex>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    in_flight: Mutex<HashSet<String>>,
}

impl FallbackProcessor {
    pub fn new(
        config: FallbackConfig,
        extractor: Arc<dyn Extractor>,
        store: Arc<dyn MessageStore>,
        notifier: Arc<dyn Notifier>,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Arc<Self> {
        let keywords = keyword_pattern(&config.urgency_keywords);
        Arc::new(Self {
            config,
            extractor,
            store,
            notifier,
            metrics,
            keywords,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    /// Whether an item should skip the batch queue, and why.
    pub fn eligibility(&self, item: &QueuedItem) -> Option<FallbackReason> {
        if item.priority == Priority::Urgent {
            return Some(FallbackReason::Urgent);
        }
        if item.content_len() > self.config.max_content_chars {
            return Some(FallbackReason::Oversized);
        }
        let keywords = self.keywords.as_ref()?;
        (keywords.is_match(&item.subject) || keywords.is_match(&item.body))
            .then_some(FallbackReason::UrgencyKeyword)
    }

    /// Start processing an item. Returns `false` if the same message is
    /// already being processed here.
    pub fn submit(self: &Arc<Self>, item: QueuedItem, reason: FallbackReason) -> bool {
        if !self.in_flight().insert(item.message_id.clone()) {
            debug!(message_id = %item.message_id, "Fallback already in flight");
            return false;
        }

        info!(
            message_id = %item.message_id,
            tenant_id = %item.tenant_id,
            reason = reason.as_str(),
            "Processing item individually"
        );

        let this = Arc::clone(self);
        self.tasks.spawn(async move {
            let message_id = item.message_id.clone();
            this.process(item).await;
            this.in_flight().remove(&message_id);
        });
        true
    }

    /// Number of items currently being processed.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight().len()
    }

    /// Cancel pending backoff sleeps and wait for running attempts.
    /// Returns `false` if the timeout elapsed first.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.cancel.cancel();
        self.tasks.close();
        let finished = tokio::time::timeout(timeout, self.tasks.wait()).await.is_ok();
        if finished {
            info!("Fallback processor stopped");
        } else {
            warn!(
                in_flight = self.in_flight_count(),
                "Fallback processor did not finish before shutdown timeout"
            );
        }
        finished
    }

    fn in_flight(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn process(&self, item: QueuedItem) {
        match self.store.is_processed(&item.message_id).await {
            Ok(true) => {
                debug!(message_id = %item.message_id, "Already processed, skipping fallback");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(message_id = %item.message_id, error = %e, "Processed check failed");
            }
        }

        let mut attempt: u32 = 0;
        loop {
            let started = Instant::now();
            let result = self
                .extractor
                .analyze(&item.tenant_id, std::slice::from_ref(&item))
                .await;
            self.metrics.record(
                TimedMetric::new("fallback", "analyze")
                    .label("tenant_id", &item.tenant_id)
                    .label("attempt", attempt + 1)
                    .finish(started.elapsed(), result.is_ok()),
            );

            let err = match result {
                Ok(analysis) => match analysis.attribution_for(&item.message_id) {
                    Some(a) if !a.success => {
                        // Rejected content won't improve on retry.
                        let reason = a
                            .error
                            .clone()
                            .unwrap_or_else(|| "rejected by extraction service".into());
                        warn!(
                            message_id = %item.message_id,
                            error = %reason,
                            "Extraction rejected item"
                        );
                        fail_item(&*self.store, &*self.notifier, &item, &reason).await;
                        return;
                    }
                    _ => {
                        let insights = analysis.insights_for(&item.message_id);
                        complete_item(
                            &*self.store,
                            &*self.notifier,
                            &item,
                            OutcomePath::Fallback,
                            insights,
                        )
                        .await;
                        debug!(message_id = %item.message_id, insights, "Fallback item processed");
                        return;
                    }
                },
                Err(e) => e,
            };

            attempt += 1;
            if attempt > self.config.max_retries {
                error!(
                    message_id = %item.message_id,
                    tenant_id = %item.tenant_id,
                    attempts = attempt,
                    error = %err,
                    "Fallback processing failed permanently"
                );
                fail_item(&*self.store, &*self.notifier, &item, &err.to_string()).await;
                return;
            }

            let delay = self.backoff(attempt, &err);
            warn!(
                message_id = %item.message_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Fallback attempt failed, retrying"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    warn!(
                        message_id = %item.message_id,
                        tenant_id = %item.tenant_id,
                        "Fallback item abandoned on shutdown"
                    );
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// `base_delay * 2^(attempt - 1)`, stretched to honour a rate limit.
    fn backoff(&self, attempt: u32, err: &ExtractionError) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.config.base_delay.saturating_mul(1 << exp);
        match err {
            ExtractionError::RateLimited {
                retry_after: Some(after),
            } => delay.max(*after),
            _ => delay,
        }
    }
}

/// Case-insensitive whole-word alternation of the keywords.
fn keyword_pattern(keywords: &[String]) -> Option<Regex> {
    let words: Vec<String> = keywords
        .iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .map(regex::escape)
        .collect();
    if words.is_empty() {
        return None;
    }
    match Regex::new(&format!(r"(?i)\b(?:{})\b", words.join("|"))) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(error = %e, "Invalid urgency keyword list, keyword fallback disabled");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::test_item;
    use crate::store::RecordStatus;
    use crate::testing::{
        MemoryStore, RecordingMetrics, RecordingNotifier, StubExtractor, seed_record,
    };

    struct Harness {
        processor: Arc<FallbackProcessor>,
        extractor: Arc<StubExtractor>,
        store: Arc<MemoryStore>,
        notifier: Arc<RecordingNotifier>,
    }

    fn config() -> FallbackConfig {
        FallbackConfig {
            max_content_chars: 100,
            urgency_keywords: vec!["urgent".into(), "asap".into()],
            max_retries: 3,
            base_delay: Duration::from_secs(2),
        }
    }

    fn harness_with(extractor: StubExtractor) -> Harness {
        let extractor = Arc::new(extractor);
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let processor = FallbackProcessor::new(
            config(),
            extractor.clone(),
            store.clone(),
            notifier.clone(),
            Arc::new(RecordingMetrics::default()),
        );
        Harness {
            processor,
            extractor,
            store,
            notifier,
        }
    }

    fn harness() -> Harness {
        harness_with(StubExtractor::new())
    }

    #[test]
    fn eligibility_rules() {
        let h = harness();

        let plain = test_item("t", "plain");
        assert_eq!(h.processor.eligibility(&plain), None);

        let mut urgent = test_item("t", "u");
        urgent.priority = Priority::Urgent;
        assert_eq!(h.processor.eligibility(&urgent), Some(FallbackReason::Urgent));

        let mut big = test_item("t", "big");
        big.body = "x".repeat(101);
        assert_eq!(h.processor.eligibility(&big), Some(FallbackReason::Oversized));

        let mut keyword = test_item("t", "kw");
        keyword.subject = "Need this ASAP please".into();
        assert_eq!(
            h.processor.eligibility(&keyword),
            Some(FallbackReason::UrgencyKeyword)
        );

        let mut partial = test_item("t", "partial");
        partial.body = "an insurgent campaign".into();
        assert_eq!(h.processor.eligibility(&partial), None);
    }

    #[test]
    fn empty_keyword_list_disables_keyword_rule() {
        assert!(keyword_pattern(&[]).is_none());
        assert!(keyword_pattern(&["  ".into()]).is_none());
        let re = keyword_pattern(&["a.b".into()]).unwrap();
        assert!(re.is_match("see A.B now"));
        assert!(!re.is_match("see axb now"));
    }

    #[tokio::test(start_paused = true)]
    async fn success_marks_processed_and_notifies() {
        let h = harness();
        let item = test_item("acme", "m1");
        seed_record(&h.store, &item).await;

        assert!(h.processor.submit(item, FallbackReason::Urgent));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(h.store.status("m1"), Some(RecordStatus::Processed));
        let outcomes = h.store.outcomes();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].path, OutcomePath::Fallback);
        assert_eq!(outcomes[0].insight_count, 1);
        let sent = h.notifier.for_message("m1");
        assert_eq!(sent.len(), 1);
        assert!(sent[0].is_success());
        assert_eq!(h.processor.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_exponential_backoff() {
        let h = harness();
        h.extractor.fail_next(2);
        let item = test_item("acme", "m1");
        seed_record(&h.store, &item).await;

        let start = Instant::now();
        h.processor.submit(item, FallbackReason::UrgencyKeyword);
        tokio::time::sleep(Duration::from_secs(30)).await;

        let calls = h.extractor.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].at - start, Duration::ZERO);
        assert_eq!(calls[1].at - calls[0].at, Duration::from_secs(2));
        assert_eq!(calls[2].at - calls[1].at, Duration::from_secs(4));
        assert_eq!(h.store.status("m1"), Some(RecordStatus::Processed));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_and_notify() {
        let h = harness();
        h.extractor.fail_tenant("acme");
        let item = test_item("acme", "m1");
        seed_record(&h.store, &item).await;

        h.processor.submit(item, FallbackReason::Urgent);
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(h.extractor.times_seen("m1"), 4);
        assert_eq!(h.store.status("m1"), Some(RecordStatus::Failed));
        let sent = h.notifier.for_message("m1");
        assert_eq!(sent.len(), 1);
        assert!(!sent[0].is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_item_fails_without_retry() {
        let h = harness();
        h.extractor.reject("m1");
        let item = test_item("acme", "m1");
        seed_record(&h.store, &item).await;

        h.processor.submit(item, FallbackReason::Degraded);
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(h.extractor.times_seen("m1"), 1);
        assert_eq!(h.store.status("m1"), Some(RecordStatus::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn already_processed_item_is_skipped() {
        let h = harness();
        let item = test_item("acme", "m1");
        seed_record(&h.store, &item).await;
        h.store.mark_processed("m1", "batch").await.unwrap();

        h.processor.submit(item, FallbackReason::Urgent);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(h.extractor.calls().is_empty());
        assert!(h.notifier.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_submit_is_refused_while_in_flight() {
        let h = harness_with(StubExtractor::with_delay(Duration::from_secs(1)));
        let item = test_item("acme", "m1");
        seed_record(&h.store, &item).await;

        assert!(h.processor.submit(item.clone(), FallbackReason::Urgent));
        assert!(!h.processor.submit(item, FallbackReason::Urgent));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.extractor.times_seen("m1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_abandons_items_in_backoff() {
        let h = harness();
        h.extractor.fail_tenant("acme");
        let item = test_item("acme", "m1");
        seed_record(&h.store, &item).await;

        h.processor.submit(item, FallbackReason::Urgent);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.extractor.times_seen("m1"), 1);

        assert!(h.processor.shutdown(Duration::from_secs(5)).await);
        assert_eq!(h.extractor.times_seen("m1"), 1);
        assert_eq!(h.store.status("m1"), Some(RecordStatus::Queued));
        assert!(h.notifier.sent().is_empty());
    }

    #[test]
    fn rate_limit_stretches_backoff() {
        let h = harness();
        let plain = ExtractionError::Timeout;
        assert_eq!(h.processor.backoff(1, &plain), Duration::from_secs(2));
        assert_eq!(h.processor.backoff(3, &plain), Duration::from_secs(8));
        let limited = ExtractionError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(h.processor.backoff(1, &limited), Duration::from_secs(30));
    }
}
