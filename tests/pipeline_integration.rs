//! End-to-end tests: SMTP submission → dispatcher → batching → store.
//!
//! Each test binds the submission listener on a random port, talks SMTP to
//! it over a real socket and checks what lands in an in-memory libSQL store.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use secrecy::SecretString;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use mail_intake::batch::{BatchQueue, FallbackProcessor, QueuedItem};
use mail_intake::channels::SubmissionListener;
use mail_intake::config::{
    BatchConfig, FallbackConfig, RoutingConfig, SubmissionConfig, SubmissionUser,
};
use mail_intake::error::{ExtractionError, NotifyError};
use mail_intake::extraction::{Analysis, Extractor, Finding};
use mail_intake::metrics::TracingMetrics;
use mail_intake::notify::{Notification, Notifier};
use mail_intake::pipeline::dispatcher::Dispatcher;
use mail_intake::pipeline::handler::StoreWorkHandler;
use mail_intake::store::{LibSqlStore, MessageStore, RecordStatus};

/// Maximum time any wait in a test may take before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Extractor that yields one finding per item and records each call.
#[derive(Default)]
struct StubExtractor {
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl StubExtractor {
    fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Extractor for StubExtractor {
    async fn analyze(
        &self,
        tenant_id: &str,
        items: &[QueuedItem],
    ) -> Result<Analysis, ExtractionError> {
        let ids: Vec<String> = items.iter().map(|i| i.message_id.clone()).collect();
        self.calls
            .lock()
            .unwrap()
            .push((tenant_id.to_string(), ids.clone()));
        Ok(Analysis {
            findings: ids
                .into_iter()
                .map(|id| Finding {
                    kind: "fact".into(),
                    summary: format!("from {id}"),
                    message_ids: vec![id],
                    confidence: None,
                })
                .collect(),
            attributions: Vec::new(),
        })
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, n: &Notification) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(n.clone());
        Ok(())
    }
}

struct Harness {
    addr: SocketAddr,
    store: Arc<LibSqlStore>,
    extractor: Arc<StubExtractor>,
    notifier: Arc<RecordingNotifier>,
    queue: Arc<BatchQueue>,
    cancel: CancellationToken,
}

async fn start() -> Harness {
    let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
    let extractor = Arc::new(StubExtractor::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let metrics = Arc::new(TracingMetrics);

    let fallback = FallbackProcessor::new(
        FallbackConfig {
            base_delay: Duration::from_millis(50),
            ..FallbackConfig::default()
        },
        extractor.clone(),
        store.clone(),
        notifier.clone(),
        metrics.clone(),
    );
    let queue = BatchQueue::new(
        BatchConfig {
            max_batch_size: 3,
            max_wait: Duration::from_secs(60),
            immediate_flush_delay: Duration::from_millis(20),
            retry_delay: Duration::from_millis(100),
            ..BatchConfig::default()
        },
        extractor.clone(),
        store.clone(),
        notifier.clone(),
        metrics,
        fallback,
    );

    let routing = RoutingConfig {
        catch_all: vec![],
        direct_task: vec!["tasks@corp.io".into()],
        intelligence: vec!["intel@corp.io".into()],
        default_tenant: "default".into(),
    };
    let dispatcher = Dispatcher::new(
        &routing,
        store.clone(),
        Arc::new(StoreWorkHandler::new(store.clone())),
        queue.clone(),
    );
    let cancel = CancellationToken::new();
    let (handle, _task) = dispatcher.spawn(16, cancel.clone());

    let config = SubmissionConfig {
        bind: "127.0.0.1:0".into(),
        hostname: "intake.test".into(),
        users: vec![SubmissionUser {
            username: "scanner".into(),
            secret: SecretString::from("s3cret".to_string()),
        }],
        max_message_bytes: 64 * 1024,
    };
    let listener = SubmissionListener::bind(&config, handle).await.unwrap();
    let addr = listener.local_addr().unwrap();
    listener.spawn(cancel.clone(), Duration::from_secs(1));

    Harness {
        addr,
        store,
        extractor,
        notifier,
        queue,
        cancel,
    }
}

struct SmtpClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl SmtpClient {
    async fn login(addr: SocketAddr) -> Self {
        let (r, w) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut client = Self {
            reader: BufReader::new(r),
            writer: w,
        };
        assert!(client.read_reply().await.starts_with("220"));
        client.send("EHLO tester").await;
        let auth = BASE64.encode("\0scanner\0s3cret");
        assert!(
            client
                .send(&format!("AUTH PLAIN {auth}"))
                .await
                .starts_with("235")
        );
        client
    }

    async fn read_reply(&mut self) -> String {
        let mut out = String::new();
        loop {
            let mut line = String::new();
            timeout(TEST_TIMEOUT, self.reader.read_line(&mut line))
                .await
                .expect("reply timed out")
                .unwrap();
            out.push_str(&line);
            if line.len() < 4 || line.as_bytes()[3] != b'-' {
                return out;
            }
        }
    }

    async fn send(&mut self, line: &str) -> String {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\r\n").await.unwrap();
        self.read_reply().await
    }

    /// Run one full transaction; returns the final reply.
    async fn deliver(&mut self, rcpt: &str, message_id: &str, subject: &str, body: &str) -> String {
        assert!(self.send("MAIL FROM:<alice@example.com>").await.starts_with("250"));
        assert!(self.send(&format!("RCPT TO:<{rcpt}>")).await.starts_with("250"));
        assert!(self.send("DATA").await.starts_with("354"));
        let message = format!(
            "From: Alice <alice@example.com>\r\n\
             To: {rcpt}\r\n\
             Subject: {subject}\r\n\
             Message-ID: <{message_id}>\r\n\
             \r\n\
             {body}\r\n."
        );
        self.send(&message).await
    }
}

async fn wait_for_status(store: &LibSqlStore, message_id: &str, want: RecordStatus) {
    let polled = timeout(TEST_TIMEOUT, async {
        loop {
            if store.record_status(message_id).await.unwrap() == Some(want) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "{message_id} never reached {want:?}");
}

#[tokio::test]
async fn intelligence_submissions_are_batched_per_tenant() {
    let h = start().await;
    let mut client = SmtpClient::login(h.addr).await;

    for i in 1..=3 {
        let reply = client
            .deliver(
                "intel+acme@corp.io",
                &format!("intel-{i}@scanner.test"),
                &format!("Report {i}"),
                "Quarterly numbers attached.",
            )
            .await;
        assert!(reply.starts_with("250"), "{reply}");
        assert!(reply.contains("queued"));
    }

    for i in 1..=3 {
        wait_for_status(&h.store, &format!("intel-{i}@scanner.test"), RecordStatus::Processed)
            .await;
        assert_eq!(
            h.store
                .outcome_count(&format!("intel-{i}@scanner.test"))
                .await
                .unwrap(),
            1
        );
    }

    let calls = h.extractor.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "acme");
    assert_eq!(calls[0].1.len(), 3);

    let sent = h.notifier.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 3);
    assert!(sent.iter().all(|n| n.is_success() && n.tenant_id == "acme"));
    assert!(sent.iter().all(|n| n.recipient == "alice@example.com"));

    // The sender is now bound to the tenant.
    assert_eq!(
        h.store.tenant_for_sender("alice@example.com").await.unwrap(),
        Some("acme".to_string())
    );
    assert_eq!(h.queue.queued_len("acme"), 0);
    h.cancel.cancel();
}

#[tokio::test]
async fn resubmitted_message_is_a_duplicate() {
    let h = start().await;
    let mut client = SmtpClient::login(h.addr).await;

    let first = client
        .deliver("tasks@corp.io", "task-1@scanner.test", "Fix the boiler", "Please.")
        .await;
    assert!(first.contains("work_created"), "{first}");
    wait_for_status(&h.store, "task-1@scanner.test", RecordStatus::Processed).await;

    let second = client
        .deliver("tasks@corp.io", "task-1@scanner.test", "Fix the boiler", "Please.")
        .await;
    assert!(second.starts_with("250"));
    assert!(second.contains("duplicate"), "{second}");
    h.cancel.cancel();
}

#[tokio::test]
async fn urgent_submission_skips_the_batch() {
    let h = start().await;
    let mut client = SmtpClient::login(h.addr).await;

    let reply = client
        .deliver(
            "intel+acme@corp.io",
            "urgent-1@scanner.test",
            "URGENT: outage",
            "Site is down.",
        )
        .await;
    assert!(reply.contains("queued"), "{reply}");

    wait_for_status(&h.store, "urgent-1@scanner.test", RecordStatus::Processed).await;
    let calls = h.extractor.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, vec!["urgent-1@scanner.test".to_string()]);
    assert_eq!(h.queue.queued_len("acme"), 0);
    h.cancel.cancel();
}

#[tokio::test]
async fn unknown_recipient_is_ignored() {
    let h = start().await;
    let mut client = SmtpClient::login(h.addr).await;

    let reply = client
        .deliver("nobody@elsewhere.org", "stray-1@scanner.test", "Hi", "Hello")
        .await;
    assert!(reply.contains("ignored"), "{reply}");
    wait_for_status(&h.store, "stray-1@scanner.test", RecordStatus::Processed).await;
    assert!(h.extractor.calls().is_empty());
    h.cancel.cancel();
}
