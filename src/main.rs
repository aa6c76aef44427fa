use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use mail_intake::batch::{BatchQueue, FallbackProcessor};
use mail_intake::channels::{ConnectionSupervisor, ImapTransport, SubmissionListener};
use mail_intake::config::AppConfig;
use mail_intake::extraction::{Extractor, HttpExtractor};
use mail_intake::metrics::{MetricsRecorder, TracingMetrics};
use mail_intake::notify::{LogNotifier, Notifier, SmtpNotifier};
use mail_intake::pipeline::dispatcher::Dispatcher;
use mail_intake::pipeline::handler::StoreWorkHandler;
use mail_intake::store::{LibSqlStore, MessageStore};

/// Requests buffered between the sources and the dispatcher.
const DISPATCH_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AppConfig::from_env().context("invalid configuration")?;

    eprintln!("📬 Mail Intake v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Accounts: {}", config.accounts.len());
    match &config.submission {
        Some(s) => eprintln!("   Submission: {} ({} users)", s.bind, s.users.len()),
        None => eprintln!("   Submission: disabled"),
    }
    eprintln!("   Extraction: {}", config.extraction.url);

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn MessageStore> = Arc::new(
        LibSqlStore::new_local(Path::new(&config.db_path))
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path))?,
    );
    eprintln!("   Database: {}", config.db_path);

    // ── Batching ─────────────────────────────────────────────────────────
    let extractor: Arc<dyn Extractor> = Arc::new(HttpExtractor::new(&config.extraction)?);
    let notifier: Arc<dyn Notifier> = match config.accounts.first() {
        Some(account) => Arc::new(SmtpNotifier::new(account)),
        None => Arc::new(LogNotifier),
    };
    let metrics: Arc<dyn MetricsRecorder> = Arc::new(TracingMetrics);

    let fallback = FallbackProcessor::new(
        config.fallback.clone(),
        Arc::clone(&extractor),
        Arc::clone(&store),
        Arc::clone(&notifier),
        Arc::clone(&metrics),
    );
    let queue = BatchQueue::new(
        config.batch.clone(),
        extractor,
        Arc::clone(&store),
        notifier,
        metrics,
        Arc::clone(&fallback),
    );
    // Stopped by the queue's own shutdown.
    let _ticker = queue.spawn_ticker();

    // ── Dispatcher ───────────────────────────────────────────────────────
    let dispatcher = Dispatcher::new(
        &config.routing,
        Arc::clone(&store),
        Arc::new(StoreWorkHandler::new(Arc::clone(&store))),
        Arc::clone(&queue),
    );
    match dispatcher.reconcile_pending().await {
        Ok(0) => {}
        Ok(n) => eprintln!("   Recovered {} pending intelligence items", n),
        Err(e) => tracing::warn!(error = %e, "Startup reconciliation failed"),
    }
    let dispatcher_cancel = CancellationToken::new();
    let (dispatch, dispatcher_task) =
        dispatcher.spawn(DISPATCH_CAPACITY, dispatcher_cancel.clone());

    // ── Sources ──────────────────────────────────────────────────────────
    let sources_cancel = CancellationToken::new();
    let mut supervisors = Vec::new();
    for account in &config.accounts {
        let transport = Box::new(ImapTransport::new(account));
        supervisors.push(ConnectionSupervisor::spawn(
            account.clone(),
            config.supervisor.clone(),
            transport,
            dispatch.clone(),
            sources_cancel.clone(),
        ));
    }

    let submission_task = match &config.submission {
        Some(submission) => {
            let listener = SubmissionListener::bind(submission, dispatch.clone())
                .await
                .with_context(|| {
                    format!("failed to bind submission listener on {}", submission.bind)
                })?;
            Some(listener.spawn(sources_cancel.clone(), config.shutdown_grace))
        }
        None => None,
    };
    drop(dispatch);

    eprintln!("   Running. Ctrl-C to stop.\n");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    // Sources first so nothing new arrives, then drain inward.
    let deadline = tokio::time::Instant::now() + config.shutdown_grace;
    sources_cancel.cancel();
    let (accounts, tasks): (Vec<_>, Vec<_>) =
        supervisors.into_iter().map(|h| (h.account, h.task)).unzip();
    if tokio::time::timeout_at(deadline, futures::future::join_all(tasks))
        .await
        .is_err()
    {
        tracing::warn!(accounts = ?accounts, "Supervisors did not stop in time");
    }
    if let Some(task) = submission_task {
        let _ = tokio::time::timeout_at(deadline, task).await;
    }

    dispatcher_cancel.cancel();
    if tokio::time::timeout_at(deadline, dispatcher_task).await.is_err() {
        tracing::warn!("Dispatcher did not stop in time");
    }

    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
    let report = queue.shutdown(remaining).await;
    tracing::info!(
        flushed_batches = report.flushed_batches,
        abandoned = report.abandoned,
        "Batch queue drained"
    );

    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
    if !fallback.shutdown(remaining).await {
        tracing::warn!("Fallback work abandoned at shutdown");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
