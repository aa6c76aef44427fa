//! Connection supervisor: keeps one mailbox account connected and drains
//! its unseen mail into the dispatcher.
//!
//! ```text
//! Disconnected ─► Connecting ─► Ready ─► Fetching ─► Ready ─► Idle ─┐
//!                     ▲                     ▲                      │
//!                     │                     └──── new mail / poll ─┘
//!                  backoff ◄── Errored ◄── (transport error, any state)
//! ```
//!
//! Reconnects wait `base_delay * 2^attempt` and give up after
//! `max_reconnect_attempts`. Authentication failures are terminal.

use std::fmt;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::imap::MailboxTransport;
use crate::config::{AccountConfig, SupervisorConfig};
use crate::error::{PipelineError, TransportError};
use crate::pipeline::dispatcher::DispatcherHandle;
use crate::pipeline::parser;
use crate::pipeline::types::IngestSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Idle,
    Fetching,
    Errored,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Errored => "errored",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable supervisor status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorStatus {
    pub state: ConnectionState,
    /// Reconnect attempts since the last successful handshake.
    pub attempt: u32,
    pub last_error: Option<String>,
}

impl Default for SupervisorStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempt: 0,
            last_error: None,
        }
    }
}

/// Handle to a running supervisor.
pub struct SupervisorHandle {
    pub account: String,
    pub status: watch::Receiver<SupervisorStatus>,
    pub task: JoinHandle<()>,
}

/// Why the session loop ended.
enum SessionEnd {
    Cancelled,
    /// The dispatcher is gone; nothing left to deliver to.
    DispatcherGone,
}

pub struct ConnectionSupervisor {
    account: AccountConfig,
    config: SupervisorConfig,
    transport: Box<dyn MailboxTransport>,
    dispatcher: DispatcherHandle,
    status: watch::Sender<SupervisorStatus>,
    cancel: CancellationToken,
    attempt: u32,
}

impl ConnectionSupervisor {
    /// Start supervising an account. The task ends on `cancel`, on an
    /// authentication failure, or when reconnect attempts run out.
    pub fn spawn(
        account: AccountConfig,
        config: SupervisorConfig,
        transport: Box<dyn MailboxTransport>,
        dispatcher: DispatcherHandle,
        cancel: CancellationToken,
    ) -> SupervisorHandle {
        let (status, rx) = watch::channel(SupervisorStatus::default());
        let name = account.name.clone();
        let supervisor = Self {
            account,
            config,
            transport,
            dispatcher,
            status,
            cancel,
            attempt: 0,
        };
        SupervisorHandle {
            account: name,
            status: rx,
            task: tokio::spawn(supervisor.run()),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let last_error = match state {
            ConnectionState::Ready => None,
            _ => self.status.borrow().last_error.clone(),
        };
        let previous = self.status.send_replace(SupervisorStatus {
            state,
            attempt: self.attempt,
            last_error,
        });
        if previous.state != state {
            debug!(account = %self.account.name, from = %previous.state, to = %state, "Connection state");
        }
    }

    fn set_errored(&self, err: &TransportError) {
        self.status.send_replace(SupervisorStatus {
            state: ConnectionState::Errored,
            attempt: self.attempt,
            last_error: Some(err.to_string()),
        });
    }

    async fn run(mut self) {
        info!(account = %self.account.name, host = %self.account.imap_host, "Mailbox supervisor started");

        loop {
            self.set_state(ConnectionState::Connecting);
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.transport.connect() => result,
            };

            let err = match connected {
                Ok(()) => {
                    info!(account = %self.account.name, "Mailbox connected");
                    self.attempt = 0;
                    self.set_state(ConnectionState::Ready);
                    match self.session().await {
                        Ok(SessionEnd::Cancelled) => break,
                        Ok(SessionEnd::DispatcherGone) => {
                            warn!(account = %self.account.name, "Dispatcher closed, stopping supervisor");
                            break;
                        }
                        Err(e) => e,
                    }
                }
                Err(e) => e,
            };

            self.transport.close().await;

            if err.is_auth() {
                error!(
                    account = %self.account.name,
                    error = %err,
                    "authentication failed; supervisor stopped until restart"
                );
                self.set_errored(&err);
                self.set_state(ConnectionState::Disconnected);
                return;
            }

            self.set_errored(&err);
            if self.attempt >= self.config.max_reconnect_attempts {
                error!(
                    account = %self.account.name,
                    attempts = self.attempt,
                    error = %err,
                    "Reconnect attempts exhausted; supervisor stopped until restart"
                );
                self.set_state(ConnectionState::Disconnected);
                return;
            }

            let delay = self.backoff_delay();
            warn!(
                account = %self.account.name,
                attempt = self.attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Mailbox connection failed, reconnecting"
            );
            self.attempt += 1;

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.transport.close().await;
        self.set_state(ConnectionState::Disconnected);
        info!(account = %self.account.name, "Mailbox supervisor stopped");
    }

    /// `base_delay * 2^attempt`.
    fn backoff_delay(&self) -> Duration {
        self.config
            .reconnect_base_delay
            .saturating_mul(1u32 << self.attempt.min(20))
    }

    /// Fetch, then wait for the next change, until an error or cancellation.
    async fn session(&mut self) -> Result<SessionEnd, TransportError> {
        loop {
            self.set_state(ConnectionState::Fetching);
            if let Some(end) = self.fetch_and_dispatch().await? {
                return Ok(end);
            }
            self.set_state(ConnectionState::Ready);

            self.set_state(ConnectionState::Idle);
            if self.config.use_idle && self.transport.supports_idle() {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(SessionEnd::Cancelled),
                    changed = self.transport.wait_for_change(self.config.idle_timeout) => {
                        if changed? {
                            debug!(account = %self.account.name, "New mail signalled");
                        }
                    }
                }
            } else {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(SessionEnd::Cancelled),
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }
    }

    /// Hand every unseen message to the dispatcher; mark it seen once the
    /// dispatcher has handled it.
    async fn fetch_and_dispatch(&mut self) -> Result<Option<SessionEnd>, TransportError> {
        let mails = self.transport.fetch_unseen().await?;
        if !mails.is_empty() {
            debug!(account = %self.account.name, count = mails.len(), "Fetched unseen mail");
        }

        for mail in mails {
            if self.cancel.is_cancelled() {
                return Ok(Some(SessionEnd::Cancelled));
            }

            let sender = parser::parse(&mail.raw, mail.uid).sender;
            if sender.eq_ignore_ascii_case(&self.account.address) {
                debug!(account = %self.account.name, uid = mail.uid, "Skipping self-sent mail");
                self.transport.mark_seen(mail.uid).await?;
                continue;
            }
            if !is_sender_allowed(&self.account.allowed_senders, &sender) {
                warn!(account = %self.account.name, sender = %sender, "Blocked mail from sender");
                self.transport.mark_seen(mail.uid).await?;
                continue;
            }

            let source = IngestSource::Mailbox {
                account: self.account.name.clone(),
            };
            match self
                .dispatcher
                .submit(mail.raw, source, mail.uid, Vec::new())
                .await
            {
                Ok(_) => self.transport.mark_seen(mail.uid).await?,
                Err(PipelineError::DispatcherClosed | PipelineError::ShuttingDown) => {
                    return Ok(Some(SessionEnd::DispatcherGone));
                }
                Err(e) => warn!(
                    account = %self.account.name,
                    uid = mail.uid,
                    error = %e,
                    "Dispatch failed; message left unseen"
                ),
            }
        }
        Ok(None)
    }
}

/// Sender allow-list check: `*`, `@domain`, `domain`, or an exact address.
/// An empty list allows nobody.
pub fn is_sender_allowed(allowed: &[String], email: &str) -> bool {
    if allowed.is_empty() {
        return false;
    }
    if allowed.iter().any(|a| a == "*") {
        return true;
    }
    let email_lower = email.to_lowercase();
    allowed.iter().any(|a| {
        if a.starts_with('@') {
            email_lower.ends_with(&a.to_lowercase())
        } else if a.contains('@') {
            a.eq_ignore_ascii_case(email)
        } else {
            email_lower.ends_with(&format!("@{}", a.to_lowercase()))
        }
    })
}
