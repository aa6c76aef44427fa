//! Submitter notification boundary.
//!
//! The pipeline only says *what* happened to a submission; rendering is
//! up to the notifier.

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use tracing::{info, warn};

use crate::config::AccountConfig;
use crate::error::NotifyError;

/// Outcome reported to a submitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    Processed { insight_count: usize },
    Failed { error: String },
}

/// Structured outcome for one submitted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub recipient: String,
    pub message_id: String,
    pub tenant_id: String,
    pub subject: String,
    pub kind: NotificationKind,
}

impl Notification {
    pub fn is_success(&self) -> bool {
        matches!(self.kind, NotificationKind::Processed { .. })
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, n: &Notification) -> Result<(), NotifyError> {
        match &n.kind {
            NotificationKind::Processed { insight_count } => info!(
                recipient = %n.recipient,
                message_id = %n.message_id,
                tenant_id = %n.tenant_id,
                insight_count,
                "Submission processed"
            ),
            NotificationKind::Failed { error } => warn!(
                recipient = %n.recipient,
                message_id = %n.message_id,
                tenant_id = %n.tenant_id,
                error = %error,
                "Submission failed"
            ),
        }
        Ok(())
    }
}

/// Sends a plain-text reply through the account's SMTP relay.
pub struct SmtpNotifier {
    smtp_host: String,
    smtp_port: u16,
    from_address: String,
    password: SecretString,
}

impl SmtpNotifier {
    pub fn new(account: &AccountConfig) -> Self {
        Self {
            smtp_host: account.smtp_host.clone(),
            smtp_port: account.smtp_port,
            from_address: account.address.clone(),
            password: account.password.clone(),
        }
    }

    fn build_message(&self, n: &Notification) -> Result<Message, NotifyError> {
        let (subject, body) = render(n);
        Message::builder()
            .from(
                self.from_address
                    .parse()
                    .map_err(|e| NotifyError::InvalidAddress(format!("{}: {e}", self.from_address)))?,
            )
            .to(n
                .recipient
                .parse()
                .map_err(|e| NotifyError::InvalidAddress(format!("{}: {e}", n.recipient)))?)
            .subject(subject)
            .body(body)
            .map_err(|e| NotifyError::SendFailed {
                reason: format!("Failed to build email: {e}"),
            })
    }
}

/// Minimal subject and body for an outcome.
fn render(n: &Notification) -> (String, String) {
    match &n.kind {
        NotificationKind::Processed { insight_count } => (
            format!("Re: {}", n.subject),
            format!("Your submission was processed ({insight_count} insights)."),
        ),
        NotificationKind::Failed { error } => (
            format!("Re: {}", n.subject),
            format!("Your submission could not be processed: {error}"),
        ),
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn notify(&self, n: &Notification) -> Result<(), NotifyError> {
        let email = self.build_message(n)?;
        let creds = Credentials::new(
            self.from_address.clone(),
            self.password.expose_secret().to_string(),
        );
        let host = self.smtp_host.clone();
        let port = self.smtp_port;
        let recipient = n.recipient.clone();

        // lettre's blocking transport runs off the async workers.
        tokio::task::spawn_blocking(move || {
            let transport = SmtpTransport::relay(&host)
                .map_err(|e| NotifyError::SendFailed {
                    reason: format!("SMTP relay error: {e}"),
                })?
                .port(port)
                .credentials(creds)
                .build();
            transport.send(&email).map_err(|e| NotifyError::SendFailed {
                reason: format!("SMTP send failed: {e}"),
            })?;
            Ok::<_, NotifyError>(())
        })
        .await
        .map_err(|e| NotifyError::SendFailed {
            reason: format!("SMTP task failed: {e}"),
        })??;

        info!(recipient = %recipient, "Outcome notification sent");
        Ok(())
    }
}
