//! Submission listener: a minimal authenticated SMTP server.
//!
//! Clients must `AUTH` (PLAIN or LOGIN) against the static user list
//! before `MAIL`/`RCPT`/`DATA`. Accepted messages go to the dispatcher and
//! the client only gets `250` once the dispatcher has handled them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::SubmissionConfig;
use crate::error::TransportError;
use crate::pipeline::dispatcher::DispatcherHandle;
use crate::pipeline::types::IngestSource;

/// Longest command line accepted outside `DATA`.
const MAX_COMMAND_LEN: usize = 4096;
/// Most bytes of one `DATA` line read at a time; longer lines arrive in pieces.
const DATA_CHUNK: usize = 8192;

struct Shared {
    hostname: String,
    users: HashMap<String, SecretString>,
    max_message_bytes: usize,
    dispatcher: DispatcherHandle,
    sequence: AtomicU32,
}

impl Shared {
    /// Secrets are compared in constant time.
    fn check(&self, username: &str, secret: &str) -> bool {
        self.users.get(username).is_some_and(|stored| {
            bool::from(stored.expose_secret().as_bytes().ct_eq(secret.as_bytes()))
        })
    }
}

pub struct SubmissionListener {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl SubmissionListener {
    pub async fn bind(
        config: &SubmissionConfig,
        dispatcher: DispatcherHandle,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(&config.bind).await?;
        let users = config
            .users
            .iter()
            .map(|u| (u.username.clone(), u.secret.clone()))
            .collect();
        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                hostname: config.hostname.clone(),
                users,
                max_message_bytes: config.max_message_bytes,
                dispatcher,
                sequence: AtomicU32::new(0),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `cancel` fires, then wait up to `grace`
    /// for open sessions to finish their current transaction.
    pub fn spawn(self, cancel: CancellationToken, grace: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let addr = self.listener.local_addr().ok();
            info!(addr = ?addr, "Submission listener started");
            let sessions = TaskTracker::new();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = self.listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "Submission connection accepted");
                            let session = Session::new(Arc::clone(&self.shared), peer);
                            sessions.spawn(session.run(stream, cancel.clone()));
                        }
                        Err(e) => warn!(error = %e, "Accept failed"),
                    },
                }
            }

            drop(self.listener);
            sessions.close();
            if tokio::time::timeout(grace, sessions.wait()).await.is_err() {
                warn!(
                    open = sessions.len(),
                    "Submission sessions still open at shutdown deadline"
                );
            }
            info!("Submission listener stopped");
        })
    }
}

// ── Session ─────────────────────────────────────────────────────────

struct Session {
    shared: Arc<Shared>,
    peer: SocketAddr,
    user: Option<String>,
    mail_from: Option<String>,
    recipients: Vec<String>,
}

/// What to do after a command.
enum Flow {
    Continue,
    Quit,
}

impl Session {
    fn new(shared: Arc<Shared>, peer: SocketAddr) -> Self {
        Self {
            shared,
            peer,
            user: None,
            mail_from: None,
            recipients: Vec::new(),
        }
    }

    async fn run(mut self, stream: TcpStream, cancel: CancellationToken) {
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);

        if let Err(e) = self.serve(&mut reader, &mut write, cancel).await {
            debug!(peer = %self.peer, error = %e, "Submission session ended with error");
        }
        let _ = write.shutdown().await;
    }

    async fn serve(
        &mut self,
        reader: &mut BufReader<OwnedReadHalf>,
        write: &mut OwnedWriteHalf,
        cancel: CancellationToken,
    ) -> std::io::Result<()> {
        reply(write, &format!("220 {} ESMTP ready", self.shared.hostname)).await?;

        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    reply(write, "421 4.3.2 Service shutting down").await?;
                    return Ok(());
                }
                line = read_line(reader, MAX_COMMAND_LEN) => line?,
            };
            let Some(line) = line else {
                return Ok(());
            };

            let (verb, arg) = match line.split_once(' ') {
                Some((v, a)) => (v.to_ascii_uppercase(), a.trim().to_string()),
                None => (line.to_ascii_uppercase(), String::new()),
            };

            let flow = match verb.as_str() {
                "EHLO" => {
                    let max = self.shared.max_message_bytes;
                    let host = &self.shared.hostname;
                    reply(
                        write,
                        &format!("250-{host}\r\n250-AUTH PLAIN LOGIN\r\n250-SIZE {max}\r\n250 8BITMIME"),
                    )
                    .await?;
                    Flow::Continue
                }
                "HELO" => {
                    reply(write, &format!("250 {}", self.shared.hostname)).await?;
                    Flow::Continue
                }
                "AUTH" => {
                    self.auth(reader, write, &arg).await?;
                    Flow::Continue
                }
                "MAIL" => {
                    self.mail(write, &arg).await?;
                    Flow::Continue
                }
                "RCPT" => {
                    self.rcpt(write, &arg).await?;
                    Flow::Continue
                }
                "DATA" => {
                    self.data(reader, write).await?;
                    Flow::Continue
                }
                "RSET" => {
                    self.reset();
                    reply(write, "250 2.0.0 OK").await?;
                    Flow::Continue
                }
                "NOOP" => {
                    reply(write, "250 2.0.0 OK").await?;
                    Flow::Continue
                }
                "QUIT" => {
                    reply(write, "221 2.0.0 Bye").await?;
                    Flow::Quit
                }
                _ => {
                    reply(write, "502 5.5.2 Command not recognized").await?;
                    Flow::Continue
                }
            };
            if let Flow::Quit = flow {
                return Ok(());
            }
        }
    }

    fn reset(&mut self) {
        self.mail_from = None;
        self.recipients.clear();
    }

    async fn auth(
        &mut self,
        reader: &mut BufReader<OwnedReadHalf>,
        write: &mut OwnedWriteHalf,
        arg: &str,
    ) -> std::io::Result<()> {
        if self.user.is_some() {
            return reply(write, "503 5.5.1 Already authenticated").await;
        }
        let (mechanism, initial) = match arg.split_once(' ') {
            Some((m, i)) => (m.to_ascii_uppercase(), Some(i.trim().to_string())),
            None => (arg.to_ascii_uppercase(), None),
        };

        let credentials = match mechanism.as_str() {
            "PLAIN" => {
                let response = match initial {
                    Some(i) => i,
                    None => match self.challenge(reader, write, "").await? {
                        Some(r) => r,
                        None => return reply(write, "501 5.5.2 Authentication cancelled").await,
                    },
                };
                decode_plain(&response)
            }
            "LOGIN" => {
                let user = match initial {
                    Some(i) => Some(i),
                    None => self.challenge(reader, write, "VXNlcm5hbWU6").await?,
                };
                let Some(user) = user else {
                    return reply(write, "501 5.5.2 Authentication cancelled").await;
                };
                let Some(pass) = self.challenge(reader, write, "UGFzc3dvcmQ6").await? else {
                    return reply(write, "501 5.5.2 Authentication cancelled").await;
                };
                decode_b64(&user).zip(decode_b64(&pass))
            }
            _ => return reply(write, "504 5.5.4 Unrecognized authentication type").await,
        };

        match credentials {
            Some((user, secret)) if self.shared.check(&user, &secret) => {
                info!(username = %user, peer = %self.peer, "Submission client authenticated");
                self.user = Some(user);
                reply(write, "235 2.7.0 Authentication successful").await
            }
            Some((user, _)) => {
                warn!(username = %user, peer = %self.peer, "Submission authentication failed");
                reply(write, "535 5.7.8 Authentication credentials invalid").await
            }
            None => {
                warn!(peer = %self.peer, "Malformed submission credentials");
                reply(write, "535 5.7.8 Authentication credentials invalid").await
            }
        }
    }

    /// Send a `334` challenge and read the client's answer. `None` when the
    /// client cancels with `*` or disconnects.
    async fn challenge(
        &self,
        reader: &mut BufReader<OwnedReadHalf>,
        write: &mut OwnedWriteHalf,
        prompt: &str,
    ) -> std::io::Result<Option<String>> {
        reply(write, &format!("334 {prompt}")).await?;
        Ok(read_line(reader, MAX_COMMAND_LEN)
            .await?
            .filter(|answer| answer != "*"))
    }

    async fn mail(&mut self, write: &mut OwnedWriteHalf, arg: &str) -> std::io::Result<()> {
        if self.user.is_none() {
            return reply(write, "530 5.7.0 Authentication required").await;
        }
        let Some(from) = path_argument(arg, "FROM:") else {
            return reply(write, "501 5.5.4 Syntax: MAIL FROM:<address>").await;
        };
        self.reset();
        self.mail_from = Some(from);
        reply(write, "250 2.1.0 OK").await
    }

    async fn rcpt(&mut self, write: &mut OwnedWriteHalf, arg: &str) -> std::io::Result<()> {
        if self.user.is_none() {
            return reply(write, "530 5.7.0 Authentication required").await;
        }
        if self.mail_from.is_none() {
            return reply(write, "503 5.5.1 Need MAIL first").await;
        }
        match path_argument(arg, "TO:") {
            Some(to) if !to.is_empty() => {
                self.recipients.push(to);
                reply(write, "250 2.1.5 OK").await
            }
            _ => reply(write, "501 5.5.4 Syntax: RCPT TO:<address>").await,
        }
    }

    async fn data(
        &mut self,
        reader: &mut BufReader<OwnedReadHalf>,
        write: &mut OwnedWriteHalf,
    ) -> std::io::Result<()> {
        let Some(user) = self.user.clone() else {
            return reply(write, "530 5.7.0 Authentication required").await;
        };
        if self.recipients.is_empty() {
            return reply(write, "503 5.5.1 Need RCPT first").await;
        }
        reply(write, "354 End data with <CR><LF>.<CR><LF>").await?;

        let max = self.shared.max_message_bytes;
        let mut raw = Vec::new();
        let mut oversized = false;
        let mut line = Vec::with_capacity(DATA_CHUNK);
        let mut at_line_start = true;
        loop {
            line.clear();
            let n = (&mut *reader)
                .take(DATA_CHUNK as u64)
                .read_until(b'\n', &mut line)
                .await?;
            if n == 0 {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }
            if at_line_start && (line == b".\r\n" || line == b".\n") {
                break;
            }
            let content = if at_line_start && line.starts_with(b"..") {
                &line[1..]
            } else {
                &line[..]
            };
            if raw.len() + content.len() > max {
                oversized = true;
            }
            if !oversized {
                raw.extend_from_slice(content);
            }
            at_line_start = line.ends_with(b"\n");
        }

        let recipients = std::mem::take(&mut self.recipients);
        self.reset();

        if oversized {
            warn!(username = %user, peer = %self.peer, max_bytes = max, "Submitted message too large");
            return reply(write, "552 5.3.4 Message exceeds size limit").await;
        }

        let sequence = self.shared.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let result = self
            .shared
            .dispatcher
            .submit(
                raw,
                IngestSource::Submission {
                    username: user.clone(),
                },
                sequence,
                recipients,
            )
            .await;
        match result {
            Ok(outcome) => {
                debug!(username = %user, message_id = %outcome.message_id(), "Submission accepted");
                reply(
                    write,
                    &format!("250 2.0.0 OK {} {}", outcome.label(), outcome.message_id()),
                )
                .await
            }
            Err(e) => {
                warn!(username = %user, error = %e, "Submission could not be dispatched");
                reply(write, &format!("451 4.3.0 {e}")).await
            }
        }
    }
}

async fn reply(write: &mut OwnedWriteHalf, text: &str) -> std::io::Result<()> {
    write.write_all(text.as_bytes()).await?;
    write.write_all(b"\r\n").await?;
    write.flush().await
}

/// Read one CRLF-terminated line without its terminator. `None` on EOF.
async fn read_line(
    reader: &mut BufReader<OwnedReadHalf>,
    limit: usize,
) -> std::io::Result<Option<String>> {
    let mut buf = Vec::new();
    let n = (&mut *reader)
        .take(limit as u64)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if !buf.ends_with(b"\n") {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "command line too long",
        ));
    }
    let line = String::from_utf8_lossy(&buf);
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

/// Address inside `FROM:<addr>` / `TO:<addr>`, ignoring trailing parameters.
fn path_argument(arg: &str, prefix: &str) -> Option<String> {
    let head = arg.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    let rest = arg[prefix.len()..].trim_start();
    let path = match rest.strip_prefix('<') {
        Some(inner) => inner.split('>').next()?,
        None => rest.split_whitespace().next().unwrap_or(""),
    };
    Some(path.trim().to_string())
}

fn decode_b64(s: &str) -> Option<String> {
    let bytes = BASE64.decode(s.trim()).ok()?;
    String::from_utf8(bytes).ok()
}

/// `authzid \0 authcid \0 passwd`.
fn decode_plain(s: &str) -> Option<(String, String)> {
    let decoded = decode_b64(s)?;
    let mut parts = decoded.split('\0');
    let _authzid = parts.next()?;
    let user = parts.next()?;
    let pass = parts.next()?;
    Some((user.to_string(), pass.to_string()))
}
