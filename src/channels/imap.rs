//! Mailbox transport: the IMAP side of a supervised account.
//!
//! `ImapTransport` speaks a small IMAP4rev1 subset over rustls on a
//! blocking socket. Every command runs inside `spawn_blocking`; the session
//! moves into the blocking task and back out again. An abandoned IDLE is
//! ended through a shared stop flag when the transport is closed.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rustls::{ClientConnection, StreamOwned};
use rustls_pki_types::ServerName;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::AccountConfig;
use crate::error::TransportError;

/// One unseen message, raw.
#[derive(Debug, Clone)]
pub struct FetchedMail {
    pub uid: u32,
    pub raw: Vec<u8>,
}

/// Operations the connection supervisor needs from a mailbox.
#[async_trait]
pub trait MailboxTransport: Send {
    /// Connect, authenticate and select the inbox.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Whether the server advertised IDLE on the current connection.
    fn supports_idle(&self) -> bool;

    /// Block in IDLE until the server reports new mail or `timeout`
    /// elapses. Returns whether a change was reported.
    async fn wait_for_change(&mut self, timeout: Duration) -> Result<bool, TransportError>;

    /// Fetch every unseen message without setting `\Seen`.
    async fn fetch_unseen(&mut self) -> Result<Vec<FetchedMail>, TransportError>;

    async fn mark_seen(&mut self, uid: u32) -> Result<(), TransportError>;

    /// Log out and drop the connection. Never fails. Also ends a
    /// `wait_for_change` whose future was dropped, and waits for it.
    async fn close(&mut self);
}

// ── Session (blocking) ──────────────────────────────────────────────

type TlsStream = StreamOwned<ClientConnection, TcpStream>;

/// A byte stream with a TCP socket underneath, for read timeouts.
trait SessionStream: Read + Write {
    fn socket(&self) -> &TcpStream;
}

impl SessionStream for TlsStream {
    fn socket(&self) -> &TcpStream {
        &self.sock
    }
}

/// One line of a command response, with its literal payload if any.
#[derive(Debug, Default)]
struct ResponseLine {
    text: String,
    literal: Option<Vec<u8>>,
}

struct ImapSession<S = TlsStream> {
    reader: BufReader<S>,
    next_tag: u32,
    capabilities: Vec<String>,
    io_timeout: Duration,
    /// Set by the owning transport to end an IDLE early.
    stop: Arc<AtomicBool>,
}

const IO_TIMEOUT: Duration = Duration::from_secs(30);
/// Read slice while idling, so the deadline and stop flag are checked regularly.
const IDLE_POLL: Duration = Duration::from_secs(1);
/// How long `close` lets an interrupted IDLE finish before cutting the socket.
const CLOSE_WAIT: Duration = Duration::from_secs(5);

impl ImapSession<TlsStream> {
    fn open(host: &str, port: u16, stop: Arc<AtomicBool>) -> Result<Self, TransportError> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| TransportError::Protocol(format!("no address for {host}")))?;
        let tcp = TcpStream::connect_timeout(&addr, IO_TIMEOUT)?;
        tcp.set_read_timeout(Some(IO_TIMEOUT))?;
        tcp.set_write_timeout(Some(IO_TIMEOUT))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| TransportError::Tls(format!("invalid server name {host}: {e}")))?;
        let conn = ClientConnection::new(tls_config, server_name)
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        let mut session = Self::with_stream(StreamOwned::new(conn, tcp), stop);
        let greeting = session.read_line()?;
        if !greeting.starts_with("* OK") && !greeting.starts_with("* PREAUTH") {
            return Err(TransportError::Protocol(format!(
                "unexpected greeting: {}",
                greeting.trim_end()
            )));
        }
        Ok(session)
    }
}

impl<S: SessionStream> ImapSession<S> {
    fn with_stream(stream: S, stop: Arc<AtomicBool>) -> Self {
        Self {
            reader: BufReader::new(stream),
            next_tag: 1,
            capabilities: Vec::new(),
            io_timeout: IO_TIMEOUT,
            stop,
        }
    }

    fn stream(&mut self) -> &mut S {
        self.reader.get_mut()
    }

    fn socket(&self) -> &TcpStream {
        self.reader.get_ref().socket()
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        self.socket().set_read_timeout(Some(timeout))?;
        Ok(())
    }

    fn read_line(&mut self) -> Result<String, TransportError> {
        let mut buf = Vec::new();
        let n = self.reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Err(TransportError::Closed);
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        let stream = self.stream();
        stream.write_all(line.as_bytes())?;
        stream.write_all(b"\r\n")?;
        stream.flush()?;
        Ok(())
    }

    fn tag(&mut self) -> String {
        let tag = format!("A{:04}", self.next_tag);
        self.next_tag += 1;
        tag
    }

    /// Send a command and collect its response up to the tagged status.
    /// `NO`/`BAD` become `TransportError::Protocol`.
    fn command(&mut self, command: &str) -> Result<Vec<ResponseLine>, TransportError> {
        let tag = self.tag();
        self.write_line(&format!("{tag} {command}"))?;

        let mut lines = Vec::new();
        loop {
            let mut line = ResponseLine {
                text: self.read_line()?,
                literal: None,
            };
            if let Some(len) = literal_len(&line.text) {
                let mut literal = vec![0u8; len];
                self.reader.read_exact(&mut literal)?;
                line.literal = Some(literal);
                // Rest of the line after the literal, usually ")".
                line.text.push_str(&self.read_line()?);
            }

            if let Some(status) = line.text.strip_prefix(&format!("{tag} ")) {
                if status.starts_with("OK") {
                    return Ok(lines);
                }
                let verb = command.split_whitespace().next().unwrap_or(command);
                return Err(TransportError::Protocol(format!(
                    "{verb} failed: {}",
                    status.trim_end()
                )));
            }
            lines.push(line);
        }
    }

    fn login(&mut self, account: &str, user: &str, password: &SecretString) -> Result<(), TransportError> {
        let command = format!(
            "LOGIN {} {}",
            quote(user),
            quote(password.expose_secret())
        );
        self.command(&command).map_err(|e| match e {
            TransportError::Protocol(reason) => TransportError::Auth {
                account: account.to_string(),
                reason,
            },
            other => other,
        })?;

        let lines = self.command("CAPABILITY")?;
        self.capabilities = lines
            .iter()
            .filter_map(|l| l.text.strip_prefix("* CAPABILITY"))
            .flat_map(|caps| caps.split_whitespace().map(str::to_uppercase))
            .collect();
        Ok(())
    }

    fn search_unseen(&mut self) -> Result<Vec<u32>, TransportError> {
        let lines = self.command("UID SEARCH UNSEEN")?;
        Ok(lines
            .iter()
            .filter_map(|l| l.text.strip_prefix("* SEARCH"))
            .flat_map(|ids| ids.split_whitespace().filter_map(|id| id.parse().ok()))
            .collect())
    }

    fn fetch(&mut self, uid: u32) -> Result<Option<Vec<u8>>, TransportError> {
        let lines = self.command(&format!("UID FETCH {uid} BODY.PEEK[]"))?;
        Ok(lines.into_iter().find_map(|l| l.literal))
    }

    /// Best effort; the server may already be gone.
    fn logout(&mut self) {
        let _ = self.command("LOGOUT");
        let _ = self.socket().shutdown(std::net::Shutdown::Both);
    }

    /// IDLE until an `EXISTS`/`RECENT` update, the deadline, or the stop
    /// flag. A stopped IDLE still ends with `DONE` so the session stays usable.
    fn idle(&mut self, timeout: Duration) -> Result<bool, TransportError> {
        let tag = self.tag();
        self.write_line(&format!("{tag} IDLE"))?;
        let cont = self.read_line()?;
        if !cont.starts_with('+') {
            return Err(TransportError::Protocol(format!(
                "IDLE rejected: {}",
                cont.trim_end()
            )));
        }

        self.set_read_timeout(IDLE_POLL)?;
        let deadline = Instant::now() + timeout;
        let mut changed = false;
        let mut partial = Vec::new();
        while Instant::now() < deadline && !self.stop.load(Ordering::Relaxed) {
            match self.reader.read_until(b'\n', &mut partial) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(_) if partial.ends_with(b"\n") => {
                    let line = String::from_utf8_lossy(&partial).to_uppercase();
                    partial.clear();
                    if line.contains("EXISTS") || line.contains("RECENT") {
                        changed = true;
                        break;
                    }
                    if line.starts_with("* BYE") {
                        return Err(TransportError::Closed);
                    }
                }
                Ok(_) => {}
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.set_read_timeout(self.io_timeout)?;

        self.write_line("DONE")?;
        loop {
            let line = self.read_line()?;
            if let Some(status) = line.strip_prefix(&format!("{tag} ")) {
                if status.starts_with("OK") {
                    return Ok(changed);
                }
                return Err(TransportError::Protocol(format!(
                    "IDLE failed: {}",
                    status.trim_end()
                )));
            }
            let upper = line.to_uppercase();
            if upper.contains("EXISTS") || upper.contains("RECENT") {
                changed = true;
            }
        }
    }
}

/// Length of a trailing `{N}` literal marker.
fn literal_len(line: &str) -> Option<usize> {
    let line = line.trim_end();
    let open = line.rfind('{')?;
    line.strip_suffix('}')?[open + 1..].parse().ok()
}

/// IMAP quoted string.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

// ── Async transport ─────────────────────────────────────────────────

pub struct ImapTransport {
    account: String,
    host: String,
    port: u16,
    username: String,
    password: SecretString,
    session: Option<ImapSession>,
    /// Blocking task currently holding the session, if any.
    busy: Option<JoinHandle<()>>,
    /// Clone of the session socket, so `close` can cut a stuck read.
    control: Option<TcpStream>,
    stop: Arc<AtomicBool>,
}

impl ImapTransport {
    pub fn new(account: &AccountConfig) -> Self {
        Self {
            account: account.name.clone(),
            host: account.imap_host.clone(),
            port: account.imap_port,
            username: account.address.clone(),
            password: account.password.clone(),
            session: None,
            busy: None,
            control: None,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run a blocking operation against the session. The session is kept
    /// unless the operation hit a connection-level error. If the caller
    /// stops waiting, the task logs the session out itself once `op` ends.
    async fn with_session<T, F>(&mut self, op: F) -> Result<T, TransportError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapSession) -> Result<T, TransportError> + Send + 'static,
    {
        let mut session = self.session.take().ok_or(TransportError::NotConnected)?;
        let (tx, rx) = oneshot::channel();
        self.busy = Some(tokio::task::spawn_blocking(move || {
            let result = op(&mut session);
            if let Err((mut abandoned, _)) = tx.send((session, result)) {
                abandoned.logout();
            }
        }));

        let returned = rx.await;
        self.busy = None;
        let (session, result) =
            returned.map_err(|_| TransportError::Protocol("IMAP task failed".into()))?;

        if matches!(result, Ok(_) | Err(TransportError::Protocol(_))) {
            self.session = Some(session);
        } else {
            self.control = None;
        }
        result
    }

    /// Stop whatever the blocking task is doing and wait for it to end.
    async fn interrupt(&mut self) {
        let Some(mut task) = self.busy.take() else {
            return;
        };
        self.stop.store(true, Ordering::Relaxed);
        if tokio::time::timeout(CLOSE_WAIT, &mut task).await.is_ok() {
            return;
        }
        warn!(account = %self.account, "IMAP session did not stop in time, closing socket");
        if let Some(control) = &self.control {
            let _ = control.shutdown(std::net::Shutdown::Both);
        }
        let _ = task.await;
    }
}

#[async_trait]
impl MailboxTransport for ImapTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        self.close().await;

        let account = self.account.clone();
        let host = self.host.clone();
        let port = self.port;
        let username = self.username.clone();
        let password = self.password.clone();
        let stop = Arc::new(AtomicBool::new(false));
        self.stop = Arc::clone(&stop);
        let session = tokio::task::spawn_blocking(move || {
            let mut session = ImapSession::open(&host, port, stop)?;
            session.login(&account, &username, &password)?;
            session.command("SELECT \"INBOX\"")?;
            Ok::<_, TransportError>(session)
        })
        .await
        .map_err(|e| TransportError::Protocol(format!("IMAP task failed: {e}")))??;

        debug!(
            account = %self.account,
            idle = session.capabilities.iter().any(|c| c == "IDLE"),
            "IMAP session ready"
        );
        self.control = session.socket().try_clone().ok();
        self.session = Some(session);
        Ok(())
    }

    fn supports_idle(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.capabilities.iter().any(|c| c == "IDLE"))
    }

    async fn wait_for_change(&mut self, timeout: Duration) -> Result<bool, TransportError> {
        self.with_session(move |s| s.idle(timeout)).await
    }

    async fn fetch_unseen(&mut self) -> Result<Vec<FetchedMail>, TransportError> {
        self.with_session(|s| {
            let uids = s.search_unseen()?;
            let mut mails = Vec::with_capacity(uids.len());
            for uid in uids {
                if let Some(raw) = s.fetch(uid)? {
                    mails.push(FetchedMail { uid, raw });
                }
            }
            Ok(mails)
        })
        .await
    }

    async fn mark_seen(&mut self, uid: u32) -> Result<(), TransportError> {
        self.with_session(move |s| {
            s.command(&format!("UID STORE {uid} +FLAGS.SILENT (\\Seen)"))
                .map(|_| ())
        })
        .await
    }

    async fn close(&mut self) {
        self.interrupt().await;
        self.control = None;
        if let Some(mut session) = self.session.take() {
            let _ = tokio::task::spawn_blocking(move || session.logout()).await;
        }
    }
}
