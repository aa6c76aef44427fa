//! Message sources: supervised IMAP mailboxes and the SMTP submission listener.

pub mod imap;
pub mod submission;
pub mod supervisor;

pub use imap::{ImapTransport, MailboxTransport};
pub use submission::SubmissionListener;
pub use supervisor::{ConnectionState, ConnectionSupervisor, SupervisorHandle, SupervisorStatus};
