//! Message parser: raw RFC 5322 bytes into an [`InboundMessage`].
//!
//! Parsing never fails. Anything missing or malformed falls back to a
//! default so one bad message can't stall its siblings.

use chrono::{DateTime, Utc};
use mail_parser::{Address, HeaderValue, MessageParser, MimeHeaders};
use tracing::warn;
use uuid::Uuid;

use super::types::{Attachment, InboundMessage, Priority};

/// Subject used when the header is missing or blank.
pub const NO_SUBJECT: &str = "(no subject)";

/// Reply/forward markers recognised at the start of a subject.
const REPLY_MARKERS: &[&str] = &["re:", "fw:", "fwd:", "aw:", "sv:"];

/// Phrases that turn a message into an opt-out request.
const UNSUBSCRIBE_PHRASES: &[&str] = &[
    "unsubscribe",
    "opt out",
    "opt-out",
    "remove me",
    "stop sending",
];

/// Parse a raw message. `sequence` is the mailbox sequence number or
/// submission counter that produced it.
pub fn parse(raw: &[u8], sequence: u32) -> InboundMessage {
    let Some(parsed) = MessageParser::default().parse(raw) else {
        warn!(sequence, bytes = raw.len(), "Unparseable message, using defaults");
        return unparseable(sequence);
    };

    let message_id = parsed
        .message_id()
        .map(clean_id)
        .filter(|id| !id.is_empty())
        .unwrap_or_else(generated_id);

    let sender = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into());

    let subject = parsed
        .subject()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(NO_SUBJECT)
        .to_string();

    let received_at = parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    let in_reply_to = header_ids(parsed.in_reply_to()).into_iter().next();
    let references = header_ids(parsed.references());
    let thread_id = derive_thread_id(&references, in_reply_to.as_deref(), &message_id);

    let body = if let Some(text) = parsed.body_text(0) {
        text.trim().to_string()
    } else if let Some(html) = parsed.body_html(0) {
        strip_html(html.as_ref())
    } else {
        String::new()
    };

    let attachments = parsed
        .attachments()
        .enumerate()
        .map(|(i, part)| Attachment {
            filename: MimeHeaders::attachment_name(part)
                .map(str::to_string)
                .unwrap_or_else(|| format!("attachment-{}", i + 1)),
            content_type: MimeHeaders::content_type(part)
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".into()),
            data: part.contents().to_vec(),
        })
        .collect();

    let mut priority = Priority::Normal;
    for header in parsed.headers() {
        let name = header.name();
        let value = match header.value() {
            HeaderValue::Text(t) => t.as_ref(),
            _ => continue,
        };
        if name.eq_ignore_ascii_case("X-Priority") || name.eq_ignore_ascii_case("Importance") {
            priority = priority.max(header_priority(value));
        }
    }
    if subject.to_lowercase().contains("[urgent]") {
        priority = Priority::Urgent;
    }

    InboundMessage {
        message_id,
        sender,
        to: extract_addresses(parsed.to()),
        cc: extract_addresses(parsed.cc()),
        bcc: extract_addresses(parsed.bcc()),
        subject,
        body,
        received_at,
        in_reply_to,
        references,
        thread_id,
        attachments,
        priority,
        sequence,
    }
}

/// Does this message look like a reply or forward?
pub fn is_reply(msg: &InboundMessage) -> bool {
    if msg.in_reply_to.is_some() {
        return true;
    }
    let subject = strip_bracket_tags(&msg.subject).to_lowercase();
    REPLY_MARKERS.iter().any(|m| subject.starts_with(m))
}

/// Is this an opt-out request?
pub fn is_unsubscribe(msg: &InboundMessage) -> bool {
    let body = msg.body.to_lowercase();
    is_unsubscribe_subject(msg) || UNSUBSCRIBE_PHRASES.iter().any(|p| body.contains(p))
}

/// Opt-out stated in the subject alone. Forwarded material often carries
/// list footers in the body, so body text is not considered here.
pub fn is_unsubscribe_subject(msg: &InboundMessage) -> bool {
    let subject = msg.subject.to_lowercase();
    UNSUBSCRIBE_PHRASES.iter().any(|p| subject.contains(p))
}

/// Drop quoted lines and everything after a reply attribution, keeping
/// only the new text of a follow-up.
pub fn strip_quoted_text(body: &str) -> String {
    let mut kept: Vec<&str> = Vec::new();

    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('>') {
            continue;
        }
        let attribution = trimmed.starts_with("On ") && trimmed.ends_with("wrote:");
        let separator = trimmed.starts_with("---") && trimmed.contains("Original Message");
        if attribution || separator {
            break;
        }
        kept.push(line);
    }

    while kept.last().is_some_and(|l| l.trim().is_empty()) {
        kept.pop();
    }
    kept.join("\n")
}

/// Strip HTML tags and collapse whitespace.
pub fn strip_html(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => {
                in_tag = true;
                text.push(' ');
            }
            '>' => in_tag = false,
            _ if !in_tag => text.push(ch),
            _ => {}
        }
    }
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Thread root: first `References` entry, else `In-Reply-To`, else self.
fn derive_thread_id(references: &[String], in_reply_to: Option<&str>, own_id: &str) -> String {
    references
        .first()
        .map(String::as_str)
        .or(in_reply_to)
        .unwrap_or(own_id)
        .to_string()
}

fn header_priority(value: &str) -> Priority {
    let value = value.trim().to_lowercase();
    if value.starts_with('1') || value.starts_with('2') || value.starts_with("high") {
        Priority::High
    } else if value.starts_with('4') || value.starts_with('5') || value.starts_with("low") {
        Priority::Low
    } else {
        Priority::Normal
    }
}

/// Remove leading `[TAG]` prefixes such as `[EXT]` or `[list-name]`.
fn strip_bracket_tags(subject: &str) -> &str {
    let mut rest = subject.trim_start();
    while rest.starts_with('[') {
        match rest.find(']') {
            Some(end) => rest = rest[end + 1..].trim_start(),
            None => break,
        }
    }
    rest
}

fn header_ids(value: &HeaderValue) -> Vec<String> {
    let ids = match value {
        HeaderValue::Text(id) => vec![clean_id(id)],
        HeaderValue::TextList(ids) => ids.iter().map(|id| clean_id(id)).collect(),
        _ => Vec::new(),
    };
    ids.into_iter().filter(|id| !id.is_empty()).collect()
}

fn clean_id(id: &str) -> String {
    id.trim().trim_start_matches('<').trim_end_matches('>').to_string()
}

fn generated_id() -> String {
    format!("generated-{}@mail-intake", Uuid::new_v4())
}

fn extract_addresses(addr: Option<&Address>) -> Vec<String> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    match addr {
        Address::List(addrs) => addrs
            .iter()
            .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            .collect(),
        Address::Group(groups) => groups
            .iter()
            .flat_map(|g| {
                g.addresses
                    .iter()
                    .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            })
            .collect(),
    }
}

fn unparseable(sequence: u32) -> InboundMessage {
    let message_id = generated_id();
    InboundMessage {
        thread_id: message_id.clone(),
        message_id,
        sender: "unknown".into(),
        to: Vec::new(),
        cc: Vec::new(),
        bcc: Vec::new(),
        subject: NO_SUBJECT.into(),
        body: String::new(),
        received_at: Utc::now(),
        in_reply_to: None,
        references: Vec::new(),
        attachments: Vec::new(),
        priority: Priority::Normal,
        sequence,
    }
}
