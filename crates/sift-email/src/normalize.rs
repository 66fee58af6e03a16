use crate::{EmailError, RawFetch};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use mailparse::{MailAddr, MailHeader, MailHeaderMap, ParsedMail};
use regex::Regex;
use sha2::{Digest, Sha256};
use sift_core::{MessageFlags, MessageRecord, PayloadCipher, RemapState};
use std::sync::OnceLock;
use uuid::Uuid;

const SYNTHETIC_DOMAIN: &str = "synthetic.sift.invalid";

/// A fetched message reduced to what sync and threading need, with subject
/// and sender already sealed.
#[derive(Debug, Clone)]
pub struct NormalizedEnvelope {
    pub account_id: Uuid,
    pub folder: String,
    pub uidvalidity: u32,
    pub uid: u32,
    pub message_id: String,
    pub message_id_synthetic: bool,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub flags: MessageFlags,
    pub size: u32,
    pub content_type: Option<String>,
    pub charset: Option<String>,
    pub has_attachments: bool,
    pub subject_sealed: Vec<u8>,
    pub sender_sealed: Vec<u8>,
    pub received_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub parse_degraded: bool,
}

impl NormalizedEnvelope {
    pub fn into_record(self, id: Uuid, thread_id: String, parent_id: Option<Uuid>) -> MessageRecord {
        let now = Utc::now();
        MessageRecord {
            id,
            account_id: self.account_id,
            folder: self.folder,
            uidvalidity: self.uidvalidity,
            uid: Some(self.uid),
            message_id: self.message_id,
            message_id_synthetic: self.message_id_synthetic,
            in_reply_to: self.in_reply_to,
            references: self.references,
            thread_id,
            parent_id,
            flags: self.flags,
            remote_flags: self.flags,
            size: self.size,
            content_type: self.content_type,
            charset: self.charset,
            has_attachments: self.has_attachments,
            subject_sealed: self.subject_sealed,
            sender_sealed: self.sender_sealed,
            body_sealed: None,
            received_at: self.received_at,
            sent_at: self.sent_at,
            priority: None,
            soft_deleted_at: None,
            processed: false,
            remap_state: RemapState::Confirmed,
            parse_degraded: self.parse_degraded,
            created_at: now,
            updated_at: now,
        }
    }
}

pub struct Normalizer<'a> {
    account_id: Uuid,
    folder: &'a str,
    uidvalidity: u32,
    cipher: &'a dyn PayloadCipher,
}

impl<'a> Normalizer<'a> {
    pub fn new(
        account_id: Uuid,
        folder: &'a str,
        uidvalidity: u32,
        cipher: &'a dyn PayloadCipher,
    ) -> Self {
        Self {
            account_id,
            folder,
            uidvalidity,
            cipher,
        }
    }

    /// Header problems degrade the envelope instead of failing it; only a
    /// sealing failure is an error.
    pub fn normalize(&self, fetched: &RawFetch) -> Result<NormalizedEnvelope, EmailError> {
        let mut degraded = false;

        let headers = match fetched.header.as_deref() {
            Some(raw) => match mailparse::parse_headers(raw) {
                Ok((headers, _)) => headers,
                Err(err) => {
                    tracing::warn!(folder = self.folder, uid = fetched.uid, error = %err, "unparsable header block");
                    degraded = true;
                    Vec::new()
                }
            },
            None => {
                tracing::warn!(folder = self.folder, uid = fetched.uid, "fetch returned no header");
                degraded = true;
                Vec::new()
            }
        };

        let (message_id, synthetic) = match headers.get_first_value("Message-ID") {
            Some(raw) => match normalize_message_id(&raw) {
                Some(id) => (id, false),
                None => {
                    tracing::warn!(folder = self.folder, uid = fetched.uid, raw = %raw, "unparsable Message-ID");
                    degraded = true;
                    (self.synthetic_id(fetched.uid), true)
                }
            },
            None => (self.synthetic_id(fetched.uid), true),
        };

        let in_reply_to = headers
            .get_first_value("In-Reply-To")
            .and_then(|raw| angle_ids(&raw).into_iter().next())
            .filter(|id| *id != message_id);

        let mut references = Vec::new();
        if let Some(raw) = headers.get_first_value("References") {
            for id in angle_ids(&raw) {
                if id != message_id && !references.contains(&id) {
                    references.push(id);
                }
            }
        }

        let subject = headers.get_first_value("Subject").unwrap_or_default();

        let sender = match headers.get_first_header("From") {
            Some(header) => match sender_address(header) {
                Some(address) => address,
                None => {
                    degraded = true;
                    header.get_value().trim().to_ascii_lowercase()
                }
            },
            None => String::new(),
        };

        let sent_at = match headers.get_first_value("Date") {
            Some(raw) => match mailparse::dateparse(&raw) {
                Ok(secs) => Utc.timestamp_opt(secs, 0).single(),
                Err(err) => {
                    tracing::debug!(uid = fetched.uid, error = %err, "unparsable Date header");
                    degraded = true;
                    None
                }
            },
            None => None,
        };

        let header_type = headers
            .get_first_value("Content-Type")
            .map(|raw| mailparse::parse_content_type(&raw));
        let content_type = fetched
            .structure
            .as_ref()
            .map(|part| part.mime_type.clone())
            .or_else(|| header_type.as_ref().map(|ct| ct.mimetype.to_ascii_lowercase()));
        let charset = fetched
            .structure
            .as_ref()
            .and_then(|part| part.effective_charset())
            .or_else(|| header_type.as_ref().map(|ct| ct.charset.to_ascii_lowercase()));

        Ok(NormalizedEnvelope {
            account_id: self.account_id,
            folder: self.folder.to_string(),
            uidvalidity: self.uidvalidity,
            uid: fetched.uid,
            message_id,
            message_id_synthetic: synthetic,
            in_reply_to,
            references,
            flags: fetched.flags,
            size: fetched.size.unwrap_or(0),
            content_type,
            charset,
            has_attachments: fetched
                .structure
                .as_ref()
                .is_some_and(|part| part.has_attachments()),
            subject_sealed: self.cipher.seal_str(&subject)?,
            sender_sealed: self.cipher.seal_str(&sender)?,
            received_at: fetched.internal_date.or(sent_at).unwrap_or_else(Utc::now),
            sent_at,
            parse_degraded: degraded,
        })
    }

    fn synthetic_id(&self, uid: u32) -> String {
        synthetic_message_id(self.account_id, self.folder, self.uidvalidity, uid)
    }
}

/// Stable stand-in for a missing Message-ID, derived from where the message
/// lives: folder, epoch and identifier.
pub fn synthetic_message_id(account_id: Uuid, folder: &str, uidvalidity: u32, uid: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(account_id.as_bytes());
    hasher.update([0]);
    hasher.update(folder.as_bytes());
    hasher.update([0]);
    hasher.update(uidvalidity.to_be_bytes());
    hasher.update(uid.to_be_bytes());
    let hash = URL_SAFE_NO_PAD.encode(hasher.finalize());
    format!("<{hash}@{SYNTHETIC_DOMAIN}>")
}

fn normalize_message_id(raw: &str) -> Option<String> {
    if let Some(id) = angle_ids(raw).into_iter().next() {
        return Some(id);
    }
    let bare = raw.trim();
    if bare.is_empty() || bare.chars().any(char::is_whitespace) || !bare.contains('@') {
        return None;
    }
    Some(format!("<{bare}>"))
}

/// Every `<...>` token in a header value, in order.
fn angle_ids(raw: &str) -> Vec<String> {
    let mut ids = Vec::new();
    let mut rest = raw;
    while let Some(open) = rest.find('<') {
        let after = &rest[open + 1..];
        let Some(close) = after.find('>') else {
            break;
        };
        let inner = after[..close].trim();
        if !inner.is_empty() && !inner.contains('<') && !inner.chars().any(char::is_whitespace) {
            ids.push(format!("<{inner}>"));
        }
        rest = &after[close + 1..];
    }
    ids
}

fn sender_address(header: &MailHeader<'_>) -> Option<String> {
    let addresses = mailparse::addrparse_header(header).ok()?;
    addresses.iter().find_map(|addr| match addr {
        MailAddr::Single(info) => Some(info.addr.to_ascii_lowercase()),
        MailAddr::Group(group) => group
            .addrs
            .first()
            .map(|info| info.addr.to_ascii_lowercase()),
    })
}

/// Plain text of a full message: the first `text/plain` part, else the first
/// `text/html` part with markup removed.
pub fn extract_body_text(raw: &[u8]) -> Result<String, EmailError> {
    let parsed = mailparse::parse_mail(raw)?;
    if let Some(text) = first_part_body(&parsed, "text/plain") {
        return Ok(text);
    }
    if let Some(html) = first_part_body(&parsed, "text/html") {
        return Ok(strip_markup(&html));
    }
    Ok(String::new())
}

fn first_part_body(mail: &ParsedMail<'_>, mime: &str) -> Option<String> {
    if mail.subparts.is_empty() {
        if mail.ctype.mimetype.eq_ignore_ascii_case(mime) {
            return mail.get_body().ok();
        }
        return None;
    }

    mail.subparts
        .iter()
        .find_map(|part| first_part_body(part, mime))
}

fn markup_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"(?s)<(script|style)[^>]*>.*?</(script|style)>|<[^>]*>").ok()
        })
        .as_ref()
}

fn strip_markup(html: &str) -> String {
    let without_tags = match markup_pattern() {
        Some(pattern) => pattern.replace_all(html, " ").into_owned(),
        None => html.to_string(),
    };
    without_tags.split_whitespace().collect::<Vec<_>>().join(" ")
}
