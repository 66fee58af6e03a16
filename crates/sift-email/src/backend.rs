use crate::EmailError;
use chrono::{DateTime, Utc};
use imap_proto::types::{BodyContentCommon, BodyStructure};
use regex::Regex;
use sift_core::{FlagKind, MessageFlags};
use std::sync::OnceLock;

/// Upper bound on identifiers produced from one server-supplied set.
const MAX_EXPANDED_UIDS: usize = 100_000;

/// Which parts of a message a fetch asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchParts {
    /// `UID FLAGS RFC822.SIZE INTERNALDATE BODYSTRUCTURE BODY.PEEK[HEADER]`
    Envelope,
    Flags,
    /// Full message source, without setting `\Seen`.
    Body,
}

impl FetchParts {
    fn query(self) -> &'static str {
        match self {
            FetchParts::Envelope => {
                "(UID FLAGS RFC822.SIZE INTERNALDATE BODYSTRUCTURE BODY.PEEK[HEADER])"
            }
            FetchParts::Flags => "(UID FLAGS)",
            FetchParts::Body => "(UID BODY.PEEK[])",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FolderStatus {
    pub uidvalidity: u32,
    pub uid_next: Option<u32>,
    pub exists: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFolder {
    pub name: String,
    pub delimiter: Option<String>,
    pub selectable: bool,
}

/// MIME structure of a message as reported by BODYSTRUCTURE.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartStructure {
    pub mime_type: String,
    pub charset: Option<String>,
    pub disposition: Option<String>,
    pub has_filename: bool,
    pub content_id: Option<String>,
    pub children: Vec<PartStructure>,
}

impl PartStructure {
    pub fn leaf(mime_type: &str) -> Self {
        Self {
            mime_type: mime_type.to_ascii_lowercase(),
            ..Self::default()
        }
    }

    pub fn multipart(subtype: &str, children: Vec<PartStructure>) -> Self {
        Self {
            mime_type: format!("multipart/{}", subtype.to_ascii_lowercase()),
            children,
            ..Self::default()
        }
    }

    /// Inline images referenced by Content-ID and bare inline parts (tracking
    /// pixels) do not count as attachments.
    pub fn has_attachments(&self) -> bool {
        if self.mime_type.starts_with("multipart/") {
            return self.children.iter().any(PartStructure::has_attachments);
        }

        match self.disposition.as_deref() {
            Some(disposition) if disposition.eq_ignore_ascii_case("attachment") => true,
            Some(disposition) if disposition.eq_ignore_ascii_case("inline") => {
                self.content_id.is_none() && self.has_filename
            }
            _ => !self.mime_type.starts_with("text/"),
        }
    }

    /// The part's own charset, else the first one found in a text part.
    pub fn effective_charset(&self) -> Option<String> {
        if let Some(charset) = &self.charset {
            return Some(charset.clone());
        }
        self.children
            .iter()
            .find_map(PartStructure::effective_charset)
    }

    pub(crate) fn from_bodystructure(structure: &BodyStructure<'_>) -> Self {
        match structure {
            BodyStructure::Basic { common, other, .. }
            | BodyStructure::Text { common, other, .. } => {
                let mut part = single_part(common);
                part.content_id = other.id.as_ref().map(|id| id.to_string());
                part
            }
            BodyStructure::Message {
                common, other, body, ..
            } => {
                let mut part = single_part(common);
                part.content_id = other.id.as_ref().map(|id| id.to_string());
                part.children = vec![PartStructure::from_bodystructure(body)];
                part
            }
            BodyStructure::Multipart { common, bodies, .. } => {
                let mut part = single_part(common);
                part.children = bodies.iter().map(PartStructure::from_bodystructure).collect();
                part
            }
        }
    }
}

fn single_part(common: &BodyContentCommon<'_>) -> PartStructure {
    let type_params = common.ty.params.as_deref().unwrap_or_default();
    let charset = type_params
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("charset"))
        .map(|(_, value)| value.to_ascii_lowercase());
    let named = type_params
        .iter()
        .any(|(key, _)| key.eq_ignore_ascii_case("name"));

    let (disposition, filename) = match &common.disposition {
        Some(disposition) => (
            Some(disposition.ty.to_ascii_lowercase()),
            disposition
                .params
                .as_deref()
                .unwrap_or_default()
                .iter()
                .any(|(key, _)| key.eq_ignore_ascii_case("filename")),
        ),
        None => (None, false),
    };

    PartStructure {
        mime_type: format!("{}/{}", common.ty.ty, common.ty.subtype).to_ascii_lowercase(),
        charset,
        disposition,
        has_filename: filename || named,
        content_id: None,
        children: Vec::new(),
    }
}

/// One message as returned by a UID FETCH. Which fields are filled depends
/// on the [`FetchParts`] requested.
#[derive(Debug, Clone, Default)]
pub struct RawFetch {
    pub uid: u32,
    pub flags: MessageFlags,
    pub size: Option<u32>,
    pub internal_date: Option<DateTime<Utc>>,
    pub structure: Option<PartStructure>,
    pub header: Option<Vec<u8>>,
    pub body: Option<Vec<u8>>,
}

/// UIDPLUS `COPYUID` response code: destination uidvalidity plus source and
/// destination identifier sets, position for position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyUid {
    pub uidvalidity: u32,
    pub source: Vec<u32>,
    pub destination: Vec<u32>,
}

impl CopyUid {
    pub fn destination_for(&self, source_uid: u32) -> Option<u32> {
        if self.source.len() != self.destination.len() {
            return None;
        }
        self.source
            .iter()
            .position(|uid| *uid == source_uid)
            .map(|index| self.destination[index])
    }
}

/// Blocking mailbox protocol client. Message-level commands act on the
/// currently selected folder.
pub trait MailboxClient: Send {
    fn select(&mut self, folder: &str) -> Result<FolderStatus, EmailError>;

    /// UID SEARCH; identifiers ascending.
    fn search(&mut self, query: &str) -> Result<Vec<u32>, EmailError>;

    fn fetch(&mut self, uids: &[u32], parts: FetchParts) -> Result<Vec<RawFetch>, EmailError>;

    fn list_folders(&mut self) -> Result<Vec<RemoteFolder>, EmailError>;

    fn copy(&mut self, uids: &[u32], destination: &str) -> Result<Option<CopyUid>, EmailError>;

    fn move_messages(
        &mut self,
        uids: &[u32],
        destination: &str,
    ) -> Result<Option<CopyUid>, EmailError>;

    fn add_flags(&mut self, uids: &[u32], flags: &[FlagKind]) -> Result<(), EmailError>;

    fn remove_flags(&mut self, uids: &[u32], flags: &[FlagKind]) -> Result<(), EmailError>;

    fn logout(&mut self) -> Result<(), EmailError>;
}

#[derive(Clone)]
pub struct ImapSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for ImapSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

pub struct ImapClient {
    session: imap::Session<imap::Connection>,
    uidplus: bool,
    can_move: bool,
}

impl ImapClient {
    /// Blocking; call from `spawn_blocking`.
    pub fn connect(settings: &ImapSettings) -> Result<Self, EmailError> {
        let client = imap::ClientBuilder::new(settings.host.as_str(), settings.port)
            .connect()
            .map_err(imap_error_to_email)?;
        let mut session = client
            .login(settings.username.clone(), settings.password.clone())
            .map_err(|err| imap_error_to_email(err.0))?;

        let capabilities = session.capabilities().map_err(imap_error_to_email)?;
        let uidplus = capabilities.has_str("UIDPLUS");
        let can_move = capabilities.has_str("MOVE");
        drop(capabilities);

        tracing::debug!(host = %settings.host, uidplus, can_move, "imap session established");
        Ok(Self {
            session,
            uidplus,
            can_move,
        })
    }

    fn copyuid_from(&self, response: &[u8]) -> Option<CopyUid> {
        if !self.uidplus {
            return None;
        }
        parse_copyuid(&String::from_utf8_lossy(response))
    }
}

impl MailboxClient for ImapClient {
    fn select(&mut self, folder: &str) -> Result<FolderStatus, EmailError> {
        let mailbox = self.session.select(folder).map_err(imap_error_to_email)?;
        let uidvalidity = mailbox.uid_validity.ok_or_else(|| {
            EmailError::Protocol(format!("server reported no UIDVALIDITY for {folder}"))
        })?;
        Ok(FolderStatus {
            uidvalidity,
            uid_next: mailbox.uid_next,
            exists: mailbox.exists,
        })
    }

    fn search(&mut self, query: &str) -> Result<Vec<u32>, EmailError> {
        let found = self.session.uid_search(query).map_err(imap_error_to_email)?;
        let mut uids: Vec<u32> = found.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    fn fetch(&mut self, uids: &[u32], parts: FetchParts) -> Result<Vec<RawFetch>, EmailError> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let fetches = self
            .session
            .uid_fetch(format_uid_set(uids), parts.query())
            .map_err(imap_error_to_email)?;

        let mut out = Vec::with_capacity(uids.len());
        for fetched in fetches.iter() {
            let Some(uid) = fetched.uid else {
                continue;
            };

            let mut flags = MessageFlags::default();
            for flag in fetched.flags() {
                match flag {
                    imap::types::Flag::Seen => flags.seen = true,
                    imap::types::Flag::Answered => flags.answered = true,
                    imap::types::Flag::Flagged => flags.flagged = true,
                    imap::types::Flag::Deleted => flags.deleted = true,
                    imap::types::Flag::Draft => flags.draft = true,
                    _ => {}
                }
            }

            out.push(RawFetch {
                uid,
                flags,
                size: fetched.size,
                internal_date: fetched
                    .internal_date()
                    .map(|datetime| datetime.with_timezone(&Utc)),
                structure: fetched
                    .bodystructure()
                    .map(PartStructure::from_bodystructure),
                header: fetched.header().map(<[u8]>::to_vec),
                body: fetched.body().map(<[u8]>::to_vec),
            });
        }

        Ok(out)
    }

    fn list_folders(&mut self) -> Result<Vec<RemoteFolder>, EmailError> {
        let names = self
            .session
            .list(None, Some("*"))
            .map_err(imap_error_to_email)?;

        Ok(names
            .iter()
            .map(|name| RemoteFolder {
                name: name.name().to_string(),
                delimiter: name.delimiter().map(str::to_string),
                selectable: !name
                    .attributes()
                    .iter()
                    .any(|attr| matches!(attr, imap_proto::NameAttribute::NoSelect)),
            })
            .collect())
    }

    fn copy(&mut self, uids: &[u32], destination: &str) -> Result<Option<CopyUid>, EmailError> {
        if uids.is_empty() {
            return Ok(None);
        }
        let response = self
            .session
            .run_command_and_read_response(format!(
                "UID COPY {} {}",
                format_uid_set(uids),
                quote_mailbox(destination)
            ))
            .map_err(imap_error_to_email)?;
        Ok(self.copyuid_from(&response))
    }

    fn move_messages(
        &mut self,
        uids: &[u32],
        destination: &str,
    ) -> Result<Option<CopyUid>, EmailError> {
        if uids.is_empty() {
            return Ok(None);
        }

        if !self.can_move {
            // COPY plus \Deleted; expunging is left to the user.
            let copied = self.copy(uids, destination)?;
            self.add_flags(uids, &[FlagKind::Deleted])?;
            return Ok(copied);
        }

        let response = self
            .session
            .run_command_and_read_response(format!(
                "UID MOVE {} {}",
                format_uid_set(uids),
                quote_mailbox(destination)
            ))
            .map_err(imap_error_to_email)?;
        Ok(self.copyuid_from(&response))
    }

    fn add_flags(&mut self, uids: &[u32], flags: &[FlagKind]) -> Result<(), EmailError> {
        store_flags(&mut self.session, uids, flags, '+')
    }

    fn remove_flags(&mut self, uids: &[u32], flags: &[FlagKind]) -> Result<(), EmailError> {
        store_flags(&mut self.session, uids, flags, '-')
    }

    fn logout(&mut self) -> Result<(), EmailError> {
        self.session.logout().map_err(imap_error_to_email)
    }
}

fn store_flags(
    session: &mut imap::Session<imap::Connection>,
    uids: &[u32],
    flags: &[FlagKind],
    sign: char,
) -> Result<(), EmailError> {
    if uids.is_empty() || flags.is_empty() {
        return Ok(());
    }
    let atoms = flags
        .iter()
        .map(|flag| flag.imap_atom())
        .collect::<Vec<_>>()
        .join(" ");
    session
        .uid_store(format_uid_set(uids), format!("{sign}FLAGS.SILENT ({atoms})"))
        .map_err(imap_error_to_email)?;
    Ok(())
}

fn imap_error_to_email(error: imap::Error) -> EmailError {
    EmailError::Protocol(format!("imap error: {error}"))
}

/// Find a `[COPYUID v src dst]` response code anywhere in a server response.
fn copyuid_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)\[COPYUID\s+(\d+)\s+([0-9:,]+)\s+([0-9:,]+)\]").ok())
        .as_ref()
}

pub fn parse_copyuid(response: &str) -> Option<CopyUid> {
    let captures = copyuid_pattern()?.captures(response)?;

    Some(CopyUid {
        uidvalidity: captures.get(1)?.as_str().parse().ok()?,
        source: expand_uid_set(captures.get(2)?.as_str())?,
        destination: expand_uid_set(captures.get(3)?.as_str())?,
    })
}

/// Expand `3:5,9` into `[3, 4, 5, 9]`, keeping the server's order. Ranges
/// may be written high-to-low.
pub fn expand_uid_set(raw: &str) -> Option<Vec<u32>> {
    let mut uids = Vec::new();
    for piece in raw.split(',') {
        match piece.split_once(':') {
            Some((start, end)) => {
                let start: u32 = start.trim().parse().ok()?;
                let end: u32 = end.trim().parse().ok()?;
                let (low, high) = (start.min(end), start.max(end));
                if uids.len() + (high - low) as usize >= MAX_EXPANDED_UIDS {
                    return None;
                }
                uids.extend(low..=high);
            }
            None => uids.push(piece.trim().parse().ok()?),
        }
        if uids.len() > MAX_EXPANDED_UIDS {
            return None;
        }
    }
    Some(uids)
}

/// Compact sorted-or-not identifiers into an IMAP sequence set.
pub(crate) fn format_uid_set(uids: &[u32]) -> String {
    let mut sorted = uids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut ranges: Vec<String> = Vec::new();
    let mut iter = sorted.into_iter();
    let Some(first) = iter.next() else {
        return String::new();
    };
    let (mut start, mut end) = (first, first);
    for uid in iter {
        if uid == end + 1 {
            end = uid;
            continue;
        }
        ranges.push(render_range(start, end));
        start = uid;
        end = uid;
    }
    ranges.push(render_range(start, end));
    ranges.join(",")
}

fn render_range(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{start}:{end}")
    }
}

pub(crate) fn quote_mailbox(name: &str) -> String {
    format!("\"{}\"", name.replace('\\', "\\\\").replace('"', "\\\""))
}
