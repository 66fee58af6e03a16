use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---- Flags ----

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FlagKind {
    Seen,
    Answered,
    Flagged,
    Deleted,
    Draft,
}

impl FlagKind {
    pub const ALL: [FlagKind; 5] = [
        FlagKind::Seen,
        FlagKind::Answered,
        FlagKind::Flagged,
        FlagKind::Deleted,
        FlagKind::Draft,
    ];

    /// IMAP system flag atom, e.g. `\Seen`.
    pub fn imap_atom(self) -> &'static str {
        match self {
            FlagKind::Seen => "\\Seen",
            FlagKind::Answered => "\\Answered",
            FlagKind::Flagged => "\\Flagged",
            FlagKind::Deleted => "\\Deleted",
            FlagKind::Draft => "\\Draft",
        }
    }

    fn bit(self) -> i64 {
        match self {
            FlagKind::Seen => 1,
            FlagKind::Answered => 1 << 1,
            FlagKind::Flagged => 1 << 2,
            FlagKind::Deleted => 1 << 3,
            FlagKind::Draft => 1 << 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
pub struct MessageFlags {
    pub seen: bool,
    pub answered: bool,
    pub flagged: bool,
    pub deleted: bool,
    pub draft: bool,
}

impl MessageFlags {
    pub fn get(&self, kind: FlagKind) -> bool {
        match kind {
            FlagKind::Seen => self.seen,
            FlagKind::Answered => self.answered,
            FlagKind::Flagged => self.flagged,
            FlagKind::Deleted => self.deleted,
            FlagKind::Draft => self.draft,
        }
    }

    pub fn set(&mut self, kind: FlagKind, value: bool) {
        match kind {
            FlagKind::Seen => self.seen = value,
            FlagKind::Answered => self.answered = value,
            FlagKind::Flagged => self.flagged = value,
            FlagKind::Deleted => self.deleted = value,
            FlagKind::Draft => self.draft = value,
        }
    }

    /// Packed representation used by the `flags` / `remote_flags` columns.
    pub fn to_bits(self) -> i64 {
        FlagKind::ALL
            .iter()
            .filter(|kind| self.get(**kind))
            .fold(0, |acc, kind| acc | kind.bit())
    }

    pub fn from_bits(bits: i64) -> Self {
        let mut flags = Self::default();
        for kind in FlagKind::ALL {
            flags.set(kind, bits & kind.bit() != 0);
        }
        flags
    }

    /// Flags that are set in `self` but not in `other`.
    pub fn added_since(&self, other: &MessageFlags) -> Vec<FlagKind> {
        FlagKind::ALL
            .into_iter()
            .filter(|kind| self.get(*kind) && !other.get(*kind))
            .collect()
    }
}

// ---- Sync state ----

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncCursor {
    pub account_id: Uuid,
    pub folder: String,
    pub uidvalidity: u32,
    pub last_uid: u32,
    pub initial_sync_complete: bool,
}

impl SyncCursor {
    pub fn fresh(account_id: Uuid, folder: &str, uidvalidity: u32) -> Self {
        Self {
            account_id,
            folder: folder.to_string(),
            uidvalidity,
            last_uid: 0,
            initial_sync_complete: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RemapState {
    Confirmed,
    /// The server moved the message but did not report the new identifier.
    Unconfirmed,
}

impl RemapState {
    pub fn as_str(self) -> &'static str {
        match self {
            RemapState::Confirmed => "confirmed",
            RemapState::Unconfirmed => "unconfirmed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "confirmed" => Some(RemapState::Confirmed),
            "unconfirmed" => Some(RemapState::Unconfirmed),
            _ => None,
        }
    }
}

// ---- Messages ----

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl MessagePriority {
    pub fn as_str(self) -> &'static str {
        match self {
            MessagePriority::Low => "low",
            MessagePriority::Normal => "normal",
            MessagePriority::High => "high",
            MessagePriority::Urgent => "urgent",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "low" => Some(MessagePriority::Low),
            "normal" => Some(MessagePriority::Normal),
            "high" => Some(MessagePriority::High),
            "urgent" => Some(MessagePriority::Urgent),
            _ => None,
        }
    }
}

/// A locally stored message. Subject, sender and body are sealed with the
/// account's [`crate::PayloadCipher`]; everything needed for threading and
/// sync bookkeeping stays in the clear.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: Uuid,
    pub account_id: Uuid,
    pub folder: String,
    pub uidvalidity: u32,
    /// `None` while a move could not be matched to a destination identifier.
    pub uid: Option<u32>,
    pub message_id: String,
    pub message_id_synthetic: bool,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub thread_id: String,
    /// Local id of the parent message; `None` for a thread root.
    pub parent_id: Option<Uuid>,
    pub flags: MessageFlags,
    /// Flags as last seen on (or pushed to) the server.
    pub remote_flags: MessageFlags,
    pub size: u32,
    pub content_type: Option<String>,
    pub charset: Option<String>,
    pub has_attachments: bool,
    pub subject_sealed: Vec<u8>,
    pub sender_sealed: Vec<u8>,
    pub body_sealed: Option<Vec<u8>>,
    pub received_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub priority: Option<MessagePriority>,
    pub soft_deleted_at: Option<DateTime<Utc>>,
    pub processed: bool,
    pub remap_state: RemapState,
    pub parse_degraded: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_active(&self) -> bool {
        self.soft_deleted_at.is_none()
    }

    pub fn has_unpushed_flags(&self) -> bool {
        self.flags != self.remote_flags
    }
}

// ---- Threads ----

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RootConfidence {
    /// Exactly one member without a parent.
    Confirmed,
    /// No parentless member, or several; the earliest message stands in.
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub thread_id: String,
    pub message_count: usize,
    pub latest_date: DateTime<Utc>,
    pub oldest_date: DateTime<Utc>,
    pub has_unread: bool,
    pub latest_sender: String,
    pub subject: String,
    pub latest_message: Uuid,
    pub root_message: Uuid,
    pub root_confidence: RootConfidence,
}

// ---- Rules / Filters ----

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    #[default]
    All,
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    SenderEquals(String),
    SenderContains(String),
    SenderDomain(String),
    SubjectContains(String),
    SubjectRegex(String),
    BodyContains(String),
    HasAttachment(bool),
    FolderEquals(String),
}

impl Condition {
    pub fn needs_body(&self) -> bool {
        matches!(self, Condition::BodyContains(_))
    }
}

/// Persisted shape of a rule's conditions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConditionDocument {
    #[serde(default)]
    pub match_mode: MatchMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_equals: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_contains: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_contains: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_regex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_contains: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_attachment: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_equals: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "ConditionDocument", into = "ConditionDocument")]
pub struct RuleConditions {
    pub match_mode: MatchMode,
    pub predicates: Vec<Condition>,
}

impl RuleConditions {
    pub fn needs_body(&self) -> bool {
        self.predicates.iter().any(Condition::needs_body)
    }
}

impl From<ConditionDocument> for RuleConditions {
    fn from(doc: ConditionDocument) -> Self {
        let mut predicates = Vec::new();
        if let Some(value) = doc.sender_equals {
            predicates.push(Condition::SenderEquals(value));
        }
        if let Some(value) = doc.sender_contains {
            predicates.push(Condition::SenderContains(value));
        }
        if let Some(value) = doc.sender_domain {
            predicates.push(Condition::SenderDomain(value));
        }
        if let Some(value) = doc.subject_contains {
            predicates.push(Condition::SubjectContains(value));
        }
        if let Some(value) = doc.subject_regex {
            predicates.push(Condition::SubjectRegex(value));
        }
        if let Some(value) = doc.body_contains {
            predicates.push(Condition::BodyContains(value));
        }
        if let Some(value) = doc.has_attachment {
            predicates.push(Condition::HasAttachment(value));
        }
        if let Some(value) = doc.folder_equals {
            predicates.push(Condition::FolderEquals(value));
        }

        Self {
            match_mode: doc.match_mode,
            predicates,
        }
    }
}

impl From<RuleConditions> for ConditionDocument {
    fn from(conditions: RuleConditions) -> Self {
        let mut doc = ConditionDocument {
            match_mode: conditions.match_mode,
            ..ConditionDocument::default()
        };
        for predicate in conditions.predicates {
            match predicate {
                Condition::SenderEquals(value) => doc.sender_equals = Some(value),
                Condition::SenderContains(value) => doc.sender_contains = Some(value),
                Condition::SenderDomain(value) => doc.sender_domain = Some(value),
                Condition::SubjectContains(value) => doc.subject_contains = Some(value),
                Condition::SubjectRegex(value) => doc.subject_regex = Some(value),
                Condition::BodyContains(value) => doc.body_contains = Some(value),
                Condition::HasAttachment(value) => doc.has_attachment = Some(value),
                Condition::FolderEquals(value) => doc.folder_equals = Some(value),
            }
        }
        doc
    }
}

/// One step of a rule's action list, persisted as `{"type": ..., "params": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "params", rename_all = "snake_case")]
pub enum RuleAction {
    MoveToFolder { folder: String },
    MarkRead,
    MarkFlagged,
    ApplyTag { tag: String },
    SetPriority { priority: MessagePriority },
    SoftDelete,
    StopProcessing,
}

impl RuleAction {
    pub fn kind(&self) -> &'static str {
        match self {
            RuleAction::MoveToFolder { .. } => "move_to_folder",
            RuleAction::MarkRead => "mark_read",
            RuleAction::MarkFlagged => "mark_flagged",
            RuleAction::ApplyTag { .. } => "apply_tag",
            RuleAction::SetPriority { .. } => "set_priority",
            RuleAction::SoftDelete => "soft_delete",
            RuleAction::StopProcessing => "stop_processing",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleStats {
    pub times_triggered: u64,
    pub last_triggered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailRule {
    pub id: Uuid,
    pub account_id: Uuid,
    pub name: String,
    /// Lower runs earlier; ties are broken by `id`.
    pub priority: i32,
    pub active: bool,
    pub conditions: RuleConditions,
    pub actions: Vec<RuleAction>,
    #[serde(default)]
    pub stats: RuleStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MailRule {
    pub fn precedence(&self) -> (i32, Uuid) {
        (self.priority, self.id)
    }
}

// ---- Listing ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult<T> {
    pub total: usize,
    pub items: Vec<T>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}
