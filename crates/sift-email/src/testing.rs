//! In-memory stand-ins for the mail server, the payload cipher and the
//! summary store, for tests in this crate and its dependents.

use crate::{CopyUid, EmailError, FetchParts, FolderStatus, MailboxClient, RawFetch, RemoteFolder};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use mailparse::MailHeaderMap;
use sift_core::{CipherError, FlagKind, MessageFlags, Pagination, PayloadCipher};
use sift_storage::{
    StorageError, ThreadAggregate, ThreadMember, ThreadPage, ThreadSummarySource,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

const XOR_MAGIC: &[u8] = b"xor1";
const XOR_KEY: u8 = 0x5a;

/// Reversible, obviously-not-plaintext cipher.
#[derive(Debug, Clone, Copy, Default)]
pub struct XorCipher;

impl PayloadCipher for XorCipher {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut sealed = XOR_MAGIC.to_vec();
        sealed.extend(plaintext.iter().map(|byte| byte ^ XOR_KEY));
        Ok(sealed)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CipherError> {
        let Some(body) = sealed.strip_prefix(XOR_MAGIC) else {
            return Err(CipherError::Open("missing xor header".to_string()));
        };
        Ok(body.iter().map(|byte| byte ^ XOR_KEY).collect())
    }
}

/// Builder for RFC 5322 test messages.
#[derive(Debug, Clone)]
pub struct TestMessage {
    message_id: Option<String>,
    in_reply_to: Option<String>,
    references: Vec<String>,
    from: String,
    subject: String,
    body: String,
    date: DateTime<Utc>,
}

impl TestMessage {
    pub fn new(message_id: &str) -> Self {
        Self {
            message_id: Some(message_id.to_string()),
            ..Self::without_id()
        }
    }

    pub fn without_id() -> Self {
        Self {
            message_id: None,
            in_reply_to: None,
            references: Vec::new(),
            from: "Alice <alice@example.com>".to_string(),
            subject: "hello".to_string(),
            body: "hello there".to_string(),
            date: fake_epoch(),
        }
    }

    pub fn reply_to(mut self, parent: &str) -> Self {
        self.in_reply_to = Some(parent.to_string());
        if !self.references.iter().any(|r| r == parent) {
            self.references.push(parent.to_string());
        }
        self
    }

    pub fn references(mut self, references: &[&str]) -> Self {
        self.references = references.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn from(mut self, from: &str) -> Self {
        self.from = from.to_string();
        self
    }

    pub fn subject(mut self, subject: &str) -> Self {
        self.subject = subject.to_string();
        self
    }

    pub fn body(mut self, body: &str) -> Self {
        self.body = body.to_string();
        self
    }

    pub fn minutes_after_epoch(mut self, minutes: i64) -> Self {
        self.date = fake_epoch() + Duration::minutes(minutes);
        self
    }

    pub fn date(&self) -> DateTime<Utc> {
        self.date
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = String::new();
        if let Some(id) = &self.message_id {
            out.push_str(&format!("Message-ID: {id}\r\n"));
        }
        if let Some(parent) = &self.in_reply_to {
            out.push_str(&format!("In-Reply-To: {parent}\r\n"));
        }
        if !self.references.is_empty() {
            out.push_str(&format!("References: {}\r\n", self.references.join(" ")));
        }
        out.push_str(&format!("From: {}\r\n", self.from));
        out.push_str(&format!("Subject: {}\r\n", self.subject));
        out.push_str(&format!("Date: {}\r\n", self.date.to_rfc2822()));
        out.push_str("Content-Type: text/plain; charset=utf-8\r\n\r\n");
        out.push_str(&self.body);
        out.push_str("\r\n");
        out.into_bytes()
    }
}

fn fake_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

#[derive(Debug, Clone)]
struct StoredMessage {
    raw: Vec<u8>,
    flags: MessageFlags,
    internal_date: DateTime<Utc>,
}

impl StoredMessage {
    fn message_id(&self) -> Option<String> {
        let (headers, _) = mailparse::parse_headers(&self.raw).ok()?;
        headers
            .get_first_value("Message-ID")
            .map(|value| value.trim().to_string())
    }

    fn header(&self) -> Vec<u8> {
        let end = self
            .raw
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .map(|pos| pos + 4)
            .unwrap_or(self.raw.len());
        self.raw[..end].to_vec()
    }
}

#[derive(Debug, Clone)]
struct FakeFolder {
    uidvalidity: u32,
    uid_next: u32,
    messages: BTreeMap<u32, StoredMessage>,
}

impl FakeFolder {
    fn new(uidvalidity: u32) -> Self {
        Self {
            uidvalidity,
            uid_next: 1,
            messages: BTreeMap::new(),
        }
    }

    fn append(&mut self, message: StoredMessage) -> u32 {
        let uid = self.uid_next;
        self.uid_next += 1;
        self.messages.insert(uid, message);
        uid
    }

    fn status(&self) -> FolderStatus {
        FolderStatus {
            uidvalidity: self.uidvalidity,
            uid_next: Some(self.uid_next),
            exists: self.messages.len() as u32,
        }
    }
}

#[derive(Debug)]
struct FakeState {
    folders: BTreeMap<String, FakeFolder>,
    selected: Option<String>,
    uidplus: bool,
    can_move: bool,
    failures: Vec<String>,
    commands: Vec<String>,
    next_uidvalidity: u32,
}

/// Scriptable in-memory server. Clones share state, so a test keeps one
/// handle for inspection while the session owns another.
#[derive(Debug, Clone)]
pub struct FakeMailbox {
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeMailbox {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                folders: BTreeMap::new(),
                selected: None,
                uidplus: true,
                can_move: true,
                failures: Vec::new(),
                commands: Vec::new(),
                next_uidvalidity: 100,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn boxed(&self) -> Box<dyn MailboxClient> {
        Box::new(self.clone())
    }

    pub fn create_folder(&self, folder: &str) {
        let mut state = self.lock();
        let uidvalidity = state.next_uidvalidity;
        if !state.folders.contains_key(folder) {
            state.next_uidvalidity += 1;
            state
                .folders
                .insert(folder.to_string(), FakeFolder::new(uidvalidity));
        }
    }

    /// Append a message and return its identifier.
    pub fn deliver(&self, folder: &str, message: &TestMessage) -> u32 {
        self.deliver_with_flags(folder, message, MessageFlags::default())
    }

    pub fn deliver_with_flags(
        &self,
        folder: &str,
        message: &TestMessage,
        flags: MessageFlags,
    ) -> u32 {
        self.create_folder(folder);
        let mut state = self.lock();
        let Some(target) = state.folders.get_mut(folder) else {
            return 0;
        };
        target.append(StoredMessage {
            raw: message.build(),
            flags,
            internal_date: message.date(),
        })
    }

    pub fn uidvalidity(&self, folder: &str) -> Option<u32> {
        self.lock().folders.get(folder).map(|f| f.uidvalidity)
    }

    /// Start a new epoch: every message in the folder is renumbered from 1.
    pub fn set_uidvalidity(&self, folder: &str, uidvalidity: u32) {
        self.create_folder(folder);
        let mut state = self.lock();
        let Some(target) = state.folders.get_mut(folder) else {
            return;
        };
        let messages: Vec<StoredMessage> = std::mem::take(&mut target.messages)
            .into_values()
            .collect();
        target.uidvalidity = uidvalidity;
        target.uid_next = 1;
        for message in messages {
            target.append(message);
        }
    }

    pub fn set_uidplus(&self, enabled: bool) {
        self.lock().uidplus = enabled;
    }

    pub fn set_move_capability(&self, enabled: bool) {
        self.lock().can_move = enabled;
    }

    /// Make the next command whose log line starts with `prefix` fail.
    pub fn fail_next(&self, prefix: &str) {
        self.lock().failures.push(prefix.to_string());
    }

    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.lock().commands.clear();
    }

    pub fn uids(&self, folder: &str) -> Vec<u32> {
        self.lock()
            .folders
            .get(folder)
            .map(|f| f.messages.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn server_flags(&self, folder: &str, uid: u32) -> Option<MessageFlags> {
        self.lock()
            .folders
            .get(folder)
            .and_then(|f| f.messages.get(&uid))
            .map(|m| m.flags)
    }

    pub fn set_server_flags(&self, folder: &str, uid: u32, flags: MessageFlags) {
        if let Some(message) = self
            .lock()
            .folders
            .get_mut(folder)
            .and_then(|f| f.messages.get_mut(&uid))
        {
            message.flags = flags;
        }
    }

    /// Remove a message as another client expunging it would.
    pub fn expunge(&self, folder: &str, uid: u32) {
        if let Some(target) = self.lock().folders.get_mut(folder) {
            target.messages.remove(&uid);
        }
    }
}

impl FakeState {
    fn record(&mut self, command: String) -> Result<(), EmailError> {
        let failing = self
            .failures
            .iter()
            .position(|prefix| command.starts_with(prefix.as_str()));
        self.commands.push(command.clone());
        if let Some(index) = failing {
            self.failures.remove(index);
            return Err(EmailError::Protocol(format!("injected failure: {command}")));
        }
        Ok(())
    }

    fn selected_folder(&mut self) -> Result<&mut FakeFolder, EmailError> {
        let name = self
            .selected
            .clone()
            .ok_or_else(|| EmailError::Protocol("no folder selected".to_string()))?;
        self.folders
            .get_mut(&name)
            .ok_or_else(|| EmailError::Protocol(format!("folder vanished: {name}")))
    }

    fn transfer(
        &mut self,
        uids: &[u32],
        destination: &str,
        remove: bool,
    ) -> Result<Option<CopyUid>, EmailError> {
        if !self.folders.contains_key(destination) {
            return Err(EmailError::Protocol(format!(
                "[TRYCREATE] no such folder: {destination}"
            )));
        }
        let source = self.selected_folder()?;
        let mut moved = Vec::new();
        for uid in uids {
            let message = if remove {
                source.messages.remove(uid)
            } else {
                source.messages.get(uid).cloned()
            };
            if let Some(message) = message {
                moved.push((*uid, message));
            }
        }

        let uidplus = self.uidplus;
        let target = self
            .folders
            .get_mut(destination)
            .ok_or_else(|| EmailError::Protocol(format!("no such folder: {destination}")))?;
        let mut copy = CopyUid {
            uidvalidity: target.uidvalidity,
            source: Vec::new(),
            destination: Vec::new(),
        };
        for (uid, mut message) in moved {
            message.flags.deleted = false;
            copy.source.push(uid);
            copy.destination.push(target.append(message));
        }

        Ok(uidplus.then_some(copy))
    }

    fn store(&mut self, uids: &[u32], flags: &[FlagKind], value: bool) -> Result<(), EmailError> {
        let folder = self.selected_folder()?;
        for uid in uids {
            if let Some(message) = folder.messages.get_mut(uid) {
                for flag in flags {
                    message.flags.set(*flag, value);
                }
            }
        }
        Ok(())
    }
}

impl MailboxClient for FakeMailbox {
    fn select(&mut self, folder: &str) -> Result<FolderStatus, EmailError> {
        let mut state = self.lock();
        state.record(format!("SELECT {folder}"))?;
        let status = state
            .folders
            .get(folder)
            .map(FakeFolder::status)
            .ok_or_else(|| EmailError::Protocol(format!("no such folder: {folder}")))?;
        state.selected = Some(folder.to_string());
        Ok(status)
    }

    fn search(&mut self, query: &str) -> Result<Vec<u32>, EmailError> {
        let mut state = self.lock();
        state.record(format!("SEARCH {query}"))?;
        let folder = state.selected_folder()?;

        if query.eq_ignore_ascii_case("ALL") {
            return Ok(folder.messages.keys().copied().collect());
        }

        if let Some(range) = query.strip_prefix("UID ") {
            let start: u32 = range
                .trim_end_matches(":*")
                .parse()
                .map_err(|_| EmailError::Protocol(format!("bad search range: {range}")))?;
            let mut uids: Vec<u32> = folder.messages.range(start..).map(|(uid, _)| *uid).collect();
            // `n:*` always includes the highest identifier, even below `n`.
            if uids.is_empty() {
                uids.extend(folder.messages.keys().next_back().copied());
            }
            return Ok(uids);
        }

        if let Some(rest) = query.strip_prefix("HEADER Message-ID ") {
            let wanted = rest.trim().trim_matches('"');
            return Ok(folder
                .messages
                .iter()
                .filter(|(_, message)| message.message_id().as_deref() == Some(wanted))
                .map(|(uid, _)| *uid)
                .collect());
        }

        Err(EmailError::Protocol(format!("unsupported search: {query}")))
    }

    fn fetch(&mut self, uids: &[u32], parts: FetchParts) -> Result<Vec<RawFetch>, EmailError> {
        let mut state = self.lock();
        state.record(format!("FETCH {uids:?} {parts:?}"))?;
        let folder = state.selected_folder()?;

        Ok(uids
            .iter()
            .filter_map(|uid| folder.messages.get(uid).map(|message| (*uid, message)))
            .map(|(uid, message)| match parts {
                FetchParts::Envelope => RawFetch {
                    uid,
                    flags: message.flags,
                    size: Some(message.raw.len() as u32),
                    internal_date: Some(message.internal_date),
                    header: Some(message.header()),
                    ..RawFetch::default()
                },
                FetchParts::Flags => RawFetch {
                    uid,
                    flags: message.flags,
                    ..RawFetch::default()
                },
                FetchParts::Body => RawFetch {
                    uid,
                    flags: message.flags,
                    body: Some(message.raw.clone()),
                    ..RawFetch::default()
                },
            })
            .collect())
    }

    fn list_folders(&mut self) -> Result<Vec<RemoteFolder>, EmailError> {
        let mut state = self.lock();
        state.record("LIST".to_string())?;
        Ok(state
            .folders
            .keys()
            .map(|name| RemoteFolder {
                name: name.clone(),
                delimiter: Some("/".to_string()),
                selectable: true,
            })
            .collect())
    }

    fn copy(&mut self, uids: &[u32], destination: &str) -> Result<Option<CopyUid>, EmailError> {
        let mut state = self.lock();
        state.record(format!("COPY {uids:?} {destination}"))?;
        state.transfer(uids, destination, false)
    }

    fn move_messages(
        &mut self,
        uids: &[u32],
        destination: &str,
    ) -> Result<Option<CopyUid>, EmailError> {
        let mut state = self.lock();
        if !state.can_move {
            state.record(format!("COPY {uids:?} {destination}"))?;
            let copied = state.transfer(uids, destination, false)?;
            state.record(format!("STORE + {uids:?} [Deleted]"))?;
            state.store(uids, &[FlagKind::Deleted], true)?;
            return Ok(copied);
        }
        state.record(format!("MOVE {uids:?} {destination}"))?;
        state.transfer(uids, destination, true)
    }

    fn add_flags(&mut self, uids: &[u32], flags: &[FlagKind]) -> Result<(), EmailError> {
        let mut state = self.lock();
        state.record(format!("STORE + {uids:?} {flags:?}"))?;
        state.store(uids, flags, true)
    }

    fn remove_flags(&mut self, uids: &[u32], flags: &[FlagKind]) -> Result<(), EmailError> {
        let mut state = self.lock();
        state.record(format!("STORE - {uids:?} {flags:?}"))?;
        state.store(uids, flags, false)
    }

    fn logout(&mut self) -> Result<(), EmailError> {
        let mut state = self.lock();
        state.record("LOGOUT".to_string())?;
        state.selected = None;
        Ok(())
    }
}

/// Counts every query issued through it.
pub struct CountingSource<S> {
    inner: S,
    queries: AtomicUsize,
}

impl<S: ThreadSummarySource> CountingSource<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            queries: AtomicUsize::new(0),
        }
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.queries.store(0, Ordering::SeqCst);
    }

    fn tick(&self) {
        self.queries.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl<S: ThreadSummarySource> ThreadSummarySource for CountingSource<S> {
    async fn page_threads(
        &self,
        account_id: Uuid,
        page: &Pagination,
    ) -> Result<ThreadPage, StorageError> {
        self.tick();
        self.inner.page_threads(account_id, page).await
    }

    async fn thread_aggregates(
        &self,
        account_id: Uuid,
        thread_ids: &[String],
    ) -> Result<Vec<ThreadAggregate>, StorageError> {
        self.tick();
        self.inner.thread_aggregates(account_id, thread_ids).await
    }

    async fn latest_per_thread(
        &self,
        account_id: Uuid,
        thread_ids: &[String],
    ) -> Result<Vec<ThreadMember>, StorageError> {
        self.tick();
        self.inner.latest_per_thread(account_id, thread_ids).await
    }

    async fn roots_per_thread(
        &self,
        account_id: Uuid,
        thread_ids: &[String],
    ) -> Result<Vec<ThreadMember>, StorageError> {
        self.tick();
        self.inner.roots_per_thread(account_id, thread_ids).await
    }

    async fn earliest_per_thread(
        &self,
        account_id: Uuid,
        thread_ids: &[String],
    ) -> Result<Vec<ThreadMember>, StorageError> {
        self.tick();
        self.inner.earliest_per_thread(account_id, thread_ids).await
    }

    async fn searchable_members(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<ThreadMember>, StorageError> {
        self.tick();
        self.inner.searchable_members(account_id).await
    }
}
