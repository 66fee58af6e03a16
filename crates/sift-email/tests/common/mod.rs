#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use sift_core::{MessageFlags, MessageRecord, PayloadCipher, RemapState};
use sift_email::testing::{FakeMailbox, XorCipher};
use sift_email::{FolderSync, FolderSyncReport, MailboxSession};
use sift_storage::Storage;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct Harness {
    pub _dir: TempDir,
    pub storage: Storage,
    pub server: FakeMailbox,
    pub session: MailboxSession,
    pub account: Uuid,
    pub cipher: Arc<dyn PayloadCipher>,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::connect(&dir.path().join("sift.sqlite3"))
            .await
            .expect("storage connect");
        let server = FakeMailbox::new();
        server.create_folder("INBOX");
        let account = Uuid::new_v4();
        let session = MailboxSession::new(account, server.boxed());

        Self {
            _dir: dir,
            storage,
            server,
            session,
            account,
            cipher: Arc::new(XorCipher),
        }
    }

    pub fn folder_sync(&self, batch_size: usize) -> FolderSync {
        FolderSync::new(
            self.storage.clone(),
            self.session.clone(),
            Arc::clone(&self.cipher),
            batch_size,
        )
    }

    pub async fn sync(&self, folder: &str) -> FolderSyncReport {
        self.folder_sync(100)
            .sync_folder(self.account, folder, &CancellationToken::new())
            .await
            .expect("folder sync")
    }

    pub async fn message(&self, message_id: &str) -> MessageRecord {
        self.storage
            .find_by_message_ids(self.account, &[message_id.to_string()])
            .await
            .expect("lookup")
            .into_iter()
            .next()
            .unwrap_or_else(|| panic!("{message_id} not stored"))
    }

    /// A stored record built directly, bypassing the server.
    pub fn record(&self, message_id: &str, thread_id: &str, minute: i64) -> MessageRecord {
        let now = Utc::now();
        MessageRecord {
            id: Uuid::new_v4(),
            account_id: self.account,
            folder: "INBOX".to_string(),
            uidvalidity: 1,
            uid: None,
            message_id: message_id.to_string(),
            message_id_synthetic: false,
            in_reply_to: None,
            references: Vec::new(),
            thread_id: thread_id.to_string(),
            parent_id: None,
            flags: MessageFlags::default(),
            remote_flags: MessageFlags::default(),
            size: 100,
            content_type: Some("text/plain".to_string()),
            charset: Some("utf-8".to_string()),
            has_attachments: false,
            subject_sealed: self
                .cipher
                .seal_str(&format!("subject of {message_id}"))
                .expect("seal"),
            sender_sealed: self.cipher.seal_str("carol@example.com").expect("seal"),
            body_sealed: None,
            received_at: at_minute(minute),
            sent_at: None,
            priority: None,
            soft_deleted_at: None,
            processed: false,
            remap_state: RemapState::Confirmed,
            parse_degraded: false,
            created_at: now,
            updated_at: now,
        }
    }
}

pub fn at_minute(minute: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0)
        .single()
        .expect("valid date")
        + Duration::minutes(minute)
}
