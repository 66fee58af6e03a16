#![allow(dead_code)]

use chrono::Utc;
use sift_core::{
    Condition, MailRule, MatchMode, MessageRecord, PayloadCipher, RuleAction, RuleConditions,
    RuleStats,
};
use sift_email::testing::{FakeMailbox, TestMessage, XorCipher};
use sift_email::{FolderSync, MailboxSession};
use sift_rules::{RuleBook, RuleEngine};
use sift_storage::{Storage, StorageTagService};
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
        for folder in ["INBOX", "Archive", "Trash"] {
            server.create_folder(folder);
        }
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

    pub fn engine(&self) -> RuleEngine {
        RuleEngine::new(
            self.storage.clone(),
            self.session.clone(),
            Arc::clone(&self.cipher),
            Arc::new(StorageTagService::new(self.storage.clone())),
            Some("Trash".to_string()),
            4,
        )
    }

    /// Deliver to INBOX and ingest everything.
    pub async fn deliver(&self, messages: &[TestMessage]) {
        for message in messages {
            self.server.deliver("INBOX", message);
        }
        FolderSync::new(
            self.storage.clone(),
            self.session.clone(),
            Arc::clone(&self.cipher),
            100,
        )
        .sync_folder(self.account, "INBOX", &CancellationToken::new())
        .await
        .expect("folder sync");
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

    pub async fn save_rule(
        &self,
        name: &str,
        priority: i32,
        predicates: Vec<Condition>,
        actions: Vec<RuleAction>,
    ) -> MailRule {
        let now = Utc::now();
        let rule = MailRule {
            id: Uuid::new_v4(),
            account_id: self.account,
            name: name.to_string(),
            priority,
            active: true,
            conditions: RuleConditions {
                match_mode: MatchMode::All,
                predicates,
            },
            actions,
            stats: RuleStats::default(),
            created_at: now,
            updated_at: now,
        };
        RuleBook::new(self.storage.clone())
            .save(&rule)
            .await
            .expect("save rule");
        rule
    }

    pub async fn times_triggered(&self, rule: &MailRule) -> u64 {
        self.storage
            .get_rule(rule.id)
            .await
            .expect("get rule")
            .expect("rule exists")
            .stats
            .times_triggered
    }

    pub async fn unprocessed(&self) -> usize {
        self.storage
            .list_unprocessed(self.account, 1000)
            .await
            .expect("list unprocessed")
            .len()
    }
}

pub fn subject_contains(value: &str) -> Vec<Condition> {
    vec![Condition::SubjectContains(value.to_string())]
}
