use crate::compile::{compile_rules, CompiledRule, MessageView};
use crate::RuleError;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use sift_core::{
    FlagKind, MailRule, MessagePriority, MessageRecord, PayloadCipher, RuleAction, TagService,
};
use sift_email::{BodyLoader, FlagSynchronizer, MailboxSession, MoveReconciler};
use sift_storage::Storage;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Totals for one automation pass over an account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutomationReport {
    pub evaluated: u64,
    pub matched: u64,
    pub actions_applied: u64,
    pub action_failures: u64,
    pub failed_messages: u64,
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DryRunMatch {
    pub message_id: Uuid,
    pub rule_id: Uuid,
    pub rule_name: String,
    pub actions: Vec<RuleAction>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DryRunReport {
    pub evaluated: u64,
    pub matches: Vec<DryRunMatch>,
}

#[derive(Debug, Default)]
struct MessageOutcome {
    matched: u64,
    actions_applied: u64,
    action_failures: u64,
}

#[derive(Debug, PartialEq, Eq)]
enum ActionStep {
    Applied,
    Skipped,
    StopRules,
}

/// Runs an account's rules over messages that have not been through
/// automation yet.
pub struct RuleEngine {
    storage: Storage,
    cipher: Arc<dyn PayloadCipher>,
    tags: Arc<dyn TagService>,
    moves: MoveReconciler,
    flags: FlagSynchronizer,
    bodies: BodyLoader,
    max_parallel: usize,
}

impl RuleEngine {
    pub fn new(
        storage: Storage,
        session: MailboxSession,
        cipher: Arc<dyn PayloadCipher>,
        tags: Arc<dyn TagService>,
        trash_folder: Option<String>,
        max_parallel: usize,
    ) -> Self {
        Self {
            moves: MoveReconciler::new(storage.clone(), session.clone(), trash_folder),
            flags: FlagSynchronizer::new(storage.clone(), session.clone()),
            bodies: BodyLoader::new(storage.clone(), session, Arc::clone(&cipher)),
            storage,
            cipher,
            tags,
            max_parallel: max_parallel.max(1),
        }
    }

    pub async fn process_pending(
        &self,
        account_id: Uuid,
        batch_size: usize,
        cancel: &CancellationToken,
    ) -> Result<AutomationReport, RuleError> {
        let rules = compile_rules(self.storage.list_active_rules(account_id).await?);
        let pending = self
            .storage
            .list_unprocessed(account_id, batch_size.max(1) as i64)
            .await?;
        if pending.is_empty() {
            return Ok(AutomationReport::default());
        }

        let rules = &rules;
        let outcomes: Vec<Option<Result<MessageOutcome, RuleError>>> = stream::iter(pending)
            .map(|record| async move {
                if cancel.is_cancelled() {
                    return None;
                }
                let id = record.id;
                let outcome = self.process_message(rules, record).await;
                if let Err(err) = &outcome {
                    tracing::error!(message = %id, error = %err, "automation failed for message");
                }
                Some(outcome)
            })
            .buffer_unordered(self.max_parallel)
            .collect()
            .await;

        let mut report = AutomationReport::default();
        for outcome in outcomes {
            match outcome {
                None => report.cancelled = true,
                Some(Ok(outcome)) => {
                    report.evaluated += 1;
                    report.matched += outcome.matched;
                    report.actions_applied += outcome.actions_applied;
                    report.action_failures += outcome.action_failures;
                }
                Some(Err(_)) => {
                    report.evaluated += 1;
                    report.failed_messages += 1;
                }
            }
        }

        tracing::info!(
            account_id = %account_id,
            rules = rules.len(),
            evaluated = report.evaluated,
            matched = report.matched,
            actions = report.actions_applied,
            failures = report.action_failures,
            cancelled = report.cancelled,
            "automation pass finished"
        );
        Ok(report)
    }

    async fn process_message(
        &self,
        rules: &[CompiledRule],
        record: MessageRecord,
    ) -> Result<MessageOutcome, RuleError> {
        let mut view = self.view_of(&record);
        let mut body_loaded = view.body.is_some();
        let mut current = record;
        let mut priority = None;
        let mut outcome = MessageOutcome::default();

        for compiled in rules {
            if compiled.needs_body() && !body_loaded {
                body_loaded = true;
                match self.bodies.body_text(&current).await {
                    Ok(text) => view.body = Some(text),
                    Err(err) => {
                        let err = RuleError::Condition(format!("body of {}: {err}", current.id));
                        tracing::warn!(message = %current.id, error = %err, "body predicates evaluate false");
                    }
                }
            }
            if !compiled.matches(&view) {
                continue;
            }

            outcome.matched += 1;
            if let Err(err) = self
                .storage
                .record_rule_trigger(compiled.rule.id, Utc::now())
                .await
            {
                tracing::error!(rule = %compiled.rule.id, error = %err, "rule statistics not recorded");
            }
            tracing::debug!(message = %current.id, rule = %compiled.rule.name, "rule matched");

            let mut stop = false;
            for action in &compiled.rule.actions {
                match self.apply_action(&mut current, action, &mut priority).await {
                    Ok(ActionStep::Applied) => outcome.actions_applied += 1,
                    Ok(ActionStep::Skipped) => {}
                    Ok(ActionStep::StopRules) => stop = true,
                    Err(err) => {
                        outcome.action_failures += 1;
                        tracing::error!(
                            message = %current.id,
                            rule = %compiled.rule.id,
                            error = %err,
                            "rule action failed"
                        );
                    }
                }
                if current.soft_deleted_at.is_some() {
                    stop = true;
                    break;
                }
            }
            view.folder.clone_from(&current.folder);
            if stop {
                break;
            }
        }

        if !self.storage.complete_automation(current.id, priority).await? {
            tracing::debug!(message = %current.id, "message was already processed");
        }
        Ok(outcome)
    }

    async fn apply_action(
        &self,
        current: &mut MessageRecord,
        action: &RuleAction,
        priority: &mut Option<MessagePriority>,
    ) -> Result<ActionStep, RuleError> {
        let failed = |err: &dyn std::fmt::Display| RuleError::Action {
            action: action.kind(),
            message: err.to_string(),
        };

        match action {
            RuleAction::MoveToFolder { folder } => {
                *current = self
                    .moves
                    .move_message(current, folder)
                    .await
                    .map_err(|err| failed(&err))?;
            }
            RuleAction::MarkRead => {
                *current = self
                    .flags
                    .apply_local_change(current, FlagKind::Seen, true)
                    .await
                    .map_err(|err| failed(&err))?;
            }
            RuleAction::MarkFlagged => {
                *current = self
                    .flags
                    .apply_local_change(current, FlagKind::Flagged, true)
                    .await
                    .map_err(|err| failed(&err))?;
            }
            RuleAction::ApplyTag { tag } => {
                let found = self
                    .tags
                    .get_tag_by_name(current.account_id, tag)
                    .await
                    .map_err(|err| failed(&err))?;
                let Some(found) = found else {
                    tracing::warn!(message = %current.id, tag = %tag, "tag does not exist, skipped");
                    return Ok(ActionStep::Skipped);
                };
                self.tags
                    .assign_tag(current.id, &found)
                    .await
                    .map_err(|err| failed(&err))?;
            }
            RuleAction::SetPriority { priority: value } => *priority = Some(*value),
            RuleAction::SoftDelete => {
                *current = self
                    .moves
                    .delete_message(current)
                    .await
                    .map_err(|err| failed(&err))?;
            }
            RuleAction::StopProcessing => return Ok(ActionStep::StopRules),
        }
        Ok(ActionStep::Applied)
    }

    /// Evaluate `rules` against the newest `limit` messages using stored
    /// data only. Nothing is written and the server is never contacted.
    pub async fn dry_run(
        &self,
        account_id: Uuid,
        rules: &[MailRule],
        limit: usize,
    ) -> Result<DryRunReport, RuleError> {
        let rules = compile_rules(
            rules
                .iter()
                .filter(|rule| rule.account_id == account_id)
                .cloned()
                .collect(),
        );
        let recent = self
            .storage
            .list_recent(account_id, limit.max(1) as i64)
            .await?;

        let mut report = DryRunReport::default();
        for record in &recent {
            report.evaluated += 1;
            let view = self.view_of(record);
            for compiled in &rules {
                if !compiled.matches(&view) {
                    continue;
                }
                report.matches.push(DryRunMatch {
                    message_id: record.id,
                    rule_id: compiled.rule.id,
                    rule_name: compiled.rule.name.clone(),
                    actions: compiled.rule.actions.clone(),
                });
                let deletes = compiled
                    .rule
                    .actions
                    .iter()
                    .any(|action| matches!(action, RuleAction::SoftDelete));
                if deletes || compiled.stops_processing() {
                    break;
                }
            }
        }

        tracing::debug!(
            account_id = %account_id,
            evaluated = report.evaluated,
            matches = report.matches.len(),
            "dry run finished"
        );
        Ok(report)
    }

    /// Decrypted fields for evaluation. A payload that fails to open reads
    /// as empty.
    fn view_of(&self, record: &MessageRecord) -> MessageView {
        MessageView {
            sender: self.open_or_blank(record.id, "sender", &record.sender_sealed),
            subject: self.open_or_blank(record.id, "subject", &record.subject_sealed),
            body: record
                .body_sealed
                .as_ref()
                .map(|sealed| self.open_or_blank(record.id, "body", sealed)),
            folder: record.folder.clone(),
            has_attachments: record.has_attachments,
        }
    }

    fn open_or_blank(&self, id: Uuid, field: &'static str, sealed: &[u8]) -> String {
        if sealed.is_empty() {
            return String::new();
        }
        match self.cipher.open_string(sealed) {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(message = %id, field, error = %err, "payload could not be opened");
                String::new()
            }
        }
    }
}
