use crate::{EmailError, FetchParts, MailboxSession};
use sift_core::{FlagKind, MessageFlags, MessageRecord};
use sift_storage::Storage;
use std::collections::HashMap;
use uuid::Uuid;

/// Outcome of reconciling one message's flags bit by bit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagPlan {
    pub merged: MessageFlags,
    /// Bits to set on the server.
    pub add: Vec<FlagKind>,
    /// Bits to clear on the server.
    pub remove: Vec<FlagKind>,
}

impl FlagPlan {
    pub fn needs_push(&self) -> bool {
        !self.add.is_empty() || !self.remove.is_empty()
    }
}

/// A bit that changed locally since the last exchange is pushed; every other
/// bit takes the server's value. Bits already matching the server are never
/// sent.
pub fn plan_flags(
    local: MessageFlags,
    last_remote: MessageFlags,
    server: MessageFlags,
) -> FlagPlan {
    let mut plan = FlagPlan {
        merged: MessageFlags::default(),
        add: Vec::new(),
        remove: Vec::new(),
    };

    for kind in FlagKind::ALL {
        let local_bit = local.get(kind);
        if local_bit != last_remote.get(kind) {
            plan.merged.set(kind, local_bit);
            if server.get(kind) != local_bit {
                if local_bit {
                    plan.add.push(kind);
                } else {
                    plan.remove.push(kind);
                }
            }
        } else {
            plan.merged.set(kind, server.get(kind));
        }
    }

    plan
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlagSyncReport {
    /// Messages whose local flags took server changes.
    pub pulled: usize,
    /// Messages whose local changes reached the server.
    pub pushed: usize,
    /// Messages whose flags could not be fetched or pushed; they are
    /// reconciled again on the next pass.
    pub failed: usize,
}

struct PushOutcome {
    id: Uuid,
    uid: u32,
    server: MessageFlags,
    plan: FlagPlan,
    error: Option<String>,
}

#[derive(Clone)]
pub struct FlagSynchronizer {
    storage: Storage,
    session: MailboxSession,
}

impl FlagSynchronizer {
    pub fn new(storage: Storage, session: MailboxSession) -> Self {
        Self { storage, session }
    }

    pub async fn reconcile_folder(
        &self,
        account_id: Uuid,
        folder: &str,
        uidvalidity: u32,
        batch_size: usize,
    ) -> Result<FlagSyncReport, EmailError> {
        let records = self
            .storage
            .list_folder_messages(account_id, folder, uidvalidity)
            .await?;
        if records.is_empty() {
            return Ok(FlagSyncReport::default());
        }

        let known: HashMap<u32, (Uuid, MessageFlags, MessageFlags)> = records
            .iter()
            .filter_map(|record| {
                record
                    .uid
                    .map(|uid| (uid, (record.id, record.flags, record.remote_flags)))
            })
            .collect();
        let batch_size = batch_size.max(1);
        let folder_name = folder.to_string();

        let (outcomes, unfetched) = self
            .session
            .in_folder(folder, move |client, status| {
                if status.uidvalidity != uidvalidity {
                    tracing::debug!(folder = %folder_name, "epoch changed, flag pass skipped");
                    return Ok((Vec::new(), 0));
                }

                let mut uids: Vec<u32> = known.keys().copied().collect();
                uids.sort_unstable();

                let mut outcomes = Vec::new();
                let mut unfetched = 0;
                for chunk in uids.chunks(batch_size) {
                    let fetched = match client.fetch(chunk, FetchParts::Flags) {
                        Ok(fetched) => fetched,
                        Err(err) => {
                            tracing::error!(
                                folder = %folder_name,
                                first_uid = chunk[0],
                                count = chunk.len(),
                                error = %err,
                                "flag fetch failed, chunk skipped"
                            );
                            unfetched += chunk.len();
                            continue;
                        }
                    };
                    for fetched in fetched {
                        let Some((id, local, last_remote)) = known.get(&fetched.uid) else {
                            continue;
                        };
                        let plan = plan_flags(*local, *last_remote, fetched.flags);
                        if plan.merged == *local && fetched.flags == *last_remote {
                            continue;
                        }

                        let mut error = None;
                        if !plan.add.is_empty() {
                            if let Err(err) = client.add_flags(&[fetched.uid], &plan.add) {
                                error = Some(err.to_string());
                            }
                        }
                        if error.is_none() && !plan.remove.is_empty() {
                            if let Err(err) = client.remove_flags(&[fetched.uid], &plan.remove) {
                                error = Some(err.to_string());
                            }
                        }

                        outcomes.push(PushOutcome {
                            id: *id,
                            uid: fetched.uid,
                            server: fetched.flags,
                            plan,
                            error,
                        });
                    }
                }
                Ok((outcomes, unfetched))
            })
            .await?;

        let mut report = FlagSyncReport {
            failed: unfetched,
            ..FlagSyncReport::default()
        };
        for outcome in outcomes {
            match &outcome.error {
                None => {
                    self.storage
                        .update_message_flags(outcome.id, outcome.plan.merged, outcome.plan.merged)
                        .await?;
                    if outcome.plan.needs_push() {
                        report.pushed += 1;
                    } else {
                        report.pulled += 1;
                    }
                }
                Some(err) => {
                    tracing::error!(
                        %account_id,
                        folder,
                        uid = outcome.uid,
                        error = %err,
                        "flag push failed"
                    );
                    self.storage
                        .update_message_flags(outcome.id, outcome.plan.merged, outcome.server)
                        .await?;
                    report.failed += 1;
                }
            }
        }

        tracing::debug!(
            %account_id,
            folder,
            pulled = report.pulled,
            pushed = report.pushed,
            failed = report.failed,
            "flags reconciled"
        );
        Ok(report)
    }

    /// Change one flag locally and push it. If the push fails the record is
    /// left dirty and the next reconcile pass retries it.
    pub async fn apply_local_change(
        &self,
        record: &MessageRecord,
        kind: FlagKind,
        value: bool,
    ) -> Result<MessageRecord, EmailError> {
        let mut updated = record.clone();
        updated.flags.set(kind, value);
        if updated.flags == record.flags {
            return Ok(updated);
        }
        self.storage
            .update_message_flags(updated.id, updated.flags, updated.remote_flags)
            .await?;

        let Some(uid) = record.uid else {
            tracing::debug!(message = %record.id, "no server identifier yet, push deferred");
            return Ok(updated);
        };

        if updated.remote_flags.get(kind) == value {
            return Ok(updated);
        }

        let pushed = self
            .session
            .in_folder(&record.folder, move |client, _| {
                if value {
                    client.add_flags(&[uid], &[kind])
                } else {
                    client.remove_flags(&[uid], &[kind])
                }
            })
            .await;

        match pushed {
            Ok(()) => {
                updated.remote_flags.set(kind, value);
                self.storage
                    .update_message_flags(updated.id, updated.flags, updated.remote_flags)
                    .await?;
            }
            Err(err) => {
                tracing::error!(message = %record.id, flag = ?kind, error = %err, "flag push failed");
            }
        }

        Ok(updated)
    }
}
