use crate::backend::quote_mailbox;
use crate::{CopyUid, EmailError, MailboxSession};
use chrono::Utc;
use sift_core::{FlagKind, MessageRecord, RemapState};
use sift_storage::{MessageRemap, Storage};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Remaps for every record the confirmation covers, taken pair by pair from
/// the server's source and destination sets.
pub fn remap_from_copyuid(
    records: &[MessageRecord],
    destination: &str,
    copy: &CopyUid,
) -> Vec<MessageRemap> {
    records
        .iter()
        .filter_map(|record| {
            let uid = copy.destination_for(record.uid?)?;
            Some(MessageRemap {
                id: record.id,
                folder: destination.to_string(),
                uidvalidity: copy.uidvalidity,
                uid: Some(uid),
                state: RemapState::Confirmed,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub confirmed: usize,
    pub still_unconfirmed: usize,
}

enum MoveOutcome {
    Confirmed(CopyUid),
    Searched { uidvalidity: u32, matches: Vec<u32> },
}

fn header_search(message_id: &str) -> String {
    format!("HEADER Message-ID {}", quote_mailbox(message_id))
}

#[derive(Clone)]
pub struct MoveReconciler {
    storage: Storage,
    session: MailboxSession,
    trash_folder: Option<String>,
}

impl MoveReconciler {
    pub fn new(storage: Storage, session: MailboxSession, trash_folder: Option<String>) -> Self {
        Self {
            storage,
            session,
            trash_folder,
        }
    }

    /// Move one message and record where it landed. Without a COPYUID the
    /// destination is searched by Message-ID and the record stays
    /// unconfirmed until a sweep verifies it.
    pub async fn move_message(
        &self,
        record: &MessageRecord,
        destination: &str,
    ) -> Result<MessageRecord, EmailError> {
        if record.folder == destination {
            return Ok(record.clone());
        }
        let uid = record.uid.ok_or_else(|| {
            EmailError::Data(format!("message {} has no server identifier", record.id))
        })?;

        let source = record.folder.clone();
        let target = destination.to_string();
        let search = (!record.message_id_synthetic).then(|| header_search(&record.message_id));

        let outcome = self
            .session
            .run(move |client| {
                let exists = client
                    .list_folders()?
                    .iter()
                    .any(|folder| folder.name == target && folder.selectable);
                if !exists {
                    return Err(EmailError::Data(format!(
                        "destination folder {target} does not exist"
                    )));
                }

                client.select(&source)?;
                let copy = client.move_messages(&[uid], &target)?;
                if let Some(copy) = copy.filter(|copy| copy.destination_for(uid).is_some()) {
                    return Ok(MoveOutcome::Confirmed(copy));
                }

                let status = client.select(&target)?;
                let matches = match &search {
                    Some(query) => client.search(query)?,
                    None => Vec::new(),
                };
                Ok(MoveOutcome::Searched {
                    uidvalidity: status.uidvalidity,
                    matches,
                })
            })
            .await?;

        let remap = match outcome {
            MoveOutcome::Confirmed(copy) => {
                remap_from_copyuid(std::slice::from_ref(record), destination, &copy)
                    .pop()
                    .ok_or_else(|| {
                        EmailError::Data(format!("COPYUID does not cover message {}", record.id))
                    })?
            }
            MoveOutcome::Searched {
                uidvalidity,
                matches,
            } => {
                let found = match matches.as_slice() {
                    [only] => Some(*only),
                    _ => None,
                };
                tracing::warn!(
                    message = %record.id,
                    destination,
                    candidates = matches.len(),
                    "move not confirmed by server"
                );
                MessageRemap {
                    id: record.id,
                    folder: destination.to_string(),
                    uidvalidity,
                    uid: found,
                    state: RemapState::Unconfirmed,
                }
            }
        };

        self.storage
            .remap_messages(std::slice::from_ref(&remap))
            .await?;

        let mut moved = record.clone();
        moved.folder = remap.folder;
        moved.uidvalidity = remap.uidvalidity;
        moved.uid = remap.uid;
        moved.remap_state = remap.state;
        Ok(moved)
    }

    /// Move to trash when one is configured and the message is elsewhere,
    /// otherwise mark `\Deleted` without expunging. Either way the local
    /// record is soft-deleted.
    pub async fn delete_message(&self, record: &MessageRecord) -> Result<MessageRecord, EmailError> {
        let mut deleted = match &self.trash_folder {
            Some(trash) if *trash != record.folder && record.uid.is_some() => {
                self.move_message(record, trash).await?
            }
            _ => self.mark_deleted(record).await?,
        };

        let now = Utc::now();
        self.storage
            .soft_delete_message(deleted.id, deleted.flags, deleted.remote_flags, now)
            .await?;
        deleted.soft_deleted_at.get_or_insert(now);
        Ok(deleted)
    }

    async fn mark_deleted(&self, record: &MessageRecord) -> Result<MessageRecord, EmailError> {
        let mut marked = record.clone();
        marked.flags.deleted = true;

        match record.uid {
            Some(uid) if !record.remote_flags.deleted => {
                self.session
                    .in_folder(&record.folder, move |client, _| {
                        client.add_flags(&[uid], &[FlagKind::Deleted])
                    })
                    .await?;
                marked.remote_flags.deleted = true;
            }
            Some(_) => {}
            None => {
                tracing::warn!(message = %record.id, "no server identifier; deleted locally only");
            }
        }

        Ok(marked)
    }

    /// Look unconfirmed records up by Message-ID in the folder they are
    /// believed to be in. Exactly one hit confirms; anything else waits.
    pub async fn sweep_unconfirmed(&self, account_id: Uuid) -> Result<SweepReport, EmailError> {
        let mut report = SweepReport::default();
        let mut by_folder: BTreeMap<String, Vec<(Uuid, String)>> = BTreeMap::new();

        for record in self.storage.list_unconfirmed(account_id).await? {
            if record.message_id_synthetic {
                report.still_unconfirmed += 1;
                continue;
            }
            by_folder
                .entry(record.folder.clone())
                .or_default()
                .push((record.id, record.message_id));
        }

        let mut remaps = Vec::new();
        for (folder, pending) in by_folder {
            let count = pending.len();
            let target = folder.clone();
            let searched = self
                .session
                .run(move |client| {
                    let status = client.select(&target)?;
                    let mut hits = Vec::with_capacity(pending.len());
                    for (id, message_id) in pending {
                        hits.push((id, client.search(&header_search(&message_id))?));
                    }
                    Ok((status.uidvalidity, hits))
                })
                .await;

            let (uidvalidity, hits) = match searched {
                Ok(found) => found,
                Err(err) if err.is_protocol() => {
                    tracing::warn!(%account_id, folder = %folder, error = %err, "sweep skipped folder");
                    report.still_unconfirmed += count;
                    continue;
                }
                Err(err) => return Err(err),
            };

            for (id, matches) in hits {
                match matches.as_slice() {
                    [uid] => {
                        remaps.push(MessageRemap {
                            id,
                            folder: folder.clone(),
                            uidvalidity,
                            uid: Some(*uid),
                            state: RemapState::Confirmed,
                        });
                        report.confirmed += 1;
                    }
                    _ => report.still_unconfirmed += 1,
                }
            }
        }

        self.storage.remap_messages(&remaps).await?;
        if report.confirmed > 0 || report.still_unconfirmed > 0 {
            tracing::info!(
                %account_id,
                confirmed = report.confirmed,
                still_unconfirmed = report.still_unconfirmed,
                "unconfirmed sweep finished"
            );
        }
        Ok(report)
    }
}
