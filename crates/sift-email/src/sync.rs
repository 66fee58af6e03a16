use crate::{EmailError, FetchParts, MailboxSession, Normalizer, ThreadCalculator};
use sift_core::{PayloadCipher, SyncCursor};
use sift_storage::Storage;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderSyncReport {
    pub folder: String,
    pub fetched: usize,
    pub stored: usize,
    pub degraded: usize,
    /// Records detached because the folder's uidvalidity changed.
    pub invalidated: u64,
    pub cancelled: bool,
}

/// Incremental envelope sync for one account's folders.
#[derive(Clone)]
pub struct FolderSync {
    storage: Storage,
    session: MailboxSession,
    cipher: Arc<dyn PayloadCipher>,
    threads: ThreadCalculator,
    batch_size: usize,
}

impl FolderSync {
    pub fn new(
        storage: Storage,
        session: MailboxSession,
        cipher: Arc<dyn PayloadCipher>,
        batch_size: usize,
    ) -> Self {
        Self {
            threads: ThreadCalculator::new(storage.clone()),
            storage,
            session,
            cipher,
            batch_size: batch_size.max(1),
        }
    }

    /// Fetch everything above the folder's cursor in batches. Each batch is
    /// stored together with its cursor advance, so an interrupted run resumes
    /// where the last committed batch ended.
    pub async fn sync_folder(
        &self,
        account_id: Uuid,
        folder: &str,
        cancel: &CancellationToken,
    ) -> Result<FolderSyncReport, EmailError> {
        let mut report = FolderSyncReport {
            folder: folder.to_string(),
            ..FolderSyncReport::default()
        };

        let stored = self.storage.get_cursor(account_id, folder).await?;
        let resume = stored.as_ref().map(|c| (c.uidvalidity, c.last_uid));
        let (status, candidates) = self
            .session
            .in_folder(folder, move |client, status| {
                let start = match resume {
                    Some((uidvalidity, last_uid)) if uidvalidity == status.uidvalidity => {
                        last_uid.saturating_add(1)
                    }
                    _ => 1,
                };
                let uids = client.search(&format!("UID {start}:*"))?;
                Ok((status, uids))
            })
            .await?;

        let mut cursor = match stored {
            Some(cursor) if cursor.uidvalidity == status.uidvalidity => cursor,
            Some(_) => {
                report.invalidated = self
                    .storage
                    .invalidate_cursor(account_id, folder, status.uidvalidity)
                    .await?;
                SyncCursor::fresh(account_id, folder, status.uidvalidity)
            }
            None => SyncCursor::fresh(account_id, folder, status.uidvalidity),
        };

        // `n:*` also matches the highest existing identifier when nothing is newer.
        let new_uids: Vec<u32> = candidates
            .into_iter()
            .filter(|uid| *uid > cursor.last_uid)
            .collect();

        for chunk in new_uids.chunks(self.batch_size) {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let uids = chunk.to_vec();
            let expected = status.uidvalidity;
            let fetched = self
                .session
                .in_folder(folder, move |client, now| {
                    if now.uidvalidity != expected {
                        return Err(EmailError::Protocol(format!(
                            "uidvalidity changed mid-sync ({expected} -> {})",
                            now.uidvalidity
                        )));
                    }
                    client.fetch(&uids, FetchParts::Envelope)
                })
                .await?;

            let normalizer =
                Normalizer::new(account_id, folder, status.uidvalidity, self.cipher.as_ref());
            let mut envelopes = Vec::with_capacity(fetched.len());
            for raw in &fetched {
                let envelope = normalizer.normalize(raw)?;
                if envelope.parse_degraded {
                    report.degraded += 1;
                }
                envelopes.push(envelope);
            }

            let batch = self.threads.assign(account_id, envelopes).await?;
            if let Some(high) = chunk.iter().max() {
                cursor.last_uid = cursor.last_uid.max(*high);
            }
            self.storage
                .commit_ingest_batch(&batch.records, &batch.adoptions, &cursor)
                .await?;

            report.fetched += fetched.len();
            report.stored += batch.records.len();
            tracing::debug!(
                %account_id,
                folder,
                last_uid = cursor.last_uid,
                stored = batch.records.len(),
                adopted = batch.adoptions.len(),
                "batch committed"
            );
        }

        if !report.cancelled && !cursor.initial_sync_complete {
            // An empty folder has no committed batch that created the cursor row.
            self.storage.advance_cursor(&cursor).await?;
            self.storage
                .mark_initial_sync_complete(account_id, folder)
                .await?;
        }

        tracing::info!(
            %account_id,
            folder,
            fetched = report.fetched,
            stored = report.stored,
            degraded = report.degraded,
            invalidated = report.invalidated,
            cancelled = report.cancelled,
            "folder synced"
        );
        Ok(report)
    }
}
