use crate::{EmailError, NormalizedEnvelope};
use sift_core::MessageRecord;
use sift_storage::{Storage, ThreadAdoption};
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

/// Hard cap on how many reference entries or parent links one resolution walks.
pub const MAX_THREAD_DEPTH: usize = 128;

#[derive(Debug, Default)]
pub struct ThreadedBatch {
    pub records: Vec<MessageRecord>,
    pub adoptions: Vec<ThreadAdoption>,
}

#[derive(Debug, Clone)]
struct KnownMessage {
    id: Uuid,
    thread_id: String,
    parent_id: Option<Uuid>,
}

impl From<&MessageRecord> for KnownMessage {
    fn from(record: &MessageRecord) -> Self {
        Self {
            id: record.id,
            thread_id: record.thread_id.clone(),
            parent_id: record.parent_id,
        }
    }
}

#[derive(Clone)]
pub struct ThreadCalculator {
    storage: Storage,
}

impl ThreadCalculator {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Give every envelope of a batch its local id, thread and parent.
    ///
    /// Matches are looked up against stored records and earlier members of
    /// the same batch; a message that is already stored keeps its thread.
    pub async fn assign(
        &self,
        account_id: Uuid,
        mut envelopes: Vec<NormalizedEnvelope>,
    ) -> Result<ThreadedBatch, EmailError> {
        if envelopes.is_empty() {
            return Ok(ThreadedBatch::default());
        }
        self.keep_stored_synthetic_ids(account_id, &mut envelopes)
            .await?;

        let mut lookups: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        for envelope in &envelopes {
            let candidates = std::iter::once(&envelope.message_id)
                .chain(envelope.in_reply_to.iter())
                .chain(envelope.references.iter());
            for id in candidates {
                if seen.insert(id.as_str()) {
                    lookups.push(id.clone());
                }
            }
        }
        let own_ids: Vec<String> = envelopes.iter().map(|e| e.message_id.clone()).collect();

        let mut known: HashMap<String, KnownMessage> = self
            .storage
            .find_by_message_ids(account_id, &lookups)
            .await?
            .iter()
            .map(|record| (record.message_id.clone(), KnownMessage::from(record)))
            .collect();

        let mut waiting_children: HashMap<String, Vec<MessageRecord>> = HashMap::new();
        for orphan in self
            .storage
            .find_roots_replying_to(account_id, &own_ids)
            .await?
        {
            if let Some(parent) = orphan.in_reply_to.clone() {
                waiting_children.entry(parent).or_default().push(orphan);
            }
        }

        let mut batch = ThreadedBatch::default();
        for envelope in envelopes {
            if let Some(existing) = known.get(&envelope.message_id) {
                let record = envelope.into_record(
                    existing.id,
                    existing.thread_id.clone(),
                    existing.parent_id,
                );
                batch.records.push(record);
                continue;
            }

            let id = Uuid::new_v4();
            let (thread_id, parent_id) = match closest_known(&envelope, &known) {
                Some(parent) => (parent.thread_id.clone(), Some(parent.id)),
                None => {
                    let stored = waiting_children
                        .remove(&envelope.message_id)
                        .unwrap_or_default();
                    match adopt_children(&envelope.message_id, id, stored, &mut batch) {
                        Some(thread_id) => (thread_id, None),
                        None => (Uuid::new_v4().to_string(), None),
                    }
                }
            };

            let record = envelope.into_record(id, thread_id, parent_id);
            known.insert(record.message_id.clone(), KnownMessage::from(&record));
            batch.records.push(record);
        }

        Ok(batch)
    }

    /// A message without a Message-ID that is already stored at the same
    /// location keeps the identifier it was stored under. Its synthetic id
    /// was minted where it first arrived, which may be another folder.
    async fn keep_stored_synthetic_ids(
        &self,
        account_id: Uuid,
        envelopes: &mut [NormalizedEnvelope],
    ) -> Result<(), EmailError> {
        let mut locations: BTreeMap<(String, u32), Vec<u32>> = BTreeMap::new();
        for envelope in envelopes.iter().filter(|e| e.message_id_synthetic) {
            locations
                .entry((envelope.folder.clone(), envelope.uidvalidity))
                .or_default()
                .push(envelope.uid);
        }

        for ((folder, uidvalidity), uids) in locations {
            let stored: HashMap<u32, String> = self
                .storage
                .find_by_uids(account_id, &folder, uidvalidity, &uids)
                .await?
                .into_iter()
                .filter_map(|record| record.uid.map(|uid| (uid, record.message_id)))
                .collect();
            for envelope in envelopes.iter_mut().filter(|e| {
                e.message_id_synthetic && e.folder == folder && e.uidvalidity == uidvalidity
            }) {
                if let Some(message_id) = stored.get(&envelope.uid) {
                    envelope.message_id.clone_from(message_id);
                }
            }
        }
        Ok(())
    }

    /// Walk parent links up to the root. Stops at a missing parent, a cycle,
    /// or [`MAX_THREAD_DEPTH`] hops, returning the highest record reached.
    pub async fn resolve_root(&self, message: &MessageRecord) -> Result<MessageRecord, EmailError> {
        let mut current = message.clone();
        let mut visited = HashSet::from([current.id]);

        for _ in 0..MAX_THREAD_DEPTH {
            let Some(parent_id) = current.parent_id else {
                return Ok(current);
            };
            if !visited.insert(parent_id) {
                tracing::warn!(thread_id = %current.thread_id, message = %parent_id, "parent cycle");
                return Ok(current);
            }
            match self.storage.get_message(parent_id).await? {
                Some(parent) => current = parent,
                None => return Ok(current),
            }
        }

        tracing::warn!(thread_id = %current.thread_id, "parent chain exceeds depth cap");
        Ok(current)
    }
}

/// In-Reply-To first, then References from the direct-parent end toward the root.
fn closest_known<'a>(
    envelope: &NormalizedEnvelope,
    known: &'a HashMap<String, KnownMessage>,
) -> Option<&'a KnownMessage> {
    let mut visited = HashSet::from([envelope.message_id.as_str()]);
    envelope
        .in_reply_to
        .iter()
        .chain(envelope.references.iter().rev())
        .take(MAX_THREAD_DEPTH)
        .filter(|id| visited.insert(id.as_str()))
        .find_map(|id| known.get(id))
}

/// Make `parent_id` the parent of thread roots that were waiting for
/// `message_id`, from storage or earlier in this batch. The parent joins the
/// earliest child's thread; children in other threads are left alone.
fn adopt_children(
    message_id: &str,
    parent_id: Uuid,
    stored: Vec<MessageRecord>,
    batch: &mut ThreadedBatch,
) -> Option<String> {
    let in_batch: Vec<usize> = batch
        .records
        .iter()
        .enumerate()
        .filter(|(_, record)| {
            record.parent_id.is_none() && record.in_reply_to.as_deref() == Some(message_id)
        })
        .map(|(index, _)| index)
        .collect();

    let thread_id = stored
        .first()
        .map(|child| child.thread_id.clone())
        .or_else(|| in_batch.first().map(|index| batch.records[*index].thread_id.clone()))?;

    for child in stored {
        if child.thread_id == thread_id {
            batch.adoptions.push(ThreadAdoption {
                child_id: child.id,
                parent_id,
            });
        } else {
            tracing::warn!(
                message_id,
                child = %child.id,
                child_thread = %child.thread_id,
                "early reply sits in another thread; not merged"
            );
        }
    }
    for index in in_batch {
        let child = &mut batch.records[index];
        if child.thread_id == thread_id {
            child.parent_id = Some(parent_id);
        }
    }

    Some(thread_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sift_core::{MessageFlags, RemapState};

    fn envelope(message_id: &str, in_reply_to: Option<&str>, references: &[&str]) -> NormalizedEnvelope {
        NormalizedEnvelope {
            account_id: Uuid::nil(),
            folder: "INBOX".to_string(),
            uidvalidity: 1,
            uid: 1,
            message_id: message_id.to_string(),
            message_id_synthetic: false,
            in_reply_to: in_reply_to.map(str::to_string),
            references: references.iter().map(|r| r.to_string()).collect(),
            flags: MessageFlags::default(),
            size: 0,
            content_type: None,
            charset: None,
            has_attachments: false,
            subject_sealed: Vec::new(),
            sender_sealed: Vec::new(),
            received_at: chrono::Utc::now(),
            sent_at: None,
            parse_degraded: false,
        }
    }

    fn known(thread: &str) -> KnownMessage {
        KnownMessage {
            id: Uuid::new_v4(),
            thread_id: thread.to_string(),
            parent_id: None,
        }
    }

    #[test]
    fn in_reply_to_wins_over_references() {
        let mut map = HashMap::new();
        map.insert("<a@x>".to_string(), known("t-a"));
        map.insert("<b@x>".to_string(), known("t-b"));
        let reply = envelope("<c@x>", Some("<b@x>"), &["<a@x>"]);
        assert_eq!(closest_known(&reply, &map).map(|k| k.thread_id.as_str()), Some("t-b"));
    }

    #[test]
    fn references_scan_from_the_direct_parent_end() {
        let mut map = HashMap::new();
        map.insert("<a@x>".to_string(), known("t-a"));
        map.insert("<b@x>".to_string(), known("t-b"));
        let reply = envelope("<d@x>", Some("<c@x>"), &["<a@x>", "<b@x>", "<c@x>"]);
        assert_eq!(closest_known(&reply, &map).map(|k| k.thread_id.as_str()), Some("t-b"));
    }

    #[test]
    fn self_references_are_ignored() {
        let mut map = HashMap::new();
        map.insert("<loop@x>".to_string(), known("t-loop"));
        let looping = envelope("<loop@x>", Some("<loop@x>"), &["<loop@x>", "<loop@x>"]);
        assert!(closest_known(&looping, &map).is_none());
    }

    #[test]
    fn batch_roots_waiting_for_a_parent_are_adopted() {
        let mut batch = ThreadedBatch::default();
        let child = envelope("<b@x>", Some("<a@x>"), &[]).into_record(
            Uuid::new_v4(),
            "t-early".to_string(),
            None,
        );
        batch.records.push(child);

        let parent_id = Uuid::new_v4();
        let thread = adopt_children("<a@x>", parent_id, Vec::new(), &mut batch);
        assert_eq!(thread.as_deref(), Some("t-early"));
        assert_eq!(batch.records[0].parent_id, Some(parent_id));
        assert_eq!(batch.records[0].remap_state, RemapState::Confirmed);
        assert!(batch.adoptions.is_empty());
    }
}
