use crate::EmailError;
use chrono::{DateTime, Utc};
use sift_core::{Pagination, PayloadCipher, RootConfidence, SearchResult, ThreadSummary};
use sift_storage::{ThreadMember, ThreadSummarySource};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// Pick the display root of a thread. A single parentless member is the
/// root; otherwise the earliest member stands in with degraded confidence.
pub fn select_root(
    roots: &[ThreadMember],
    earliest: Option<&ThreadMember>,
) -> Option<(ThreadMember, RootConfidence)> {
    if let [root] = roots {
        return Some((root.clone(), RootConfidence::Confirmed));
    }

    earliest
        .or_else(|| roots.iter().min_by_key(|member| (member.received_at, member.id)))
        .map(|member| (member.clone(), RootConfidence::Degraded))
}

/// Builds thread summaries with a fixed number of store round trips,
/// whatever the number of threads on the page.
#[derive(Clone)]
pub struct ThreadSummaryEngine {
    source: Arc<dyn ThreadSummarySource>,
    cipher: Arc<dyn PayloadCipher>,
}

impl ThreadSummaryEngine {
    pub fn new(source: Arc<dyn ThreadSummarySource>, cipher: Arc<dyn PayloadCipher>) -> Self {
        Self { source, cipher }
    }

    pub async fn list_threads(
        &self,
        account_id: Uuid,
        page: &Pagination,
    ) -> Result<SearchResult<ThreadSummary>, EmailError> {
        let listed = self.source.page_threads(account_id, page).await?;
        let items = self
            .summaries_for_threads(account_id, &listed.thread_ids)
            .await?;
        Ok(SearchResult {
            total: listed.total,
            items,
        })
    }

    /// Threads with any member whose subject or sender contains `query`,
    /// case-insensitively. Headers are sealed at rest, so matching happens
    /// after decryption.
    pub async fn search_threads(
        &self,
        account_id: Uuid,
        query: &str,
        page: &Pagination,
    ) -> Result<SearchResult<ThreadSummary>, EmailError> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return self.list_threads(account_id, page).await;
        }

        let members = self.source.searchable_members(account_id).await?;
        let mut latest: HashMap<String, DateTime<Utc>> = HashMap::new();
        let mut matched: HashSet<String> = HashSet::new();
        for member in &members {
            let entry = latest
                .entry(member.thread_id.clone())
                .or_insert(member.received_at);
            if member.received_at > *entry {
                *entry = member.received_at;
            }

            if matched.contains(&member.thread_id) {
                continue;
            }
            let subject = self.open_or_blank(&member.subject_sealed, member.id);
            let sender = self.open_or_blank(&member.sender_sealed, member.id);
            if subject.to_lowercase().contains(&needle) || sender.to_lowercase().contains(&needle)
            {
                matched.insert(member.thread_id.clone());
            }
        }

        let mut ordered: Vec<(DateTime<Utc>, String)> = matched
            .into_iter()
            .filter_map(|thread_id| latest.get(&thread_id).map(|at| (*at, thread_id)))
            .collect();
        ordered.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        let total = ordered.len();
        let thread_ids: Vec<String> = ordered
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .map(|(_, thread_id)| thread_id)
            .collect();

        let items = self.summaries_for_threads(account_id, &thread_ids).await?;
        Ok(SearchResult { total, items })
    }

    /// Summaries for `thread_ids`, in the given order. Threads with no active
    /// members are left out.
    pub async fn summaries_for_threads(
        &self,
        account_id: Uuid,
        thread_ids: &[String],
    ) -> Result<Vec<ThreadSummary>, EmailError> {
        if thread_ids.is_empty() {
            return Ok(Vec::new());
        }

        let aggregates: HashMap<String, _> = self
            .source
            .thread_aggregates(account_id, thread_ids)
            .await?
            .into_iter()
            .map(|aggregate| (aggregate.thread_id.clone(), aggregate))
            .collect();
        let latest: HashMap<String, ThreadMember> = self
            .source
            .latest_per_thread(account_id, thread_ids)
            .await?
            .into_iter()
            .map(|member| (member.thread_id.clone(), member))
            .collect();
        let mut roots: HashMap<String, Vec<ThreadMember>> = HashMap::new();
        for member in self.source.roots_per_thread(account_id, thread_ids).await? {
            roots.entry(member.thread_id.clone()).or_default().push(member);
        }

        let unsettled: Vec<String> = thread_ids
            .iter()
            .filter(|id| aggregates.contains_key(*id))
            .filter(|id| roots.get(*id).map_or(0, Vec::len) != 1)
            .cloned()
            .collect();
        let earliest: HashMap<String, ThreadMember> = if unsettled.is_empty() {
            HashMap::new()
        } else {
            self.source
                .earliest_per_thread(account_id, &unsettled)
                .await?
                .into_iter()
                .map(|member| (member.thread_id.clone(), member))
                .collect()
        };

        let mut summaries = Vec::with_capacity(thread_ids.len());
        for thread_id in thread_ids {
            let (Some(aggregate), Some(newest)) = (aggregates.get(thread_id), latest.get(thread_id))
            else {
                continue;
            };
            let candidates = roots.get(thread_id).map(Vec::as_slice).unwrap_or_default();
            let Some((root, confidence)) = select_root(candidates, earliest.get(thread_id)) else {
                continue;
            };
            if confidence == RootConfidence::Degraded {
                tracing::warn!(
                    %account_id,
                    thread_id = %thread_id,
                    parentless = candidates.len(),
                    "thread root ambiguous, using earliest message"
                );
            }

            summaries.push(ThreadSummary {
                thread_id: thread_id.clone(),
                message_count: aggregate.message_count,
                latest_date: aggregate.latest_date,
                oldest_date: aggregate.oldest_date,
                has_unread: aggregate.has_unread,
                latest_sender: self.open_or_blank(&newest.sender_sealed, newest.id),
                subject: self.open_or_blank(&root.subject_sealed, root.id),
                latest_message: newest.id,
                root_message: root.id,
                root_confidence: confidence,
            });
        }

        Ok(summaries)
    }

    fn open_or_blank(&self, sealed: &[u8], message_id: Uuid) -> String {
        if sealed.is_empty() {
            return String::new();
        }
        match self.cipher.open_string(sealed) {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(message = %message_id, error = %err, "sealed header unreadable");
                String::new()
            }
        }
    }
}
