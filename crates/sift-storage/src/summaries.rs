use crate::storage::{parse_datetime, parse_uuid};
use crate::{Storage, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sift_core::Pagination;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadPage {
    /// Newest activity first.
    pub thread_ids: Vec<String>,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadAggregate {
    pub thread_id: String,
    pub message_count: usize,
    pub latest_date: DateTime<Utc>,
    pub oldest_date: DateTime<Utc>,
    pub has_unread: bool,
}

/// The sealed header fields of one thread member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadMember {
    pub thread_id: String,
    pub id: Uuid,
    pub received_at: DateTime<Utc>,
    pub subject_sealed: Vec<u8>,
    pub sender_sealed: Vec<u8>,
}

/// Set-oriented reads backing thread summaries. Every method is a single
/// query whatever the number of threads asked for. Soft-deleted messages are
/// invisible to all of them.
#[async_trait]
pub trait ThreadSummarySource: Send + Sync {
    async fn page_threads(
        &self,
        account_id: Uuid,
        page: &Pagination,
    ) -> Result<ThreadPage, StorageError>;

    async fn thread_aggregates(
        &self,
        account_id: Uuid,
        thread_ids: &[String],
    ) -> Result<Vec<ThreadAggregate>, StorageError>;

    async fn latest_per_thread(
        &self,
        account_id: Uuid,
        thread_ids: &[String],
    ) -> Result<Vec<ThreadMember>, StorageError>;

    /// Every parentless member; a healthy thread yields exactly one.
    async fn roots_per_thread(
        &self,
        account_id: Uuid,
        thread_ids: &[String],
    ) -> Result<Vec<ThreadMember>, StorageError>;

    async fn earliest_per_thread(
        &self,
        account_id: Uuid,
        thread_ids: &[String],
    ) -> Result<Vec<ThreadMember>, StorageError>;

    /// All active members of the account, for matching against decrypted headers.
    async fn searchable_members(&self, account_id: Uuid)
        -> Result<Vec<ThreadMember>, StorageError>;
}

#[async_trait]
impl ThreadSummarySource for Storage {
    async fn page_threads(
        &self,
        account_id: Uuid,
        page: &Pagination,
    ) -> Result<ThreadPage, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT thread_id, MAX(received_at) AS latest, COUNT(*) OVER () AS total_threads
            FROM messages
            WHERE account_id = ?1 AND soft_deleted_at IS NULL
            GROUP BY thread_id
            ORDER BY latest DESC, thread_id ASC
            LIMIT ?2 OFFSET ?3
            "#,
        )
        .bind(account_id.to_string())
        .bind(page.limit as i64)
        .bind(page.offset as i64)
        .fetch_all(self.pool())
        .await?;

        let total = match rows.first() {
            Some(row) => row.try_get::<i64, _>("total_threads")?.max(0) as usize,
            None => 0,
        };
        let thread_ids = rows
            .into_iter()
            .map(|row| row.try_get::<String, _>("thread_id"))
            .collect::<Result<_, _>>()?;

        Ok(ThreadPage { thread_ids, total })
    }

    async fn thread_aggregates(
        &self,
        account_id: Uuid,
        thread_ids: &[String],
    ) -> Result<Vec<ThreadAggregate>, StorageError> {
        if thread_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT
              thread_id,
              COUNT(*) AS message_count,
              MAX(received_at) AS latest_date,
              MIN(received_at) AS oldest_date,
              MAX(CASE WHEN (flags & 1) = 0 THEN 1 ELSE 0 END) AS has_unread
            FROM messages
            WHERE account_id = ?1
              AND soft_deleted_at IS NULL
              AND thread_id IN (SELECT value FROM json_each(?2))
            GROUP BY thread_id
            "#,
        )
        .bind(account_id.to_string())
        .bind(serde_json::to_string(thread_ids)?)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(|row| {
                let latest_raw: String = row.try_get("latest_date")?;
                let oldest_raw: String = row.try_get("oldest_date")?;
                Ok(ThreadAggregate {
                    thread_id: row.try_get("thread_id")?,
                    message_count: row.try_get::<i64, _>("message_count")?.max(0) as usize,
                    latest_date: parse_datetime(&latest_raw, "messages.received_at")?,
                    oldest_date: parse_datetime(&oldest_raw, "messages.received_at")?,
                    has_unread: row.try_get::<i32, _>("has_unread")? != 0,
                })
            })
            .collect()
    }

    async fn latest_per_thread(
        &self,
        account_id: Uuid,
        thread_ids: &[String],
    ) -> Result<Vec<ThreadMember>, StorageError> {
        ranked_members(self, account_id, thread_ids, "received_at DESC, id DESC").await
    }

    async fn roots_per_thread(
        &self,
        account_id: Uuid,
        thread_ids: &[String],
    ) -> Result<Vec<ThreadMember>, StorageError> {
        if thread_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT thread_id, id, received_at, subject_sealed, sender_sealed
            FROM messages
            WHERE account_id = ?1
              AND soft_deleted_at IS NULL
              AND parent_id IS NULL
              AND thread_id IN (SELECT value FROM json_each(?2))
            ORDER BY thread_id ASC, received_at ASC
            "#,
        )
        .bind(account_id.to_string())
        .bind(serde_json::to_string(thread_ids)?)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(row_to_member).collect()
    }

    async fn earliest_per_thread(
        &self,
        account_id: Uuid,
        thread_ids: &[String],
    ) -> Result<Vec<ThreadMember>, StorageError> {
        ranked_members(self, account_id, thread_ids, "received_at ASC, id ASC").await
    }

    async fn searchable_members(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<ThreadMember>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT thread_id, id, received_at, subject_sealed, sender_sealed
            FROM messages
            WHERE account_id = ?1 AND soft_deleted_at IS NULL
            "#,
        )
        .bind(account_id.to_string())
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(row_to_member).collect()
    }
}

/// First member of each thread under `order`. `order` is one of the fixed
/// orderings above, never caller input.
async fn ranked_members(
    storage: &Storage,
    account_id: Uuid,
    thread_ids: &[String],
    order: &'static str,
) -> Result<Vec<ThreadMember>, StorageError> {
    if thread_ids.is_empty() {
        return Ok(Vec::new());
    }

    let sql = format!(
        r#"
        SELECT thread_id, id, received_at, subject_sealed, sender_sealed
        FROM (
          SELECT thread_id, id, received_at, subject_sealed, sender_sealed,
                 ROW_NUMBER() OVER (PARTITION BY thread_id ORDER BY {order}) AS row_rank
          FROM messages
          WHERE account_id = ?1
            AND soft_deleted_at IS NULL
            AND thread_id IN (SELECT value FROM json_each(?2))
        )
        WHERE row_rank = 1
        "#
    );

    let rows = sqlx::query(&sql)
        .bind(account_id.to_string())
        .bind(serde_json::to_string(thread_ids)?)
        .fetch_all(storage.pool())
        .await?;

    rows.into_iter().map(row_to_member).collect()
}

fn row_to_member(row: SqliteRow) -> Result<ThreadMember, StorageError> {
    let id_raw: String = row.try_get("id")?;
    let received_raw: String = row.try_get("received_at")?;
    Ok(ThreadMember {
        thread_id: row.try_get("thread_id")?,
        id: parse_uuid(&id_raw, "messages.id")?,
        received_at: parse_datetime(&received_raw, "messages.received_at")?,
        subject_sealed: row.try_get("subject_sealed")?,
        sender_sealed: row.try_get("sender_sealed")?,
    })
}
