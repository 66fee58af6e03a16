use crate::StorageError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use sift_core::{MessageFlags, MessagePriority, MessageRecord, RemapState, SyncCursor};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

/// Re-parent a stored thread root under a message that arrived after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadAdoption {
    pub child_id: Uuid,
    pub parent_id: Uuid,
}

/// New location of a message after a move, or after re-verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRemap {
    pub id: Uuid,
    pub folder: String,
    pub uidvalidity: u32,
    pub uid: Option<u32>,
    pub state: RemapState,
}

impl Storage {
    pub async fn connect(db_path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());
        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30))
            .pragma("temp_store", "memory")
            .pragma("cache_size", "-20000");

        let pool = SqlitePoolOptions::new()
            .max_connections(16)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // -- messages ------------------------------------------------------------

    pub async fn upsert_message(&self, message: &MessageRecord) -> Result<(), StorageError> {
        let mut conn = self.pool.acquire().await?;
        upsert_message_on(&mut conn, message).await
    }

    /// Persist one fetched batch, the thread adoptions it caused, and the
    /// cursor advance covering it, atomically.
    pub async fn commit_ingest_batch(
        &self,
        messages: &[MessageRecord],
        adoptions: &[ThreadAdoption],
        cursor: &SyncCursor,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        for message in messages {
            upsert_message_on(&mut tx, message).await?;
        }

        for adoption in adoptions {
            sqlx::query(
                r#"
                UPDATE messages
                SET parent_id = ?1, updated_at = ?2
                WHERE id = ?3 AND parent_id IS NULL
                "#,
            )
            .bind(adoption.parent_id.to_string())
            .bind(timestamp(&Utc::now()))
            .bind(adoption.child_id.to_string())
            .execute(&mut *tx)
            .await?;
        }

        crate::cursors::advance_cursor_on(&mut tx, cursor).await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_message(&self, id: Uuid) -> Result<Option<MessageRecord>, StorageError> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_message).transpose()
    }

    /// Records of `account_id` whose Message-ID is one of `message_ids`.
    pub async fn find_by_message_ids(
        &self,
        account_id: Uuid,
        message_ids: &[String],
    ) -> Result<Vec<MessageRecord>, StorageError> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT * FROM messages
            WHERE account_id = ?1
              AND message_id IN (SELECT value FROM json_each(?2))
            "#,
        )
        .bind(account_id.to_string())
        .bind(serde_json::to_string(message_ids)?)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_message).collect()
    }

    /// Parentless records that name one of `message_ids` as In-Reply-To.
    pub async fn find_roots_replying_to(
        &self,
        account_id: Uuid,
        message_ids: &[String],
    ) -> Result<Vec<MessageRecord>, StorageError> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT * FROM messages
            WHERE account_id = ?1
              AND parent_id IS NULL
              AND in_reply_to IN (SELECT value FROM json_each(?2))
            ORDER BY received_at ASC, id ASC
            "#,
        )
        .bind(account_id.to_string())
        .bind(serde_json::to_string(message_ids)?)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_message).collect()
    }

    pub async fn find_by_uids(
        &self,
        account_id: Uuid,
        folder: &str,
        uidvalidity: u32,
        uids: &[u32],
    ) -> Result<Vec<MessageRecord>, StorageError> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT * FROM messages
            WHERE account_id = ?1 AND folder = ?2 AND uidvalidity = ?3
              AND uid IN (SELECT value FROM json_each(?4))
            ORDER BY uid ASC
            "#,
        )
        .bind(account_id.to_string())
        .bind(folder)
        .bind(i64::from(uidvalidity))
        .bind(serde_json::to_string(uids)?)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_message).collect()
    }

    /// Active records with a confirmed identifier in the folder's current epoch.
    pub async fn list_folder_messages(
        &self,
        account_id: Uuid,
        folder: &str,
        uidvalidity: u32,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM messages
            WHERE account_id = ?1 AND folder = ?2 AND uidvalidity = ?3
              AND uid IS NOT NULL AND soft_deleted_at IS NULL
            ORDER BY uid ASC
            "#,
        )
        .bind(account_id.to_string())
        .bind(folder)
        .bind(i64::from(uidvalidity))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_message).collect()
    }

    pub async fn list_unconfirmed(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM messages
            WHERE account_id = ?1 AND remap_state = 'unconfirmed'
            ORDER BY folder ASC, received_at ASC
            "#,
        )
        .bind(account_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_message).collect()
    }

    /// Oldest first, so automation sees a conversation in arrival order.
    pub async fn list_unprocessed(
        &self,
        account_id: Uuid,
        limit: i64,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM messages
            WHERE account_id = ?1 AND processed = 0 AND soft_deleted_at IS NULL
            ORDER BY received_at ASC, id ASC
            LIMIT ?2
            "#,
        )
        .bind(account_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_message).collect()
    }

    /// Newest active messages first, processed or not.
    pub async fn list_recent(
        &self,
        account_id: Uuid,
        limit: i64,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM messages
            WHERE account_id = ?1 AND soft_deleted_at IS NULL
            ORDER BY received_at DESC, id ASC
            LIMIT ?2
            "#,
        )
        .bind(account_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_message).collect()
    }

    pub async fn count_messages(&self, account_id: Uuid) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM messages WHERE account_id = ?1")
            .bind(account_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("total")?.max(0) as u64)
    }

    pub async fn update_message_flags(
        &self,
        id: Uuid,
        flags: MessageFlags,
        remote_flags: MessageFlags,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE messages
            SET flags = ?1, remote_flags = ?2, updated_at = ?3
            WHERE id = ?4
            "#,
        )
        .bind(flags.to_bits())
        .bind(remote_flags.to_bits())
        .bind(timestamp(&Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Apply remaps in one transaction.
    pub async fn remap_messages(&self, remaps: &[MessageRemap]) -> Result<(), StorageError> {
        if remaps.is_empty() {
            return Ok(());
        }

        let now = timestamp(&Utc::now());
        let mut tx = self.pool.begin().await?;
        for remap in remaps {
            sqlx::query(
                r#"
                UPDATE messages
                SET folder = ?1, uidvalidity = ?2, uid = ?3, remap_state = ?4, updated_at = ?5
                WHERE id = ?6
                "#,
            )
            .bind(&remap.folder)
            .bind(i64::from(remap.uidvalidity))
            .bind(remap.uid.map(i64::from))
            .bind(remap.state.as_str())
            .bind(&now)
            .bind(remap.id.to_string())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn soft_delete_message(
        &self,
        id: Uuid,
        flags: MessageFlags,
        remote_flags: MessageFlags,
        deleted_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE messages
            SET flags = ?1, remote_flags = ?2,
                soft_deleted_at = COALESCE(soft_deleted_at, ?3), updated_at = ?4
            WHERE id = ?5
            "#,
        )
        .bind(flags.to_bits())
        .bind(remote_flags.to_bits())
        .bind(timestamp(&deleted_at))
        .bind(timestamp(&Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn store_body(&self, id: Uuid, body_sealed: &[u8]) -> Result<(), StorageError> {
        sqlx::query("UPDATE messages SET body_sealed = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(body_sealed)
            .bind(timestamp(&Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Close a message's automation pass: priority and the processed flag
    /// land together. Returns `false` if the message was already processed.
    pub async fn complete_automation(
        &self,
        id: Uuid,
        priority: Option<MessagePriority>,
    ) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET processed = 1, priority = COALESCE(?1, priority), updated_at = ?2
            WHERE id = ?3 AND processed = 0
            "#,
        )
        .bind(priority.map(MessagePriority::as_str))
        .bind(timestamp(&Utc::now()))
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(result.rows_affected() == 1)
    }
}

/// Insert or refresh a message keyed on `(account_id, message_id)`.
///
/// Thread linkage, automation state and soft deletion are never overwritten.
/// Flags are only replaced when the stored record has no unpushed local change.
pub(crate) async fn upsert_message_on(
    conn: &mut SqliteConnection,
    message: &MessageRecord,
) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        INSERT INTO messages (
          id, account_id, folder, uidvalidity, uid,
          message_id, message_id_synthetic, in_reply_to, references_json,
          thread_id, parent_id, flags, remote_flags,
          size, content_type, charset, has_attachments,
          subject_sealed, sender_sealed, body_sealed,
          received_at, sent_at, priority, soft_deleted_at, processed,
          remap_state, parse_degraded, created_at, updated_at
        ) VALUES (
          ?1, ?2, ?3, ?4, ?5,
          ?6, ?7, ?8, ?9,
          ?10, ?11, ?12, ?13,
          ?14, ?15, ?16, ?17,
          ?18, ?19, ?20,
          ?21, ?22, ?23, ?24, ?25,
          ?26, ?27, ?28, ?29
        )
        ON CONFLICT(account_id, message_id) DO UPDATE SET
          folder = excluded.folder,
          uidvalidity = excluded.uidvalidity,
          uid = excluded.uid,
          message_id_synthetic = excluded.message_id_synthetic,
          in_reply_to = excluded.in_reply_to,
          references_json = excluded.references_json,
          flags = CASE WHEN messages.flags != messages.remote_flags
                       THEN messages.flags ELSE excluded.flags END,
          remote_flags = CASE WHEN messages.flags != messages.remote_flags
                              THEN messages.remote_flags ELSE excluded.remote_flags END,
          size = excluded.size,
          content_type = excluded.content_type,
          charset = excluded.charset,
          has_attachments = excluded.has_attachments,
          subject_sealed = excluded.subject_sealed,
          sender_sealed = excluded.sender_sealed,
          body_sealed = COALESCE(excluded.body_sealed, messages.body_sealed),
          received_at = excluded.received_at,
          sent_at = excluded.sent_at,
          remap_state = 'confirmed',
          parse_degraded = excluded.parse_degraded,
          updated_at = excluded.updated_at
        "#,
    )
    .bind(message.id.to_string())
    .bind(message.account_id.to_string())
    .bind(&message.folder)
    .bind(i64::from(message.uidvalidity))
    .bind(message.uid.map(i64::from))
    .bind(&message.message_id)
    .bind(message.message_id_synthetic as i32)
    .bind(&message.in_reply_to)
    .bind(serde_json::to_string(&message.references)?)
    .bind(&message.thread_id)
    .bind(message.parent_id.map(|id| id.to_string()))
    .bind(message.flags.to_bits())
    .bind(message.remote_flags.to_bits())
    .bind(i64::from(message.size))
    .bind(&message.content_type)
    .bind(&message.charset)
    .bind(message.has_attachments as i32)
    .bind(&message.subject_sealed)
    .bind(&message.sender_sealed)
    .bind(&message.body_sealed)
    .bind(timestamp(&message.received_at))
    .bind(message.sent_at.as_ref().map(timestamp))
    .bind(message.priority.map(MessagePriority::as_str))
    .bind(message.soft_deleted_at.as_ref().map(timestamp))
    .bind(message.processed as i32)
    .bind(message.remap_state.as_str())
    .bind(message.parse_degraded as i32)
    .bind(timestamp(&message.created_at))
    .bind(timestamp(&message.updated_at))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub(crate) fn row_to_message(row: SqliteRow) -> Result<MessageRecord, StorageError> {
    let id_raw: String = row.try_get("id")?;
    let account_raw: String = row.try_get("account_id")?;
    let parent_raw: Option<String> = row.try_get("parent_id")?;
    let uid_raw: Option<i64> = row.try_get("uid")?;
    let references_raw: String = row.try_get("references_json")?;
    let priority_raw: Option<String> = row.try_get("priority")?;
    let remap_raw: String = row.try_get("remap_state")?;
    let received_raw: String = row.try_get("received_at")?;
    let sent_raw: Option<String> = row.try_get("sent_at")?;
    let deleted_raw: Option<String> = row.try_get("soft_deleted_at")?;
    let created_raw: String = row.try_get("created_at")?;
    let updated_raw: String = row.try_get("updated_at")?;

    Ok(MessageRecord {
        id: parse_uuid(&id_raw, "messages.id")?,
        account_id: parse_uuid(&account_raw, "messages.account_id")?,
        folder: row.try_get("folder")?,
        uidvalidity: parse_u32(row.try_get("uidvalidity")?, "messages.uidvalidity")?,
        uid: uid_raw
            .map(|raw| parse_u32(raw, "messages.uid"))
            .transpose()?,
        message_id: row.try_get("message_id")?,
        message_id_synthetic: row.try_get::<i32, _>("message_id_synthetic")? != 0,
        in_reply_to: row.try_get("in_reply_to")?,
        references: parse_json(&references_raw, "messages.references_json")?,
        thread_id: row.try_get("thread_id")?,
        parent_id: parent_raw
            .as_deref()
            .map(|raw| parse_uuid(raw, "messages.parent_id"))
            .transpose()?,
        flags: MessageFlags::from_bits(row.try_get("flags")?),
        remote_flags: MessageFlags::from_bits(row.try_get("remote_flags")?),
        size: parse_u32(row.try_get("size")?, "messages.size")?,
        content_type: row.try_get("content_type")?,
        charset: row.try_get("charset")?,
        has_attachments: row.try_get::<i32, _>("has_attachments")? != 0,
        subject_sealed: row.try_get("subject_sealed")?,
        sender_sealed: row.try_get("sender_sealed")?,
        body_sealed: row.try_get("body_sealed")?,
        received_at: parse_datetime(&received_raw, "messages.received_at")?,
        sent_at: sent_raw
            .as_deref()
            .map(|raw| parse_datetime(raw, "messages.sent_at"))
            .transpose()?,
        priority: priority_raw
            .as_deref()
            .map(|raw| {
                MessagePriority::parse(raw).ok_or_else(|| {
                    StorageError::Data(format!("invalid priority for messages.priority: {raw}"))
                })
            })
            .transpose()?,
        soft_deleted_at: deleted_raw
            .as_deref()
            .map(|raw| parse_datetime(raw, "messages.soft_deleted_at"))
            .transpose()?,
        processed: row.try_get::<i32, _>("processed")? != 0,
        remap_state: RemapState::parse(&remap_raw).ok_or_else(|| {
            StorageError::Data(format!("invalid remap state for messages.remap_state: {remap_raw}"))
        })?,
        parse_degraded: row.try_get::<i32, _>("parse_degraded")? != 0,
        created_at: parse_datetime(&created_raw, "messages.created_at")?,
        updated_at: parse_datetime(&updated_raw, "messages.updated_at")?,
    })
}

/// Fixed-width UTC so that text comparison orders chronologically.
pub(crate) fn timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_uuid(raw: &str, field: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(raw)
        .map_err(|err| StorageError::Data(format!("invalid uuid for {field}: {err}")))
}

pub(crate) fn parse_datetime(raw: &str, field: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StorageError::Data(format!("invalid datetime for {field}: {err}")))
}

pub(crate) fn parse_u32(raw: i64, field: &str) -> Result<u32, StorageError> {
    u32::try_from(raw)
        .map_err(|_| StorageError::Data(format!("value out of range for {field}: {raw}")))
}

pub(crate) fn parse_json<T>(raw: &str, field: &str) -> Result<T, StorageError>
where
    T: DeserializeOwned,
{
    serde_json::from_str(raw)
        .map_err(|err| StorageError::Data(format!("invalid json for {field}: {err}")))
}
