use crate::storage::{parse_u32, timestamp};
use crate::{Storage, StorageError};
use chrono::Utc;
use sift_core::SyncCursor;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

impl Storage {
    pub async fn get_cursor(
        &self,
        account_id: Uuid,
        folder: &str,
    ) -> Result<Option<SyncCursor>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT account_id, folder, uidvalidity, last_uid, initial_sync_complete
            FROM sync_cursors
            WHERE account_id = ?1 AND folder = ?2
            "#,
        )
        .bind(account_id.to_string())
        .bind(folder)
        .fetch_optional(self.pool())
        .await?;

        row.map(|row| row_to_cursor(account_id, row)).transpose()
    }

    pub async fn list_cursors(&self, account_id: Uuid) -> Result<Vec<SyncCursor>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT account_id, folder, uidvalidity, last_uid, initial_sync_complete
            FROM sync_cursors
            WHERE account_id = ?1
            ORDER BY folder ASC
            "#,
        )
        .bind(account_id.to_string())
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(|row| row_to_cursor(account_id, row))
            .collect()
    }

    /// Record progress within the cursor's epoch. The stored `last_uid` only
    /// ever grows; an epoch change must go through [`Storage::invalidate_cursor`].
    pub async fn advance_cursor(&self, cursor: &SyncCursor) -> Result<(), StorageError> {
        let mut conn = self.pool().acquire().await?;
        advance_cursor_on(&mut conn, cursor).await
    }

    /// Start a new epoch for the folder. Records from older epochs lose their
    /// identifier and stay unconfirmed until a re-list or sweep finds them
    /// again by Message-ID.
    pub async fn invalidate_cursor(
        &self,
        account_id: Uuid,
        folder: &str,
        new_uidvalidity: u32,
    ) -> Result<u64, StorageError> {
        let now = timestamp(&Utc::now());
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            r#"
            INSERT INTO sync_cursors (
              account_id, folder, uidvalidity, last_uid, initial_sync_complete, updated_at
            ) VALUES (?1, ?2, ?3, 0, 0, ?4)
            ON CONFLICT(account_id, folder) DO UPDATE SET
              uidvalidity = excluded.uidvalidity,
              last_uid = 0,
              initial_sync_complete = 0,
              updated_at = excluded.updated_at
            "#,
        )
        .bind(account_id.to_string())
        .bind(folder)
        .bind(i64::from(new_uidvalidity))
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        let detached = sqlx::query(
            r#"
            UPDATE messages
            SET uid = NULL, remap_state = 'unconfirmed', updated_at = ?1
            WHERE account_id = ?2 AND folder = ?3 AND uidvalidity != ?4
            "#,
        )
        .bind(&now)
        .bind(account_id.to_string())
        .bind(folder)
        .bind(i64::from(new_uidvalidity))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        tracing::warn!(
            %account_id,
            folder,
            new_uidvalidity,
            detached,
            "uidvalidity changed, cursor reset"
        );
        Ok(detached)
    }

    pub async fn mark_initial_sync_complete(
        &self,
        account_id: Uuid,
        folder: &str,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE sync_cursors
            SET initial_sync_complete = 1, updated_at = ?1
            WHERE account_id = ?2 AND folder = ?3
            "#,
        )
        .bind(timestamp(&Utc::now()))
        .bind(account_id.to_string())
        .bind(folder)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

pub(crate) async fn advance_cursor_on(
    conn: &mut SqliteConnection,
    cursor: &SyncCursor,
) -> Result<(), StorageError> {
    let result = sqlx::query(
        r#"
        INSERT INTO sync_cursors (
          account_id, folder, uidvalidity, last_uid, initial_sync_complete, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(account_id, folder) DO UPDATE SET
          last_uid = MAX(sync_cursors.last_uid, excluded.last_uid),
          initial_sync_complete = MAX(sync_cursors.initial_sync_complete, excluded.initial_sync_complete),
          updated_at = excluded.updated_at
        WHERE sync_cursors.uidvalidity = excluded.uidvalidity
        "#,
    )
    .bind(cursor.account_id.to_string())
    .bind(&cursor.folder)
    .bind(i64::from(cursor.uidvalidity))
    .bind(i64::from(cursor.last_uid))
    .bind(cursor.initial_sync_complete as i32)
    .bind(timestamp(&Utc::now()))
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        let stored: i64 = sqlx::query_scalar(
            "SELECT uidvalidity FROM sync_cursors WHERE account_id = ?1 AND folder = ?2",
        )
        .bind(cursor.account_id.to_string())
        .bind(&cursor.folder)
        .fetch_one(&mut *conn)
        .await?;

        return Err(StorageError::StaleEpoch {
            folder: cursor.folder.clone(),
            stored: parse_u32(stored, "sync_cursors.uidvalidity")?,
            requested: cursor.uidvalidity,
        });
    }

    Ok(())
}

fn row_to_cursor(account_id: Uuid, row: SqliteRow) -> Result<SyncCursor, StorageError> {
    Ok(SyncCursor {
        account_id,
        folder: row.try_get("folder")?,
        uidvalidity: parse_u32(row.try_get("uidvalidity")?, "sync_cursors.uidvalidity")?,
        last_uid: parse_u32(row.try_get("last_uid")?, "sync_cursors.last_uid")?,
        initial_sync_complete: row.try_get::<i32, _>("initial_sync_complete")? != 0,
    })
}
