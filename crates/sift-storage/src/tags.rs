use crate::storage::{parse_uuid, timestamp};
use crate::{Storage, StorageError};
use async_trait::async_trait;
use chrono::Utc;
use sift_core::{Tag, TagService, TagServiceError};
use sqlx::Row;
use uuid::Uuid;

impl Storage {
    /// Vocabulary management for whoever owns tags. Automation never calls this.
    pub async fn insert_tag(&self, account_id: Uuid, name: &str) -> Result<Tag, StorageError> {
        let tag = Tag {
            id: Uuid::new_v4(),
            account_id,
            name: name.trim().to_string(),
        };
        if tag.name.is_empty() {
            return Err(StorageError::Data("tag name must not be empty".to_string()));
        }

        sqlx::query("INSERT INTO tags (id, account_id, name, created_at) VALUES (?1, ?2, ?3, ?4)")
            .bind(tag.id.to_string())
            .bind(account_id.to_string())
            .bind(&tag.name)
            .bind(timestamp(&Utc::now()))
            .execute(self.pool())
            .await?;
        Ok(tag)
    }

    pub async fn find_tag(&self, account_id: Uuid, name: &str) -> Result<Option<Tag>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT id, name FROM tags
            WHERE account_id = ?1 AND name = ?2 COLLATE NOCASE
            "#,
        )
        .bind(account_id.to_string())
        .bind(name.trim())
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some(row) => {
                let id_raw: String = row.try_get("id")?;
                Ok(Some(Tag {
                    id: parse_uuid(&id_raw, "tags.id")?,
                    account_id,
                    name: row.try_get("name")?,
                }))
            }
            None => Ok(None),
        }
    }

    pub async fn count_tags(&self, account_id: Uuid) -> Result<u64, StorageError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tags WHERE account_id = ?1")
            .bind(account_id.to_string())
            .fetch_one(self.pool())
            .await?;
        Ok(total.max(0) as u64)
    }

    pub async fn assign_tag_to_message(&self, message_id: Uuid, tag_id: Uuid) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO message_tags (message_id, tag_id, assigned_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(message_id, tag_id) DO NOTHING
            "#,
        )
        .bind(message_id.to_string())
        .bind(tag_id.to_string())
        .bind(timestamp(&Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn message_tag_names(&self, message_id: Uuid) -> Result<Vec<String>, StorageError> {
        let names = sqlx::query_scalar(
            r#"
            SELECT tags.name FROM message_tags
            JOIN tags ON tags.id = message_tags.tag_id
            WHERE message_tags.message_id = ?1
            ORDER BY tags.name ASC
            "#,
        )
        .bind(message_id.to_string())
        .fetch_all(self.pool())
        .await?;
        Ok(names)
    }
}

/// [`TagService`] over the local `tags` table.
#[derive(Clone)]
pub struct StorageTagService {
    storage: Storage,
}

impl StorageTagService {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl TagService for StorageTagService {
    async fn get_tag_by_name(
        &self,
        account_id: Uuid,
        name: &str,
    ) -> Result<Option<Tag>, TagServiceError> {
        self.storage
            .find_tag(account_id, name)
            .await
            .map_err(|err| TagServiceError(err.to_string()))
    }

    async fn assign_tag(&self, message_id: Uuid, tag: &Tag) -> Result<(), TagServiceError> {
        self.storage
            .assign_tag_to_message(message_id, tag.id)
            .await
            .map_err(|err| TagServiceError(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::StorageTagService;
    use crate::storage::fixtures::{record, temp_storage};
    use sift_core::TagService;
    use uuid::Uuid;

    #[tokio::test]
    async fn lookup_is_case_insensitive_and_assignment_idempotent() {
        let (_dir, storage) = temp_storage().await;
        let account = Uuid::new_v4();
        let message = record(account, 1, "<t@example.com>", "t-1");
        storage.upsert_message(&message).await.expect("insert");
        storage.insert_tag(account, "Receipts").await.expect("tag");

        let service = StorageTagService::new(storage.clone());
        let tag = service
            .get_tag_by_name(account, "receipts")
            .await
            .expect("lookup")
            .expect("exists");
        service.assign_tag(message.id, &tag).await.expect("assign");
        service.assign_tag(message.id, &tag).await.expect("reassign");

        assert_eq!(
            storage.message_tag_names(message.id).await.expect("names"),
            vec!["Receipts".to_string()]
        );
        assert!(service
            .get_tag_by_name(Uuid::new_v4(), "Receipts")
            .await
            .expect("other account")
            .is_none());
    }
}
