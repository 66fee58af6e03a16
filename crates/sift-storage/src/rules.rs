use crate::storage::{parse_datetime, parse_json, parse_uuid, timestamp};
use crate::{Storage, StorageError};
use chrono::{DateTime, Utc};
use sift_core::{MailRule, RuleStats};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

impl Storage {
    /// Statistics are owned by [`Storage::record_rule_trigger`] and are left
    /// untouched when an existing rule is updated.
    pub async fn upsert_rule(&self, rule: &MailRule) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO rules (
              id, account_id, name, priority, active, conditions_json, actions_json,
              times_triggered, last_triggered_at, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(id) DO UPDATE SET
              name = excluded.name,
              priority = excluded.priority,
              active = excluded.active,
              conditions_json = excluded.conditions_json,
              actions_json = excluded.actions_json,
              updated_at = excluded.updated_at
            "#,
        )
        .bind(rule.id.to_string())
        .bind(rule.account_id.to_string())
        .bind(&rule.name)
        .bind(rule.priority)
        .bind(rule.active as i32)
        .bind(serde_json::to_string(&rule.conditions)?)
        .bind(serde_json::to_string(&rule.actions)?)
        .bind(rule.stats.times_triggered as i64)
        .bind(rule.stats.last_triggered_at.as_ref().map(timestamp))
        .bind(timestamp(&rule.created_at))
        .bind(timestamp(&rule.updated_at))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_rule(&self, id: Uuid) -> Result<Option<MailRule>, StorageError> {
        let row = sqlx::query("SELECT * FROM rules WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await?;
        row.map(row_to_rule).transpose()
    }

    /// In evaluation order: priority ascending, then id.
    pub async fn list_rules(&self, account_id: Uuid) -> Result<Vec<MailRule>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM rules WHERE account_id = ?1 ORDER BY priority ASC, id ASC",
        )
        .bind(account_id.to_string())
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(row_to_rule).collect()
    }

    pub async fn list_active_rules(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<MailRule>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM rules
            WHERE account_id = ?1 AND active = 1
            ORDER BY priority ASC, id ASC
            "#,
        )
        .bind(account_id.to_string())
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(row_to_rule).collect()
    }

    pub async fn delete_rule(&self, id: Uuid) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM rules WHERE id = ?1")
            .bind(id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// One trigger, counted in SQL so concurrent passes never lose an update.
    pub async fn record_rule_trigger(
        &self,
        id: Uuid,
        triggered_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE rules
            SET times_triggered = times_triggered + 1,
                last_triggered_at = ?1
            WHERE id = ?2
            "#,
        )
        .bind(timestamp(&triggered_at))
        .bind(id.to_string())
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

fn row_to_rule(row: SqliteRow) -> Result<MailRule, StorageError> {
    let id_raw: String = row.try_get("id")?;
    let account_raw: String = row.try_get("account_id")?;
    let conditions_raw: String = row.try_get("conditions_json")?;
    let actions_raw: String = row.try_get("actions_json")?;
    let last_raw: Option<String> = row.try_get("last_triggered_at")?;
    let created_raw: String = row.try_get("created_at")?;
    let updated_raw: String = row.try_get("updated_at")?;

    Ok(MailRule {
        id: parse_uuid(&id_raw, "rules.id")?,
        account_id: parse_uuid(&account_raw, "rules.account_id")?,
        name: row.try_get("name")?,
        priority: row.try_get("priority")?,
        active: row.try_get::<i32, _>("active")? != 0,
        conditions: parse_json(&conditions_raw, "rules.conditions_json")?,
        actions: parse_json(&actions_raw, "rules.actions_json")?,
        stats: RuleStats {
            times_triggered: row.try_get::<i64, _>("times_triggered")?.max(0) as u64,
            last_triggered_at: last_raw
                .as_deref()
                .map(|raw| parse_datetime(raw, "rules.last_triggered_at"))
                .transpose()?,
        },
        created_at: parse_datetime(&created_raw, "rules.created_at")?,
        updated_at: parse_datetime(&updated_raw, "rules.updated_at")?,
    })
}
