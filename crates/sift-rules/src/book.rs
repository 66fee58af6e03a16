use crate::compile::validate_rule;
use crate::RuleError;
use chrono::Utc;
use serde::Deserialize;
use sift_core::{MailRule, RuleAction, RuleConditions, RuleStats};
use sift_storage::Storage;
use uuid::Uuid;

fn default_priority() -> i32 {
    100
}

fn default_active() -> bool {
    true
}

/// Rule as submitted by a client. Conditions and actions use the persisted
/// document shape.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDocument {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub name: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_active")]
    pub active: bool,
    pub conditions: RuleConditions,
    pub actions: Vec<RuleAction>,
}

/// Validated access to an account's rules.
#[derive(Clone)]
pub struct RuleBook {
    storage: Storage,
}

impl RuleBook {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub fn parse(raw: &str) -> Result<RuleDocument, RuleError> {
        serde_json::from_str(raw).map_err(|err| RuleError::Invalid(err.to_string()))
    }

    /// Validate and persist. Statistics of an existing rule are kept.
    pub async fn save(&self, rule: &MailRule) -> Result<(), RuleError> {
        validate_rule(rule)?;
        self.storage.upsert_rule(rule).await?;
        tracing::info!(rule = %rule.id, name = %rule.name, priority = rule.priority, "rule saved");
        Ok(())
    }

    pub async fn save_document(
        &self,
        account_id: Uuid,
        document: RuleDocument,
    ) -> Result<MailRule, RuleError> {
        let now = Utc::now();
        let existing = match document.id {
            Some(id) => self.storage.get_rule(id).await?,
            None => None,
        };
        if let Some(existing) = &existing {
            if existing.account_id != account_id {
                return Err(RuleError::Invalid(format!(
                    "rule {} belongs to another account",
                    existing.id
                )));
            }
        }

        let rule = MailRule {
            id: document.id.unwrap_or_else(Uuid::new_v4),
            account_id,
            name: document.name.trim().to_string(),
            priority: document.priority,
            active: document.active,
            conditions: document.conditions,
            actions: document.actions,
            stats: existing
                .as_ref()
                .map(|rule| rule.stats.clone())
                .unwrap_or_else(RuleStats::default),
            created_at: existing.as_ref().map_or(now, |rule| rule.created_at),
            updated_at: now,
        };
        self.save(&rule).await?;
        Ok(rule)
    }

    pub async fn list(&self, account_id: Uuid) -> Result<Vec<MailRule>, RuleError> {
        Ok(self.storage.list_rules(account_id).await?)
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), RuleError> {
        self.storage.delete_rule(id).await?;
        Ok(())
    }
}
