use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag {
    pub id: Uuid,
    pub account_id: Uuid,
    pub name: String,
}

#[derive(Debug, Error)]
#[error("tag service error: {0}")]
pub struct TagServiceError(pub String);

/// Tag vocabulary owned outside the sync core. There is no
/// create operation: automation may only apply tags that already exist.
#[async_trait]
pub trait TagService: Send + Sync {
    async fn get_tag_by_name(
        &self,
        account_id: Uuid,
        name: &str,
    ) -> Result<Option<Tag>, TagServiceError>;

    async fn assign_tag(&self, message_id: Uuid, tag: &Tag) -> Result<(), TagServiceError>;
}
