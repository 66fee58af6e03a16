use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("condition evaluation failed: {0}")]
    Condition(String),
    #[error("action {action} failed: {message}")]
    Action {
        action: &'static str,
        message: String,
    },
    #[error("invalid rule: {0}")]
    Invalid(String),
    #[error("storage error: {0}")]
    Storage(#[from] sift_storage::StorageError),
    #[error("email error: {0}")]
    Email(#[from] sift_email::EmailError),
    #[error(transparent)]
    Tag(#[from] sift_core::TagServiceError),
}
