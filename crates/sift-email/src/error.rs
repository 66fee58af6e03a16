use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmailError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("storage error: {0}")]
    Storage(#[from] sift_storage::StorageError),
    #[error("mail parse error: {0}")]
    Parse(#[from] mailparse::MailParseError),
    #[error("cipher error: {0}")]
    Cipher(#[from] sift_core::CipherError),
    #[error("invalid data: {0}")]
    Data(String),
}

impl EmailError {
    /// Connection-level failures end an account's cycle and are worth a retry.
    pub fn is_protocol(&self) -> bool {
        matches!(self, EmailError::Protocol(_))
    }
}
