use thiserror::Error;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("failed to seal payload: {0}")]
    Seal(String),
    #[error("failed to open payload: {0}")]
    Open(String),
    #[error("sealed payload is not valid utf-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Opaque at-rest encryption for message payload fields.
pub trait PayloadCipher: Send + Sync {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError>;

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CipherError>;

    fn seal_str(&self, plaintext: &str) -> Result<Vec<u8>, CipherError> {
        self.seal(plaintext.as_bytes())
    }

    fn open_string(&self, sealed: &[u8]) -> Result<String, CipherError> {
        Ok(String::from_utf8(self.open(sealed)?)?)
    }
}
