use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("keychain error: {0}")]
    Keychain(#[from] keyring::Error),
    #[error("invalid key material: {0}")]
    KeyMaterial(String),
}
