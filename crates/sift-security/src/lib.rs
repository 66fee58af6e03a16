mod cipher;
mod error;
mod keychain;

pub use cipher::{AesGcmCipher, PAYLOAD_KEY};
pub use error::SecurityError;
pub use keychain::{SecretKey, SecretStore};
