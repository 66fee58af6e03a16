use aes_gcm::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sift_core::{CipherError, PayloadCipher};

use crate::{SecretKey, SecretStore, SecurityError};

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

/// Keychain slot holding the base64 payload key.
pub const PAYLOAD_KEY: (&str, &str) = ("payload-key", "default");

/// AES-256-GCM payload cipher. Sealed layout is `nonce || ciphertext`.
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmCipher").finish_non_exhaustive()
    }
}

impl AesGcmCipher {
    pub fn from_key(key: [u8; KEY_SIZE]) -> Self {
        Self {
            cipher: Aes256Gcm::new(&key.into()),
        }
    }

    /// Load the payload key from the keychain, generating and storing one on
    /// first use.
    pub fn from_keychain(secrets: &SecretStore) -> Result<Self, SecurityError> {
        let slot = SecretKey::new(PAYLOAD_KEY.0, PAYLOAD_KEY.1);
        if let Some(encoded) = secrets.get(&slot)? {
            let key = decode_key(&encoded)?;
            return Ok(Self::from_key(key));
        }

        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        secrets.set(&slot, &BASE64.encode(key))?;
        tracing::info!(service = secrets.service_name(), "generated payload key");
        Ok(Self::from_key(key))
    }
}

fn decode_key(encoded: &str) -> Result<[u8; KEY_SIZE], SecurityError> {
    let raw = BASE64
        .decode(encoded.trim())
        .map_err(|err| SecurityError::KeyMaterial(err.to_string()))?;
    raw.try_into().map_err(|raw: Vec<u8>| {
        SecurityError::KeyMaterial(format!("expected {KEY_SIZE} bytes, got {}", raw.len()))
    })
}

impl PayloadCipher for AesGcmCipher {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|err| CipherError::Seal(err.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CipherError> {
        if sealed.len() < NONCE_SIZE {
            return Err(CipherError::Open(format!(
                "sealed payload too short: {} bytes",
                sealed.len()
            )));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|err| CipherError::Open(err.to_string()))
    }
}
