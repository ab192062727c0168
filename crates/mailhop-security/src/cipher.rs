use crate::SecurityError;
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

/// Symmetric encryption for credentials stored in the database.
///
/// Output is base64 of `nonce || ciphertext`, with a fresh random nonce per
/// call, so encrypting the same password twice yields different strings.
#[derive(Clone)]
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    /// `encoded_key` is a base64 encoded 32 byte key.
    pub fn from_base64_key(encoded_key: &str) -> Result<Self, SecurityError> {
        let key = STANDARD
            .decode(encoded_key.trim().as_bytes())
            .map_err(|err| SecurityError::InvalidKey(format!("key is not base64: {err}")))?;
        Self::from_key_bytes(&key)
    }

    pub fn from_key_bytes(key: &[u8]) -> Result<Self, SecurityError> {
        if key.len() != KEY_SIZE {
            return Err(SecurityError::InvalidKey(format!(
                "expected {KEY_SIZE} key bytes, got {}",
                key.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|err| SecurityError::InvalidKey(err.to_string()))?;
        Ok(Self { cipher })
    }

    /// Fresh random key, base64 encoded, for first-run setup.
    pub fn generate_key() -> String {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        STANDARD.encode(key)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, SecurityError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|err| SecurityError::Crypto(format!("encryption failed: {err}")))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(combined))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, SecurityError> {
        let combined = STANDARD
            .decode(encoded.trim().as_bytes())
            .map_err(|err| SecurityError::Crypto(format!("ciphertext is not base64: {err}")))?;
        if combined.len() <= NONCE_SIZE {
            return Err(SecurityError::Crypto("ciphertext too short".to_string()));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|err| SecurityError::Crypto(format!("decryption failed: {err}")))?;

        String::from_utf8(plaintext)
            .map_err(|err| SecurityError::Crypto(format!("plaintext is not utf-8: {err}")))
    }
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCipher").finish_non_exhaustive()
    }
}
