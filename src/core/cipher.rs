use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use hmac::Mac;
use sha2::Sha256;

use crate::core::error::{StoryError, StoryResult};

type HmacSha256 = hmac::Hmac<Sha256>;

const NONCE_LEN: usize = 12;

/// Encrypts named text fields on their way into the document store and
/// decrypts them on the way out. Stored form is base64(nonce || ciphertext).
#[derive(Clone)]
pub struct FieldCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FieldCipher(..)")
    }
}

/// Derive a 256-bit key from machine-specific identifiers so the key is
/// stable across restarts but tied to the local host and user.
fn derive_host_key() -> [u8; 32] {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown-host".to_string());
    let username = whoami::username();
    let input = format!("{}{}", hostname, username);

    let mut key = [0u8; 32];
    // HMAC accepts keys of any length, so construction cannot fail here.
    if let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(b"storyforge-fields-v1") {
        mac.update(input.as_bytes());
        key.copy_from_slice(&mac.finalize().into_bytes());
    }
    key
}

impl FieldCipher {
    pub fn from_key(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Build from a configured base64 key, falling back to the host key.
    pub fn from_config(field_key: Option<&str>) -> StoryResult<Self> {
        match field_key {
            Some(encoded) => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(encoded.trim())
                    .map_err(|e| StoryError::Cipher(format!("field_key is not base64: {}", e)))?;
                let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                    StoryError::Cipher(format!("field_key must be 32 bytes, got {}", bytes.len()))
                })?;
                Ok(Self::from_key(&key))
            }
            None => Ok(Self::from_key(&derive_host_key())),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> StoryResult<String> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| StoryError::Cipher(format!("encryption failed: {}", e)))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(base64::engine::general_purpose::STANDARD.encode(&combined))
    }

    pub fn decrypt(&self, encoded: &str) -> StoryResult<String> {
        let combined = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| StoryError::Cipher(format!("base64 decode failed: {}", e)))?;

        if combined.len() <= NONCE_LEN {
            return Err(StoryError::Cipher("encrypted value too short".to_string()));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| StoryError::Cipher(format!("decryption failed: {}", e)))?;

        String::from_utf8(plaintext)
            .map_err(|e| StoryError::Cipher(format!("utf-8 decode failed: {}", e)))
    }

    pub fn encrypt_opt(&self, value: Option<&str>) -> StoryResult<Option<String>> {
        value.map(|v| self.encrypt(v)).transpose()
    }

    pub fn decrypt_opt(&self, value: Option<String>) -> StoryResult<Option<String>> {
        value.map(|v| self.decrypt(&v)).transpose()
    }
}
