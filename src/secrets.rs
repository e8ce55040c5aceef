use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::SecretError;

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Recovers an endpoint's signing secret from its persisted form.
///
/// Called once per delivery attempt; callers drop the returned bytes as soon
/// as the signature is computed.
pub trait SecretStore: Send + Sync {
    fn decrypt(&self, stored: &str) -> Result<Vec<u8>, SecretError>;
}

/// Secrets persisted as plain text. Suitable for local development and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaintextSecrets;

impl SecretStore for PlaintextSecrets {
    fn decrypt(&self, stored: &str) -> Result<Vec<u8>, SecretError> {
        if stored.is_empty() {
            return Err(SecretError::Decrypt("empty secret".to_string()));
        }
        Ok(stored.as_bytes().to_vec())
    }
}

/// AES-256-GCM secrets keyed by the SHA-256 of an operator passphrase.
///
/// Stored form is base64 of `iv (12) || tag (16) || ciphertext`.
#[derive(Clone)]
pub struct AesGcmSecrets {
    cipher: Aes256Gcm,
}

impl AesGcmSecrets {
    pub fn from_passphrase(passphrase: &str) -> Self {
        let key: [u8; 32] = Sha256::digest(passphrase.as_bytes()).into();
        Self {
            cipher: Aes256Gcm::new(&key.into()),
        }
    }

    /// Seal `plaintext` under a fresh random IV.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, SecretError> {
        let mut iv = [0u8; IV_LEN];
        rand::rngs::OsRng.fill_bytes(&mut iv);

        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| SecretError::Encrypt)?;
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        let mut out = Vec::with_capacity(IV_LEN + sealed.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(tag);
        out.extend_from_slice(ciphertext);
        Ok(STANDARD.encode(out))
    }
}

impl SecretStore for AesGcmSecrets {
    fn decrypt(&self, stored: &str) -> Result<Vec<u8>, SecretError> {
        let raw = STANDARD
            .decode(stored.trim())
            .map_err(|e| SecretError::Decrypt(e.to_string()))?;
        if raw.len() < IV_LEN + TAG_LEN {
            return Err(SecretError::Decrypt("ciphertext too short".to_string()));
        }

        let (iv, rest) = raw.split_at(IV_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);
        let mut sealed = Vec::with_capacity(rest.len());
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);

        self.cipher
            .decrypt(Nonce::from_slice(iv), sealed.as_ref())
            .map_err(|_| SecretError::Decrypt("authentication failed".to_string()))
    }
}
