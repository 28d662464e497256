//! Credential decryption.
//!
//! The coordinator stores credentials as opaque encrypted blobs. Each blob
//! is AES-256-GCM: base64 over `nonce (12 bytes) ‖ ciphertext`, encrypted
//! with a process-wide key the executor receives through its environment.
//! Plaintext credentials never go back to the coordinator and never reach
//! the logs.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

const NONCE_LEN: usize = 12;

/// Process-wide symmetric key for credential blobs.
#[derive(Clone)]
pub struct CredentialKey {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for CredentialKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of Debug output.
        f.write_str("CredentialKey(..)")
    }
}

impl CredentialKey {
    /// Build a key from its base64 form (must decode to exactly 32 bytes).
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(encoded.trim())
            .context("credential key is not valid base64")?;
        if bytes.len() != 32 {
            bail!(
                "credential key must be 32 bytes, got {} bytes",
                bytes.len()
            );
        }
        let key = Key::<Aes256Gcm>::from_slice(&bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Decrypt a stored blob to UTF-8 plaintext.
    pub fn decrypt(&self, blob: &str) -> Result<String> {
        let raw = BASE64
            .decode(blob.trim())
            .context("credential blob is not valid base64")?;
        if raw.len() <= NONCE_LEN {
            bail!("credential blob too short");
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("credential blob failed authentication"))?;
        String::from_utf8(plaintext).context("decrypted credential is not UTF-8")
    }

    /// Encrypt plaintext into the stored-blob form.
    ///
    /// Used when the executor itself persists secrets (e.g. a generated
    /// SSH keypair written back to the coordinator).
    pub fn encrypt(&self, plaintext: &str, nonce: &[u8; NONCE_LEN]) -> Result<String> {
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(nonce), plaintext.as_bytes())
            .map_err(|_| anyhow!("encryption failed"))?;
        let mut raw = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        raw.extend_from_slice(nonce);
        raw.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(raw))
    }

    /// Encrypt with a nonce derived from the current time and a counter.
    pub fn encrypt_blob(&self, plaintext: &str) -> Result<String> {
        let mut nonce = [0u8; NONCE_LEN];
        let now = chrono::Utc::now();
        nonce[..8].copy_from_slice(&now.timestamp_micros().to_be_bytes());
        nonce[8..].copy_from_slice(&now.timestamp_subsec_nanos().to_be_bytes());
        self.encrypt(plaintext, &nonce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> CredentialKey {
        CredentialKey::from_base64(&BASE64.encode([7u8; 32])).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let key = test_key();
        let blob = key.encrypt("hunter2", &[1u8; NONCE_LEN]).unwrap();
        assert_eq!(key.decrypt(&blob).unwrap(), "hunter2");
    }

    #[test]
    fn test_rejects_short_key() {
        let err = CredentialKey::from_base64(&BASE64.encode([1u8; 16])).unwrap_err();
        assert!(err.to_string().contains("32 bytes"));
    }

    #[test]
    fn test_rejects_tampered_blob() {
        let key = test_key();
        let blob = key.encrypt("secret", &[2u8; NONCE_LEN]).unwrap();
        let mut raw = BASE64.decode(&blob).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        assert!(key.decrypt(&BASE64.encode(raw)).is_err());
    }

    #[test]
    fn test_rejects_wrong_key() {
        let blob = test_key().encrypt("secret", &[3u8; NONCE_LEN]).unwrap();
        let other = CredentialKey::from_base64(&BASE64.encode([9u8; 32])).unwrap();
        assert!(other.decrypt(&blob).is_err());
    }

    #[test]
    fn test_debug_hides_key_material() {
        assert_eq!(format!("{:?}", test_key()), "CredentialKey(..)");
    }
}
