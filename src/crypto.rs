// =============================================================================
// KeyManager — versioned AES-GCM encryption for exchange credentials at rest
// =============================================================================
//
// Every `Connection` row stores `key_version` alongside its ciphertext so a
// key can be rotated without re-encrypting every row at once: old rows keep
// decrypting under their original version until a background migration
// re-encrypts them under the newest key (out of scope here — see
// SPEC_FULL.md §4's ambient-stack notes).

use std::collections::HashMap;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use rand::RngCore;

use crate::error::EngineError;

const NONCE_LEN: usize = 12;

/// Holds one or more key versions. Encryption always uses the newest
/// version; decryption looks the requested version up explicitly.
pub struct KeyManager {
    keys: HashMap<u32, Aes256Gcm>,
    current_version: u32,
}

impl KeyManager {
    /// `current_version`'s key bytes must be exactly 32 bytes (AES-256).
    pub fn new(current_version: u32, key_bytes: &[u8]) -> Result<Self, EngineError> {
        let mut mgr = Self {
            keys: HashMap::new(),
            current_version,
        };
        mgr.add_version(current_version, key_bytes)?;
        Ok(mgr)
    }

    pub fn add_version(&mut self, version: u32, key_bytes: &[u8]) -> Result<(), EngineError> {
        let cipher = Aes256Gcm::new_from_slice(key_bytes).map_err(|_| EngineError::KeyUnavailable { version })?;
        self.keys.insert(version, cipher);
        Ok(())
    }

    pub fn current_version(&self) -> u32 {
        self.current_version
    }

    /// Encrypt under the current key version. Returns base64(nonce || ciphertext).
    pub fn encrypt(&self, plaintext: &str) -> Result<String, EngineError> {
        let cipher = self
            .keys
            .get(&self.current_version)
            .ok_or(EngineError::KeyUnavailable {
                version: self.current_version,
            })?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| EngineError::DecryptFailed {
                reason: format!("encrypt failed: {e}"),
            })?;

        let mut combined = nonce_bytes.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(combined))
    }

    /// Decrypt `encoded` (base64(nonce || ciphertext)) under the given key
    /// version — the version stamped on the `Connection` row, not
    /// necessarily the current one.
    pub fn decrypt(&self, encoded: &str, version: u32) -> Result<String, EngineError> {
        let cipher = self
            .keys
            .get(&version)
            .ok_or(EngineError::KeyUnavailable { version })?;

        let raw = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| EngineError::DecryptFailed {
                reason: format!("base64 decode failed: {e}"),
            })?;

        if raw.len() < NONCE_LEN {
            return Err(EngineError::DecryptFailed {
                reason: "ciphertext shorter than nonce".into(),
            });
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| EngineError::DecryptFailed {
                reason: format!("decrypt failed: {e}"),
            })?;

        String::from_utf8(plaintext).map_err(|e| EngineError::DecryptFailed {
            reason: format!("decrypted bytes not valid utf-8: {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> Vec<u8> {
        vec![7u8; 32]
    }

    #[test]
    fn encrypt_then_decrypt_roundtrips() {
        let mgr = KeyManager::new(1, &test_key()).unwrap();
        let cipher = mgr.encrypt("super-secret-api-key").unwrap();
        let plain = mgr.decrypt(&cipher, 1).unwrap();
        assert_eq!(plain, "super-secret-api-key");
    }

    #[test]
    fn decrypt_with_unknown_version_fails() {
        let mgr = KeyManager::new(1, &test_key()).unwrap();
        let cipher = mgr.encrypt("value").unwrap();
        let err = mgr.decrypt(&cipher, 99).unwrap_err();
        assert_eq!(err.code(), "KEY_UNAVAILABLE");
    }

    #[test]
    fn rotated_key_manager_still_decrypts_old_version() {
        let mut mgr = KeyManager::new(2, &vec![9u8; 32]).unwrap();
        mgr.add_version(1, &test_key()).unwrap();

        let old_cipher = {
            let old_mgr = KeyManager::new(1, &test_key()).unwrap();
            old_mgr.encrypt("legacy-secret").unwrap()
        };

        assert_eq!(mgr.decrypt(&old_cipher, 1).unwrap(), "legacy-secret");
    }

    #[test]
    fn tampered_ciphertext_fails_to_decrypt() {
        let mgr = KeyManager::new(1, &test_key()).unwrap();
        let mut cipher = mgr.encrypt("value").unwrap();
        cipher.push('A');
        assert!(mgr.decrypt(&cipher, 1).is_err());
    }
}
