//! AES-256-GCM cipher.
//!
//! Ciphertext layout is `base64(nonce || ciphertext)` so a single string can
//! be stored as a configuration value.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::{Engine as _, engine::general_purpose};

use crate::{Cipher, CipherError};

const NONCE_LEN: usize = 12;

pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    /// Build a cipher from a raw 32 byte key.
    pub fn new(key_bytes: &[u8]) -> Result<Self, CipherError> {
        if key_bytes.len() != 32 {
            return Err(CipherError::InvalidKey {
                reason: "Key must be 32 bytes (256 bits)".to_string(),
            });
        }

        let key = Key::<Aes256Gcm>::from_slice(key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Build a cipher from a base64 encoded key, as typically found in an
    /// environment variable.
    pub fn from_base64_key(encoded: &str) -> Result<Self, CipherError> {
        let bytes = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| CipherError::InvalidKey {
                reason: e.to_string(),
            })?;
        Self::new(&bytes)
    }

    /// Generate a random key, returned base64 encoded.
    pub fn generate_key() -> String {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        general_purpose::STANDARD.encode(key.as_slice())
    }
}

impl std::fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmCipher").finish_non_exhaustive()
    }
}

impl Cipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| CipherError::EncryptionFailed {
                reason: e.to_string(),
            })?;

        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(nonce.as_slice());
        payload.extend_from_slice(&ciphertext);

        Ok(general_purpose::STANDARD.encode(payload))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, CipherError> {
        let payload = general_purpose::STANDARD
            .decode(ciphertext.trim())
            .map_err(|e| CipherError::DecryptionFailed {
                reason: e.to_string(),
            })?;

        if payload.len() <= NONCE_LEN {
            return Err(CipherError::InvalidFormat);
        }

        let (nonce_bytes, body) = payload.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, body)
            .map_err(|e| CipherError::DecryptionFailed {
                reason: e.to_string(),
            })?;

        String::from_utf8(plaintext).map_err(|e| CipherError::DecryptionFailed {
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_with_generated_key() {
        let key = AesGcmCipher::generate_key();
        let cipher = AesGcmCipher::from_base64_key(&key).unwrap();

        let encrypted = cipher.encrypt("db-password").unwrap();
        assert_ne!(encrypted, "db-password");
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), "db-password");
    }

    #[test]
    fn test_nonce_differs_per_encryption() {
        let cipher = AesGcmCipher::new(&[7u8; 32]).unwrap();
        let first = cipher.encrypt("same").unwrap();
        let second = cipher.encrypt("same").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_wrong_key_fails() {
        let a = AesGcmCipher::new(&[1u8; 32]).unwrap();
        let b = AesGcmCipher::new(&[2u8; 32]).unwrap();
        let encrypted = a.encrypt("secret").unwrap();
        assert!(matches!(
            b.decrypt(&encrypted),
            Err(CipherError::DecryptionFailed { .. })
        ));
    }

    #[test]
    fn test_invalid_key_length() {
        assert!(matches!(
            AesGcmCipher::new(&[0u8; 16]),
            Err(CipherError::InvalidKey { .. })
        ));
    }

    #[test]
    fn test_truncated_payload() {
        let cipher = AesGcmCipher::new(&[3u8; 32]).unwrap();
        assert!(matches!(
            cipher.decrypt("AAAA"),
            Err(CipherError::InvalidFormat)
        ));
    }
}
