//! # Configuration Ciphers
//!
//! Named ciphers used by the configuration core to encrypt values on write and
//! decrypt them on read. The core only ever refers to a cipher by name; the
//! implementations live here and are registered independently.
//!
//! Built-in ciphers:
//! - `base64`: reversible encoding, useful for tests and obfuscation
//! - `aes256gcm`: AES-256-GCM with a random nonce per value

mod aes;
mod registry;

pub use aes::AesGcmCipher;
pub use errors::CipherError;
pub use registry::CipherRegistry;

use base64::{Engine as _, engine::general_purpose};

/// Name under which [`Base64Cipher`] is registered by default.
pub const BASE64_CIPHER: &str = "base64";

/// Name conventionally used for [`AesGcmCipher`].
pub const AES_GCM_CIPHER: &str = "aes256gcm";

/// A reversible transform applied to configuration values.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, CipherError>;

    fn decrypt(&self, ciphertext: &str) -> Result<String, CipherError>;
}

/// Standard base64 "cipher". Provides no secrecy.
#[derive(Debug, Default, Clone, Copy)]
pub struct Base64Cipher;

impl Cipher for Base64Cipher {
    fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        Ok(general_purpose::STANDARD.encode(plaintext.as_bytes()))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, CipherError> {
        let bytes = general_purpose::STANDARD
            .decode(ciphertext.trim())
            .map_err(|e| CipherError::DecryptionFailed {
                reason: e.to_string(),
            })?;

        String::from_utf8(bytes).map_err(|e| CipherError::DecryptionFailed {
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_roundtrip() {
        let cipher = Base64Cipher;
        let encoded = cipher.encrypt("secret").unwrap();
        assert_eq!(encoded, "c2VjcmV0");
        assert_eq!(cipher.decrypt(&encoded).unwrap(), "secret");
    }

    #[test]
    fn test_base64_rejects_garbage() {
        let result = Base64Cipher.decrypt("not base64!!");
        assert!(matches!(result, Err(CipherError::DecryptionFailed { .. })));
    }
}
