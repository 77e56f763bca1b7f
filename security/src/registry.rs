use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::{BASE64_CIPHER, Base64Cipher, Cipher, CipherError};

/// Name → cipher lookup shared by every component that encrypts or decrypts
/// configuration values.
#[derive(Default)]
pub struct CipherRegistry {
    ciphers: RwLock<HashMap<String, Arc<dyn Cipher>>>,
}

impl CipherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the `base64` cipher.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(BASE64_CIPHER, Base64Cipher);
        registry
    }

    /// Register (or replace) a cipher under `name`.
    pub fn register<C>(&self, name: impl Into<String>, cipher: C)
    where
        C: Cipher + 'static,
    {
        let name = name.into();
        tracing::info!("Registering cipher {}", name);
        self.ciphers.write().insert(name, Arc::new(cipher));
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.ciphers.write().remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Cipher>> {
        self.ciphers.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ciphers.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ciphers.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn encrypt(&self, name: &str, plaintext: &str) -> Result<String, CipherError> {
        self.lookup(name)?.encrypt(plaintext)
    }

    pub fn decrypt(&self, name: &str, ciphertext: &str) -> Result<String, CipherError> {
        self.lookup(name)?.decrypt(ciphertext)
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn Cipher>, CipherError> {
        self.get(name).ok_or_else(|| CipherError::UnknownCipher {
            name: name.to_string(),
        })
    }
}

impl std::fmt::Debug for CipherRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherRegistry")
            .field("ciphers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AesGcmCipher;

    #[test]
    fn test_defaults_include_base64() {
        let registry = CipherRegistry::with_defaults();
        assert!(registry.contains("base64"));
        assert_eq!(registry.decrypt("base64", "c2VjcmV0").unwrap(), "secret");
    }

    #[test]
    fn test_unknown_cipher() {
        let registry = CipherRegistry::new();
        let result = registry.encrypt("base64", "x");
        assert!(matches!(result, Err(CipherError::UnknownCipher { .. })));
    }

    #[test]
    fn test_register_and_unregister() {
        let registry = CipherRegistry::with_defaults();
        registry.register("aes256gcm", AesGcmCipher::new(&[9u8; 32]).unwrap());
        assert_eq!(registry.names(), vec!["aes256gcm", "base64"]);

        let encrypted = registry.encrypt("aes256gcm", "token").unwrap();
        assert_eq!(registry.decrypt("aes256gcm", &encrypted).unwrap(), "token");

        assert!(registry.unregister("aes256gcm"));
        assert!(!registry.contains("aes256gcm"));
    }
}
