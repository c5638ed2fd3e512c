//! Armadillo decryption of protected CDN objects
//!
//! Protected objects are Salsa20 encrypted with a product-wide key. The
//! nonce is the second half of the object's own content key.

use crate::error::CryptoError;
use crate::keys::{ArmadilloKey, KeyStore};
use crate::md5::ContentKey;
use crate::salsa20::apply_salsa20;

/// Decrypts blobs fetched from a CDN.
///
/// Implementations must be shareable across the tasks that download
/// archive indices concurrently.
pub trait Decryptor: Send + Sync {
    /// Decrypt `data`, the object stored under `key`
    fn decrypt(&self, key: &ContentKey, data: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Salsa20 decryptor bound to one Armadillo key
#[derive(Debug, Clone)]
pub struct ArmadilloCrypt {
    key: ArmadilloKey,
}

impl ArmadilloCrypt {
    /// Create a decryptor for `key`
    pub const fn new(key: ArmadilloKey) -> Self {
        Self { key }
    }

    /// Create a decryptor from a named key in `store`
    pub fn from_store(store: &KeyStore, name: &str) -> Result<Self, CryptoError> {
        store.require(name).map(Self::new)
    }

    /// Nonce used for the object stored under `key`
    pub fn nonce_for(key: &ContentKey) -> [u8; 8] {
        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&key.as_bytes()[8..]);
        nonce
    }
}

impl Decryptor for ArmadilloCrypt {
    fn decrypt(&self, key: &ContentKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        apply_salsa20(data, self.key.as_bytes(), &Self::nonce_for(key))
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_is_key_tail() {
        let key = ContentKey::from_hex("00112233445566778899aabbccddeeff").expect("valid hex");
        assert_eq!(
            ArmadilloCrypt::nonce_for(&key),
            [0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]
        );
    }

    #[test]
    fn test_decrypt_with_named_key() {
        let mut store = KeyStore::new();
        store.insert("sc1Dev", ArmadilloKey::new([0x24; 16]));
        let crypt = ArmadilloCrypt::from_store(&store, "sc1Dev").expect("key present");

        let object_key = ContentKey::from_data(b"index");
        let plaintext = b"archive index payload".to_vec();
        let ciphertext = crypt.decrypt(&object_key, &plaintext).expect("decrypt");
        assert_ne!(ciphertext, plaintext);
        assert_eq!(crypt.decrypt(&object_key, &ciphertext).expect("decrypt"), plaintext);
    }

    #[test]
    fn test_missing_key_name() {
        let store = KeyStore::new();
        assert!(matches!(
            ArmadilloCrypt::from_store(&store, "absent"),
            Err(CryptoError::KeyNotFound(name)) if name == "absent"
        ));
    }
}
