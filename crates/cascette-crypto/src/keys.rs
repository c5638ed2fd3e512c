//! Named Armadillo key storage
//!
//! Keys are identified by the name of their `.ak` file (for example
//! `sc1Dev`). A [`KeyStore`] is an ordinary value handed to whichever
//! decryptor needs it; there is no process-wide key registry.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use crate::error::CryptoError;
use crate::md5::ContentKey;

/// Size of an `.ak` key file: 16 key bytes followed by 4 checksum bytes
pub const AK_FILE_SIZE: usize = 20;

/// A 16-byte Armadillo key
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ArmadilloKey([u8; 16]);

impl ArmadilloKey {
    /// Wrap raw key bytes
    pub const fn new(key: [u8; 16]) -> Self {
        Self(key)
    }

    /// Parse key from hex string
    pub fn from_hex(hex: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(hex.trim())
            .map_err(|e| CryptoError::InvalidKeyFormat(format!("invalid hex: {e}")))?;
        let key = <[u8; 16]>::try_from(bytes.as_slice()).map_err(|_| {
            CryptoError::InvalidKeySize {
                expected: 16,
                actual: bytes.len(),
            }
        })?;
        Ok(Self(key))
    }

    /// Parse the contents of an `.ak` file.
    ///
    /// The trailing four bytes must equal the start of the key's MD5.
    pub fn from_ak_bytes(data: &[u8]) -> Result<Self, CryptoError> {
        if data.len() != AK_FILE_SIZE {
            return Err(CryptoError::InvalidKeySize {
                expected: AK_FILE_SIZE,
                actual: data.len(),
            });
        }

        let mut key = [0u8; 16];
        key.copy_from_slice(&data[..16]);

        let digest = ContentKey::from_data(&key);
        let mut actual = [0u8; 4];
        actual.copy_from_slice(&digest.as_bytes()[..4]);
        let mut expected = [0u8; 4];
        expected.copy_from_slice(&data[16..]);

        if actual != expected {
            return Err(CryptoError::KeyFileChecksum { expected, actual });
        }

        Ok(Self(key))
    }

    /// Serialize to the 20-byte `.ak` layout
    pub fn to_ak_bytes(&self) -> [u8; AK_FILE_SIZE] {
        let mut out = [0u8; AK_FILE_SIZE];
        out[..16].copy_from_slice(&self.0);
        out[16..].copy_from_slice(&ContentKey::from_data(&self.0).as_bytes()[..4]);
        out
    }

    /// Raw key bytes
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

// Keep key material out of logs
impl fmt::Debug for ArmadilloKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ArmadilloKey(..)")
    }
}

/// Store for named Armadillo keys
#[derive(Debug, Clone, Default)]
pub struct KeyStore {
    keys: HashMap<String, ArmadilloKey>,
}

impl KeyStore {
    /// Create an empty key store
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a key
    pub fn insert(&mut self, name: impl Into<String>, key: ArmadilloKey) {
        self.keys.insert(name.into(), key);
    }

    /// Look up a key by name
    pub fn get(&self, name: &str) -> Option<&ArmadilloKey> {
        self.keys.get(name)
    }

    /// Look up a key by name, failing with [`CryptoError::KeyNotFound`]
    pub fn require(&self, name: &str) -> Result<ArmadilloKey, CryptoError> {
        self.get(name)
            .copied()
            .ok_or_else(|| CryptoError::KeyNotFound(name.to_string()))
    }

    /// Number of keys held
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no keys are held
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Load a single `.ak` file, registering it under its file stem
    pub fn load_ak_file(&mut self, path: &Path) -> Result<String, CryptoError> {
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| {
                CryptoError::InvalidKeyFormat(format!("bad key file name: {}", path.display()))
            })?
            .to_string();
        let data = std::fs::read(path)?;
        let key = ArmadilloKey::from_ak_bytes(&data)?;
        self.insert(name.clone(), key);
        Ok(name)
    }

    /// Load every `.ak` file in a directory.
    ///
    /// Files that fail to parse are skipped. Returns the number loaded.
    pub fn load_ak_dir(&mut self, dir: &Path) -> Result<usize, CryptoError> {
        let mut count = 0;
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "ak") && self.load_ak_file(&path).is_ok() {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Load keys from text lines of the form `name;hex` or `name,hex`.
    ///
    /// Lines starting with `#` are comments. Returns the number of keys loaded.
    pub fn load_csv(&mut self, content: &str) -> usize {
        let mut count = 0;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((name, hex)) = line.split_once([';', ',']) else {
                continue;
            };

            if let Ok(key) = ArmadilloKey::from_hex(hex) {
                self.insert(name.trim(), key);
                count += 1;
            }
        }

        count
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    const KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f";

    #[test]
    fn test_ak_round_trip() {
        let key = ArmadilloKey::from_hex(KEY_HEX).expect("valid key");
        let file = key.to_ak_bytes();
        let parsed = ArmadilloKey::from_ak_bytes(&file).expect("valid ak file");
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_ak_checksum_rejected() {
        let key = ArmadilloKey::from_hex(KEY_HEX).expect("valid key");
        let mut file = key.to_ak_bytes();
        file[19] ^= 0xFF;
        assert!(matches!(
            ArmadilloKey::from_ak_bytes(&file),
            Err(CryptoError::KeyFileChecksum { .. })
        ));
        assert!(matches!(
            ArmadilloKey::from_ak_bytes(&file[..16]),
            Err(CryptoError::InvalidKeySize { expected: 20, actual: 16 })
        ));
    }

    #[test]
    fn test_load_ak_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key = ArmadilloKey::from_hex(KEY_HEX).expect("valid key");
        std::fs::write(dir.path().join("sc1Dev.ak"), key.to_ak_bytes()).unwrap();
        std::fs::write(dir.path().join("broken.ak"), [0u8; 7]).unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let mut store = KeyStore::new();
        assert_eq!(store.load_ak_dir(dir.path()).expect("readable dir"), 1);
        assert_eq!(store.require("sc1Dev").expect("loaded"), key);
        assert!(matches!(store.require("broken"), Err(CryptoError::KeyNotFound(_))));
    }

    #[test]
    fn test_load_csv() {
        let content = "# keys\nsc1Dev;000102030405060708090a0b0c0d0e0f\nother,FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF\nbad;1234\n";
        let mut store = KeyStore::new();
        assert_eq!(store.load_csv(content), 2);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("other").map(|k| k.as_bytes()[0]), Some(0xFF));
    }

    #[test]
    fn test_debug_hides_key() {
        let key = ArmadilloKey::from_hex(KEY_HEX).expect("valid key");
        assert_eq!(format!("{key:?}"), "ArmadilloKey(..)");
    }
}
