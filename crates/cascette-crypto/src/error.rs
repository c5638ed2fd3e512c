//! Error types for cryptographic operations

use thiserror::Error;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Invalid key size
    #[error("Invalid key size: expected {expected}, got {actual}")]
    InvalidKeySize {
        /// Expected key size in bytes
        expected: usize,
        /// Actual key size in bytes
        actual: usize,
    },

    /// Invalid IV size
    #[error("Invalid IV size: expected {expected}, got {actual}")]
    InvalidIvSize {
        /// Expected IV size in bytes
        expected: usize,
        /// Actual IV size in bytes
        actual: usize,
    },

    /// No key registered under the requested name
    #[error("Encryption key not found: {0}")]
    KeyNotFound(String),

    /// Invalid key format
    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(String),

    /// `.ak` key file trailer does not match the MD5 of its key bytes
    #[error("Key file checksum mismatch: expected {expected:02x?}, got {actual:02x?}")]
    KeyFileChecksum {
        /// Checksum stored in the file
        expected: [u8; 4],
        /// Checksum computed from the key bytes
        actual: [u8; 4],
    },

    /// Decrypted output failed the caller's plausibility check
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// I/O error while loading key material
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
