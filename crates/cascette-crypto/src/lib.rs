//! Cryptographic primitives for CASC container reconstruction
//!
//! # Components
//!
//! - **Hashing**: lookup3 (`hashlittle`/`hashlittle2`) for local index and
//!   reconstruction header checksums, MD5 for content keys
//! - **Location checksum**: the per-offset checksum sealing each
//!   reconstruction header to its place in a data file
//! - **Content keys**: 16-byte keys, their 9-byte truncated form and the
//!   bucket classifier that routes them to one of 16 local index files
//! - **Armadillo**: Salsa20 decryption of protected CDN objects with keys
//!   loaded from `.ak` files
//!
//! # Examples
//!
//! ```
//! use cascette_crypto::md5::ContentKey;
//!
//! let key = ContentKey::from_data(b"Hello, World!");
//! assert_eq!(key.to_hex(), "65a8e27d8879283831b664bd8b7f0ad4");
//! assert!(key.bucket() < 16);
//! ```

#![warn(missing_docs)]

pub mod armadillo;
pub mod checksum;
pub mod error;
pub mod jenkins;
pub mod keys;
pub mod md5;
pub mod salsa20;

pub use error::CryptoError;

pub use armadillo::{ArmadilloCrypt, Decryptor};
pub use checksum::{RECONSTRUCTION_SEED, calculate_checksum};
pub use jenkins::{hashlittle, hashlittle2};
pub use keys::{ArmadilloKey, KeyStore};
pub use md5::{BUCKET_COUNT, ContentKey, TRUNCATED_KEY_SIZE, TruncatedKey, bucket_index};
pub use salsa20::Salsa20Cipher;
