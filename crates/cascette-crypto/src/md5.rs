//! MD5-based content keys and their truncated local-storage form

use binrw::{BinRead, BinWrite};
use md5::{Digest, Md5};
use std::fmt;

/// Number of key bytes kept in local `.idx` entries.
pub const TRUNCATED_KEY_SIZE: usize = 9;

/// Number of local index buckets.
pub const BUCKET_COUNT: usize = 16;

/// Compute the bucket for a key prefix.
///
/// XORs the first nine bytes and folds the two nibbles of the result.
/// Shorter slices fold only what they have.
pub fn bucket_index(key: &[u8]) -> u8 {
    let x = key
        .iter()
        .take(TRUNCATED_KEY_SIZE)
        .fold(0u8, |acc, &b| acc ^ b);
    (x & 0x0F) ^ (x >> 4)
}

/// Content key (MD5 hash) used to identify content
///
/// Ordering is byte-wise lexicographic, which is the order archive index
/// blocks are sorted in.
#[derive(BinRead, BinWrite, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ContentKey([u8; 16]);

impl ContentKey {
    /// Create content key from raw bytes
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Create content key from data by computing MD5 hash
    pub fn from_data(data: &[u8]) -> Self {
        Self::from_parts([data])
    }

    /// MD5 over several slices fed in order, as if concatenated
    pub fn from_parts<'a, I>(parts: I) -> Self
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut hasher = Md5::new();
        for part in parts {
            hasher.update(part);
        }
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&hasher.finalize());
        Self(bytes)
    }

    /// Parse content key from hex string, either case
    pub fn from_hex(hex: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(hex, &mut bytes)?;
        Ok(Self(bytes))
    }

    /// Build a key from a slice that must be exactly 16 bytes long
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 16]>::try_from(bytes).ok().map(Self)
    }

    /// Get raw bytes
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Lowercase hex, the form used in CDN paths
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Compare only bytes 0..8 and byte 15.
    ///
    /// Used where one side was recovered from a truncated form and only
    /// those bytes are trustworthy.
    pub fn eq_partial(&self, other: &Self) -> bool {
        self.0[..8] == other.0[..8] && self.0[15] == other.0[15]
    }

    /// First nine bytes
    pub fn truncated(&self) -> TruncatedKey {
        let mut bytes = [0u8; TRUNCATED_KEY_SIZE];
        bytes.copy_from_slice(&self.0[..TRUNCATED_KEY_SIZE]);
        TruncatedKey(bytes)
    }

    /// Local index bucket this key is stored under
    pub fn bucket(&self) -> u8 {
        bucket_index(&self.0)
    }

    /// Key bytes in reverse order, as stored in reconstruction headers
    pub fn reversed(&self) -> [u8; 16] {
        let mut bytes = self.0;
        bytes.reverse();
        bytes
    }
}

impl From<[u8; 16]> for ContentKey {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for ContentKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::UpperHex for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode_upper(self.0))
    }
}

impl std::str::FromStr for ContentKey {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// The nine-byte key prefix persisted in local `.idx` files
#[derive(BinRead, BinWrite, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TruncatedKey([u8; TRUNCATED_KEY_SIZE]);

impl TruncatedKey {
    /// Create from raw bytes
    pub const fn from_bytes(bytes: [u8; TRUNCATED_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get raw bytes
    pub const fn as_bytes(&self) -> &[u8; TRUNCATED_KEY_SIZE] {
        &self.0
    }

    /// Same bucket as the full key this was cut from
    pub fn bucket(&self) -> u8 {
        bucket_index(&self.0)
    }

    /// Widen to 16 bytes with the missing seven bytes set to zero
    pub fn to_content_key(&self) -> ContentKey {
        let mut bytes = [0u8; 16];
        bytes[..TRUNCATED_KEY_SIZE].copy_from_slice(&self.0);
        ContentKey(bytes)
    }

    /// Whether `key` starts with this prefix
    pub fn matches(&self, key: &ContentKey) -> bool {
        key.0[..TRUNCATED_KEY_SIZE] == self.0
    }
}

impl fmt::Display for TruncatedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_content_key_from_data() {
        let key = ContentKey::from_data(b"Hello, World!");
        assert_eq!(key.to_hex(), "65a8e27d8879283831b664bd8b7f0ad4");
    }

    #[test]
    fn test_from_parts_matches_concatenation() {
        let joined = ContentKey::from_data(b"TESTHOSTWorld of Warcraft");
        let parts = ContentKey::from_parts([b"TESTHOST".as_slice(), b"World of Warcraft"]);
        assert_eq!(joined, parts);
        assert_eq!(parts.to_hex(), "07ea5f88b4713df0180da428f7ce2f63");
    }

    #[test]
    fn test_hex_case_insensitive() {
        let lower = ContentKey::from_hex("65a8e27d8879283831b664bd8b7f0ad4").expect("lowercase");
        let upper = ContentKey::from_hex("65A8E27D8879283831B664BD8B7F0AD4").expect("uppercase");
        assert_eq!(lower, upper);
        assert_eq!(format!("{upper:X}"), "65A8E27D8879283831B664BD8B7F0AD4");
        assert_eq!(upper.to_string(), "65a8e27d8879283831b664bd8b7f0ad4");
    }

    #[test]
    fn test_partial_equality() {
        let a = ContentKey::from_hex("0102030405060708aaaaaaaaaaaaaa10").expect("valid hex");
        let b = ContentKey::from_hex("0102030405060708bbbbbbbbbbbbbb10").expect("valid hex");
        let c = ContentKey::from_hex("0102030405060708aaaaaaaaaaaaaa11").expect("valid hex");
        assert!(a.eq_partial(&b));
        assert_ne!(a, b);
        assert!(!a.eq_partial(&c));
    }

    #[test]
    fn test_ordering_is_lexicographic() {
        let mut keys = vec![
            ContentKey::from_bytes([0xff; 16]),
            ContentKey::from_bytes([0x00; 16]),
            ContentKey::from_hex("00000000000000000000000000000001").expect("valid hex"),
        ];
        keys.sort();
        assert_eq!(keys[0], ContentKey::from_bytes([0x00; 16]));
        assert_eq!(keys[2], ContentKey::from_bytes([0xff; 16]));
    }

    #[test]
    fn test_bucket_known_values() {
        // x = 0x01 ^ 0x02 ^ ... ^ 0x09 = 0x01
        let key = ContentKey::from_hex("0102030405060708090a0b0c0d0e0f10").expect("valid hex");
        assert_eq!(key.bucket(), 0x01);
        assert_eq!(bucket_index(&[0xAB]), 0x0B ^ 0x0A);
        assert_eq!(ContentKey::default().bucket(), 0);
    }

    #[test]
    fn test_truncated_round_trip() {
        let key = ContentKey::from_hex("0102030405060708090a0b0c0d0e0f10").expect("valid hex");
        let truncated = key.truncated();
        assert_eq!(truncated.as_bytes(), &[1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(
            truncated.to_content_key().to_hex(),
            "01020304050607080900000000000000"
        );
        assert!(truncated.matches(&key));
    }

    #[test]
    fn test_reversed() {
        let key = ContentKey::from_hex("0102030405060708090a0b0c0d0e0f10").expect("valid hex");
        assert_eq!(key.reversed()[0], 0x10);
        assert_eq!(key.reversed()[15], 0x01);
    }

    proptest! {
        #[test]
        fn bucket_depends_only_on_first_nine_bytes(head in any::<[u8; 9]>(), a in any::<[u8; 7]>(), b in any::<[u8; 7]>()) {
            let mut left = [0u8; 16];
            let mut right = [0u8; 16];
            left[..9].copy_from_slice(&head);
            right[..9].copy_from_slice(&head);
            left[9..].copy_from_slice(&a);
            right[9..].copy_from_slice(&b);
            let left = ContentKey::from_bytes(left);
            let right = ContentKey::from_bytes(right);
            prop_assert_eq!(left.bucket(), right.bucket());
            prop_assert_eq!(left.bucket(), left.truncated().bucket());
            prop_assert!(left.bucket() < 16);
        }
    }
}
