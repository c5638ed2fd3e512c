//! Archive index footer
//!
//! The last 28 bytes of every archive index:
//!
//! ```text
//! 0x00  toc_hash        [u8; 8]   md5(TOC)[..8]
//! 0x08  version         u8        1
//! 0x09  reserved        [u8; 2]   0, 0
//! 0x0b  block_size_kb   u8        4
//! 0x0c  offset_bytes    u8        0, 4, 5 or 6
//! 0x0d  size_bytes      u8        4
//! 0x0e  key_size        u8        16
//! 0x0f  checksum_size   u8        8
//! 0x10  element_count   i32 LE
//! 0x14  checksum        [u8; 8]   md5(footer with checksum zeroed)[..8]
//! ```

use binrw::{BinRead, BinWrite};
use std::io::Cursor;

use super::constants::{BLOCK_SIZE_KB, FOOTER_SIZE, KEY_SIZE};
use super::error::{ArchiveError, ArchiveResult};

/// Width and meaning of the offset field of each record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OffsetFlavor {
    /// Loose file index: no offset field, each key is its own CDN object
    LooseFile = 0,
    /// Archive index: 4-byte offset into the archive the index belongs to
    Archive = 4,
    /// Patch group index: 1-byte archive index + 4-byte offset
    PatchGroup = 5,
    /// Archive group index: 2-byte archive index + 4-byte offset
    ArchiveGroup = 6,
}

impl OffsetFlavor {
    /// Map a footer `offset_bytes` value to its flavor
    pub fn from_offset_bytes(value: u8) -> ArchiveResult<Self> {
        match value {
            0 => Ok(Self::LooseFile),
            4 => Ok(Self::Archive),
            5 => Ok(Self::PatchGroup),
            6 => Ok(Self::ArchiveGroup),
            other => Err(ArchiveError::UnsupportedOffsetBytes(other)),
        }
    }

    /// Offset field width in bytes
    pub const fn width(self) -> usize {
        self as usize
    }

    /// Full record width: key, size field and offset field
    pub const fn record_size(self) -> usize {
        KEY_SIZE + 4 + self.width()
    }

    /// Largest archive index the offset field can carry
    pub const fn max_archive_index(self) -> u16 {
        match self {
            Self::LooseFile | Self::Archive => 0,
            Self::PatchGroup => u8::MAX as u16,
            Self::ArchiveGroup => u16::MAX,
        }
    }
}

/// Archive index footer
#[derive(BinRead, BinWrite, Debug, Clone, PartialEq, Eq)]
#[brw(little)]
pub struct IndexFooter {
    /// First 8 bytes of the MD5 of the table of contents
    pub toc_hash: [u8; 8],
    /// Format version (1)
    pub version: u8,
    /// Reserved (0, 0)
    pub reserved: [u8; 2],
    /// Block size in KiB (4)
    pub block_size_kb: u8,
    /// Offset field width, see [`OffsetFlavor`]
    pub offset_bytes: u8,
    /// Size field width (4)
    pub size_bytes: u8,
    /// Key width (16)
    pub key_size: u8,
    /// Footer checksum width (8)
    pub checksum_size: u8,
    /// Number of records
    pub element_count: i32,
    /// First 8 bytes of the MD5 of the footer with this field zeroed
    pub checksum: [u8; 8],
}

impl IndexFooter {
    /// Footer with the standard fixed fields and a zero checksum
    pub fn new(flavor: OffsetFlavor, toc_hash: [u8; 8], element_count: i32) -> Self {
        Self {
            toc_hash,
            version: 1,
            reserved: [0, 0],
            block_size_kb: BLOCK_SIZE_KB,
            offset_bytes: flavor as u8,
            size_bytes: 4,
            key_size: KEY_SIZE as u8,
            checksum_size: 8,
            element_count,
            checksum: [0; 8],
        }
    }

    /// Read the footer from the end of a complete index file
    pub fn from_index_bytes(data: &[u8]) -> ArchiveResult<Self> {
        if data.len() < FOOTER_SIZE {
            return Err(ArchiveError::Truncated {
                needed: FOOTER_SIZE,
                available: data.len(),
            });
        }
        let mut cursor = Cursor::new(&data[data.len() - FOOTER_SIZE..]);
        Ok(Self::read(&mut cursor)?)
    }

    /// Serialize to exactly 28 bytes
    pub fn to_bytes(&self) -> ArchiveResult<[u8; FOOTER_SIZE]> {
        let mut cursor = Cursor::new(Vec::with_capacity(FOOTER_SIZE));
        self.write(&mut cursor)?;
        let mut out = [0u8; FOOTER_SIZE];
        out.copy_from_slice(cursor.get_ref());
        Ok(out)
    }

    /// Check the fixed fields and return the offset flavor
    pub fn validate(&self) -> ArchiveResult<OffsetFlavor> {
        let fixed: [(&'static str, u8, u8); 7] = [
            ("version", 1, self.version),
            ("reserved[0]", 0, self.reserved[0]),
            ("reserved[1]", 0, self.reserved[1]),
            ("block_size_kb", BLOCK_SIZE_KB, self.block_size_kb),
            ("size_bytes", 4, self.size_bytes),
            ("key_size", KEY_SIZE as u8, self.key_size),
            ("checksum_size", 8, self.checksum_size),
        ];
        for (field, expected, actual) in fixed {
            if expected != actual {
                return Err(ArchiveError::InvalidFooter {
                    field,
                    expected,
                    actual,
                });
            }
        }

        if self.element_count < 0 {
            return Err(ArchiveError::NegativeElementCount(self.element_count));
        }

        OffsetFlavor::from_offset_bytes(self.offset_bytes)
    }

    /// Footer checksum over the serialized footer with the checksum zeroed
    pub fn compute_checksum(&self) -> ArchiveResult<[u8; 8]> {
        let mut zeroed = self.clone();
        zeroed.checksum = [0; 8];
        let digest = md5::compute(zeroed.to_bytes()?);
        let mut out = [0u8; 8];
        out.copy_from_slice(&digest.0[..8]);
        Ok(out)
    }

    /// Compare the stored checksum against a fresh one
    pub fn verify_checksum(&self) -> ArchiveResult<()> {
        let actual = self.compute_checksum()?;
        if actual == self.checksum {
            Ok(())
        } else {
            Err(ArchiveError::FooterChecksum {
                expected: self.checksum,
                actual,
            })
        }
    }
}

/// Best-effort check for an encrypted archive index.
///
/// Plain indices carry `01 00 00 04` (version, reserved, block size) at 20
/// bytes from the end. Anything else is assumed to be encrypted. A plain
/// file with a corrupt footer is misclassified as encrypted, and an
/// encrypted file whose ciphertext happens to contain those four bytes is
/// missed; the caller still has to parse the result.
pub fn looks_encrypted(data: &[u8]) -> bool {
    if data.len() < 20 {
        return false;
    }
    let tail = &data[data.len() - 20..data.len() - 16];
    tail != [1, 0, 0, BLOCK_SIZE_KB]
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_footer_layout() {
        let footer = IndexFooter::new(OffsetFlavor::ArchiveGroup, [0xAA; 8], 0x0102_0304);
        let bytes = footer.to_bytes().expect("serialize");
        assert_eq!(&bytes[..8], &[0xAA; 8]);
        assert_eq!(&bytes[8..16], &[1, 0, 0, 4, 6, 4, 16, 8]);
        assert_eq!(&bytes[16..20], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[20..], &[0; 8]);

        let parsed = IndexFooter::from_index_bytes(&bytes).expect("parse");
        assert_eq!(parsed, footer);
        assert_eq!(parsed.validate().expect("valid"), OffsetFlavor::ArchiveGroup);
    }

    #[test]
    fn test_validate_rejects_each_fixed_field() {
        let good = IndexFooter::new(OffsetFlavor::Archive, [0; 8], 1);

        let mut bad = good.clone();
        bad.version = 2;
        assert!(matches!(
            bad.validate(),
            Err(ArchiveError::InvalidFooter { field: "version", .. })
        ));

        let mut bad = good.clone();
        bad.reserved = [0, 1];
        assert!(matches!(
            bad.validate(),
            Err(ArchiveError::InvalidFooter { field: "reserved[1]", .. })
        ));

        let mut bad = good.clone();
        bad.block_size_kb = 8;
        assert!(bad.validate().is_err());

        let mut bad = good.clone();
        bad.key_size = 9;
        assert!(bad.validate().is_err());

        let mut bad = good.clone();
        bad.offset_bytes = 3;
        assert!(matches!(
            bad.validate(),
            Err(ArchiveError::UnsupportedOffsetBytes(3))
        ));

        let mut bad = good;
        bad.element_count = -1;
        assert!(matches!(
            bad.validate(),
            Err(ArchiveError::NegativeElementCount(-1))
        ));
    }

    #[test]
    fn test_checksum_patch() {
        let mut footer = IndexFooter::new(OffsetFlavor::Archive, [7; 8], 12);
        assert!(footer.verify_checksum().is_err());
        footer.checksum = footer.compute_checksum().expect("checksum");
        footer.verify_checksum().expect("patched checksum verifies");
    }

    #[test]
    fn test_looks_encrypted() {
        let footer = IndexFooter::new(OffsetFlavor::Archive, [0; 8], 0);
        let plain = footer.to_bytes().expect("serialize");
        assert!(!looks_encrypted(&plain));

        let mut scrambled = plain;
        scrambled[8] ^= 0x5A;
        assert!(looks_encrypted(&scrambled));

        assert!(!looks_encrypted(&[0u8; 4]));
    }

    #[test]
    fn test_flavor_widths() {
        assert_eq!(OffsetFlavor::LooseFile.record_size(), 20);
        assert_eq!(OffsetFlavor::Archive.record_size(), 24);
        assert_eq!(OffsetFlavor::PatchGroup.record_size(), 25);
        assert_eq!(OffsetFlavor::ArchiveGroup.record_size(), 26);
    }
}
