//! 30-byte reconstruction header.
//!
//! Every blob in a data file is preceded by this header. It lets the
//! client rebuild bucket index files from data files alone, and the second
//! checksum ties it to the exact archive and offset it was written at.
//!
//! Layout (30 bytes total):
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0x00   | 16   | Key (reversed byte order) |
//! | 0x10   | 4    | Size (LE) |
//! | 0x14   | 1    | Channel (0 = data, 1 = meta) |
//! | 0x15   | 1    | Reserved |
//! | 0x16   | 4    | Checksum A: `hashlittle` of bytes 0x00..0x16 (LE) |
//! | 0x1A   | 4    | Checksum B: location checksum of bytes 0x00..0x1A |

use cascette_crypto::checksum::CHECKSUMMED_PREFIX;
use cascette_crypto::{ContentKey, RECONSTRUCTION_SEED, calculate_checksum, hashlittle};

use crate::{ContainerError, RECONSTRUCTION_HEADER_SIZE, Result};

const CHECKSUM_A_OFFSET: usize = 0x16;

/// Which stream a blob belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Channel {
    /// Regular content
    Data = 0,
    /// Segment header placeholders
    Meta = 1,
}

impl TryFrom<u8> for Channel {
    type Error = ContainerError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Data),
            1 => Ok(Self::Meta),
            other => Err(ContainerError::InvalidHeader(format!(
                "unknown channel {other}"
            ))),
        }
    }
}

/// Header written in front of every blob in a data file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconstructionHeader {
    /// Key of the blob, in natural byte order
    pub key: ContentKey,
    /// Payload size
    pub size: u32,
    /// Stream the blob belongs to
    pub channel: Channel,
    /// `hashlittle` over the first 0x16 header bytes
    pub checksum_a: u32,
    /// Location checksum of the first 0x1a header bytes
    pub checksum_b: [u8; 4],
}

impl ReconstructionHeader {
    /// Build a sealed header for a blob stored at `offset` in `archive_index`
    pub fn new(
        key: ContentKey,
        size: u32,
        channel: Channel,
        archive_index: u16,
        offset: u32,
    ) -> Self {
        let mut header = Self {
            key,
            size,
            channel,
            checksum_a: 0,
            checksum_b: [0; 4],
        };
        header.seal(archive_index, offset);
        header
    }

    /// Recompute both checksums for a location
    pub fn seal(&mut self, archive_index: u16, offset: u32) {
        let bytes = self.to_bytes();
        self.checksum_a = hashlittle(&bytes[..CHECKSUM_A_OFFSET], RECONSTRUCTION_SEED);
        let bytes = self.to_bytes();
        self.checksum_b = calculate_checksum(&prefix(&bytes), archive_index, offset);
    }

    /// Serialize to 30 bytes
    pub fn to_bytes(&self) -> [u8; RECONSTRUCTION_HEADER_SIZE] {
        let mut buf = [0u8; RECONSTRUCTION_HEADER_SIZE];
        buf[0x00..0x10].copy_from_slice(&self.key.reversed());
        buf[0x10..0x14].copy_from_slice(&self.size.to_le_bytes());
        buf[0x14] = self.channel as u8;
        buf[0x15] = 0;
        buf[0x16..0x1A].copy_from_slice(&self.checksum_a.to_le_bytes());
        buf[0x1A..0x1E].copy_from_slice(&self.checksum_b);
        buf
    }

    /// Parse from the first 30 bytes of `data`
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < RECONSTRUCTION_HEADER_SIZE {
            return Err(ContainerError::InvalidHeader(format!(
                "need {RECONSTRUCTION_HEADER_SIZE} bytes, got {}",
                data.len()
            )));
        }

        let mut reversed = [0u8; 16];
        reversed.copy_from_slice(&data[0x00..0x10]);
        reversed.reverse();

        let le32 = |b: &[u8]| u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        let mut checksum_b = [0u8; 4];
        checksum_b.copy_from_slice(&data[0x1A..0x1E]);

        Ok(Self {
            key: ContentKey::from_bytes(reversed),
            size: le32(&data[0x10..]),
            channel: Channel::try_from(data[0x14])?,
            checksum_a: le32(&data[0x16..]),
            checksum_b,
        })
    }

    /// Check both checksums against a location
    pub fn verify(&self, archive_index: u16, offset: u32) -> Result<()> {
        let expected = Self::new(self.key, self.size, self.channel, archive_index, offset);
        if expected.checksum_a != self.checksum_a {
            return Err(ContainerError::InvalidHeader(format!(
                "checksum A mismatch for {}",
                self.key
            )));
        }
        if expected.checksum_b != self.checksum_b {
            return Err(ContainerError::InvalidHeader(format!(
                "checksum B mismatch for {} at archive {archive_index} offset {offset}",
                self.key
            )));
        }
        Ok(())
    }
}

fn prefix(bytes: &[u8; RECONSTRUCTION_HEADER_SIZE]) -> [u8; CHECKSUMMED_PREFIX] {
    let mut out = [0u8; CHECKSUMMED_PREFIX];
    out.copy_from_slice(&bytes[..CHECKSUMMED_PREFIX]);
    out
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    fn meta_key() -> ContentKey {
        ContentKey::from_hex("0600002115aed27828df57764acbea58").expect("valid hex")
    }

    #[test]
    fn test_known_meta_header() {
        // Natural key 06000021..58; stored reversed as 58EACB4A..06
        let header = ReconstructionHeader::new(meta_key(), 30, Channel::Meta, 0, 0);
        let bytes = header.to_bytes();

        assert_eq!(
            hex::encode_upper(&bytes[..16]),
            "58EACB4A7657DF2878D2AE1521000006"
        );
        assert_eq!(&bytes[0x10..0x16], &[30, 0, 0, 0, 1, 0]);
        assert_eq!(header.checksum_a, 0x9ff3_5bf8);
        assert_eq!(u32::from_le_bytes(header.checksum_b), 0x8ebf_ff37);

        let moved = ReconstructionHeader::new(meta_key(), 30, Channel::Meta, 0, 30);
        assert_eq!(u32::from_le_bytes(moved.checksum_b), 0xd76d_6103);
    }

    #[test]
    fn test_parse_and_verify() {
        let key = ContentKey::from_data(b"payload");
        let header = ReconstructionHeader::new(key, 7, Channel::Data, 3, 960);
        let parsed = ReconstructionHeader::from_bytes(&header.to_bytes()).expect("parse");
        assert_eq!(parsed, header);
        parsed.verify(3, 960).expect("same location verifies");
        assert!(parsed.verify(3, 990).is_err());
    }

    #[test]
    fn test_rejects_unknown_channel() {
        let mut bytes = ReconstructionHeader::new(ContentKey::default(), 0, Channel::Data, 0, 0)
            .to_bytes();
        bytes[0x14] = 7;
        assert!(ReconstructionHeader::from_bytes(&bytes).is_err());
        assert!(ReconstructionHeader::from_bytes(&bytes[..10]).is_err());
    }
}
