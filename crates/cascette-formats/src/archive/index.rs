//! Archive index parsing
//!
//! The body is a run of 4 KiB blocks. Each block holds as many whole
//! records as fit and is zero padded to the block boundary. Blocks are
//! followed by the table of contents (last key of every block, then the
//! first 8 bytes of every block's MD5) and the 28-byte footer.
//!
//! Record fields are big-endian; only the footer's element count is
//! little-endian.

use cascette_crypto::ContentKey;
use tracing::debug;

use super::constants::{BLOCK_SIZE, FOOTER_SIZE, KEY_SIZE, TOC_HASH_SIZE};
use super::error::{ArchiveError, ArchiveResult};
use super::footer::{IndexFooter, OffsetFlavor};

/// Location of one blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IndexEntry {
    /// Stored size in bytes
    pub size: u32,
    /// Byte offset inside the archive
    pub offset: u32,
    /// Archive the blob lives in
    pub archive_index: u16,
}

impl IndexEntry {
    /// Create a new entry
    pub const fn new(archive_index: u16, offset: u32, size: u32) -> Self {
        Self {
            size,
            offset,
            archive_index,
        }
    }
}

/// A key together with where it is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexRecord {
    /// Content key
    pub key: ContentKey,
    /// Location of the content
    pub entry: IndexEntry,
}

impl IndexRecord {
    /// Decode one record. `data` must hold at least `flavor.record_size()` bytes.
    fn decode(data: &[u8], flavor: OffsetFlavor, source_archive: u16) -> Self {
        let be32 = |b: &[u8]| u32::from_be_bytes([b[0], b[1], b[2], b[3]]);

        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&data[..KEY_SIZE]);
        let size = be32(&data[KEY_SIZE..]);
        let field = &data[KEY_SIZE + 4..];

        let (archive_index, offset) = match flavor {
            OffsetFlavor::LooseFile => (source_archive, 0),
            OffsetFlavor::Archive => (source_archive, be32(field)),
            OffsetFlavor::PatchGroup => (u16::from(field[0]), be32(&field[1..])),
            OffsetFlavor::ArchiveGroup => {
                (u16::from_be_bytes([field[0], field[1]]), be32(&field[2..]))
            }
        };

        Self {
            key: ContentKey::from_bytes(key),
            entry: IndexEntry::new(archive_index, offset, size),
        }
    }

    /// Append the wire form of this record to `out`
    pub(crate) fn encode(&self, flavor: OffsetFlavor, out: &mut Vec<u8>) -> ArchiveResult<()> {
        let IndexEntry {
            size,
            offset,
            archive_index,
        } = self.entry;

        out.extend_from_slice(self.key.as_bytes());
        out.extend_from_slice(&size.to_be_bytes());

        match flavor {
            OffsetFlavor::LooseFile => {}
            OffsetFlavor::Archive => out.extend_from_slice(&offset.to_be_bytes()),
            OffsetFlavor::PatchGroup => {
                let archive = u8::try_from(archive_index).map_err(|_| {
                    ArchiveError::ArchiveIndexOutOfRange {
                        archive_index,
                        width: flavor as u8,
                    }
                })?;
                out.push(archive);
                out.extend_from_slice(&offset.to_be_bytes());
            }
            OffsetFlavor::ArchiveGroup => {
                out.extend_from_slice(&archive_index.to_be_bytes());
                out.extend_from_slice(&offset.to_be_bytes());
            }
        }
        Ok(())
    }
}

/// A parsed archive index
#[derive(Debug, Clone)]
pub struct ArchiveIndex {
    /// Footer as read from the file
    pub footer: IndexFooter,
    /// Offset flavor derived from the footer
    pub flavor: OffsetFlavor,
    /// Records in file order
    pub records: Vec<IndexRecord>,
}

impl ArchiveIndex {
    /// Parse an index whose records carry their own archive index, or that
    /// are not tied to any archive.
    pub fn parse(data: &[u8]) -> ArchiveResult<Self> {
        Self::parse_for_archive(data, 0)
    }

    /// Parse the index belonging to archive `source_archive`.
    ///
    /// Plain archive indices (4-byte offsets) do not store the archive
    /// index; every record is attributed to `source_archive`.
    pub fn parse_for_archive(data: &[u8], source_archive: u16) -> ArchiveResult<Self> {
        let footer = IndexFooter::from_index_bytes(data)?;
        let flavor = footer.validate()?;

        let record_size = flavor.record_size();
        let count = footer.element_count as usize;
        let body_len = data.len() - FOOTER_SIZE;

        if count.saturating_mul(record_size) > body_len {
            return Err(ArchiveError::ElementCountOverflow {
                count,
                record_size,
                body_len,
            });
        }

        let per_block = BLOCK_SIZE / record_size;
        let mut records = Vec::with_capacity(count);
        let mut block_start = 0;

        while records.len() < count {
            let in_block = per_block.min(count - records.len());
            let block_end = block_start + in_block * record_size;
            if block_end > body_len {
                return Err(ArchiveError::Truncated {
                    needed: block_end,
                    available: body_len,
                });
            }

            records.extend(
                data[block_start..block_end]
                    .chunks_exact(record_size)
                    .map(|chunk| IndexRecord::decode(chunk, flavor, source_archive)),
            );

            block_start += BLOCK_SIZE;
        }

        debug!(
            "Parsed archive index: {} records, {}-byte offsets",
            records.len(),
            flavor.width()
        );

        Ok(Self {
            footer,
            flavor,
            records,
        })
    }

    /// Number of data blocks the records occupy
    pub fn block_count(&self) -> usize {
        self.records
            .len()
            .div_ceil(BLOCK_SIZE / self.flavor.record_size())
    }

    /// Find a record by key. Records are sorted in well-formed indices.
    pub fn find(&self, key: &ContentKey) -> Option<&IndexEntry> {
        self.records
            .binary_search_by(|r| r.key.cmp(key))
            .ok()
            .map(|i| &self.records[i].entry)
    }

    /// Check block hashes, TOC hash and footer checksum of `data`.
    ///
    /// Parsing does not require these to hold.
    pub fn verify(&self, data: &[u8]) -> ArchiveResult<()> {
        self.footer.verify_checksum()?;

        let blocks = self.block_count();
        let toc_len = blocks * (KEY_SIZE + TOC_HASH_SIZE);
        let toc_end = data.len().saturating_sub(FOOTER_SIZE);
        let needed = blocks * BLOCK_SIZE + toc_len;
        if needed > toc_end {
            return Err(ArchiveError::Truncated {
                needed,
                available: toc_end,
            });
        }

        let toc = &data[toc_end - toc_len..toc_end];
        if md5::compute(toc).0[..TOC_HASH_SIZE] != self.footer.toc_hash {
            return Err(ArchiveError::TocChecksum);
        }

        let hashes = &toc[blocks * KEY_SIZE..];
        for (i, (block, expected)) in data[..blocks * BLOCK_SIZE]
            .chunks_exact(BLOCK_SIZE)
            .zip(hashes.chunks_exact(TOC_HASH_SIZE))
            .enumerate()
        {
            if md5::compute(block).0[..TOC_HASH_SIZE] != *expected {
                return Err(ArchiveError::BlockChecksum(i));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    fn index_with_records(flavor: OffsetFlavor, records: &[Vec<u8>]) -> Vec<u8> {
        let mut data = Vec::new();
        for record in records {
            data.extend_from_slice(record);
        }
        data.resize(BLOCK_SIZE, 0);
        let footer = IndexFooter::new(flavor, [0; 8], records.len() as i32);
        data.extend_from_slice(&footer.to_bytes().expect("footer"));
        data
    }

    #[test]
    fn test_parse_archive_flavor_uses_source_archive() {
        let mut record = vec![0x11; 16];
        record.extend_from_slice(&0x0000_0400u32.to_be_bytes());
        record.extend_from_slice(&0x0001_0000u32.to_be_bytes());
        let data = index_with_records(OffsetFlavor::Archive, &[record]);

        let index = ArchiveIndex::parse_for_archive(&data, 42).expect("parse");
        assert_eq!(index.records.len(), 1);
        assert_eq!(index.records[0].entry, IndexEntry::new(42, 0x1_0000, 0x400));
    }

    #[test]
    fn test_parse_patch_group_flavor() {
        let mut record = vec![0x22; 16];
        record.extend_from_slice(&77u32.to_be_bytes());
        record.push(9);
        record.extend_from_slice(&1234u32.to_be_bytes());
        let data = index_with_records(OffsetFlavor::PatchGroup, &[record]);

        let index = ArchiveIndex::parse(&data).expect("parse");
        assert_eq!(index.records[0].entry, IndexEntry::new(9, 1234, 77));
    }

    #[test]
    fn test_parse_loose_flavor() {
        let mut record = vec![0x33; 16];
        record.extend_from_slice(&5u32.to_be_bytes());
        let data = index_with_records(OffsetFlavor::LooseFile, &[record]);

        let index = ArchiveIndex::parse(&data).expect("parse");
        assert_eq!(index.records[0].entry, IndexEntry::new(0, 0, 5));
        assert_eq!(
            index.find(&ContentKey::from_bytes([0x33; 16])),
            Some(&IndexEntry::new(0, 0, 5))
        );
    }

    #[test]
    fn test_element_count_overflow_rejected() {
        let mut data = vec![0u8; 100];
        let footer = IndexFooter::new(OffsetFlavor::Archive, [0; 8], 5);
        data.extend_from_slice(&footer.to_bytes().expect("footer"));
        assert!(matches!(
            ArchiveIndex::parse(&data),
            Err(ArchiveError::ElementCountOverflow {
                count: 5,
                record_size: 24,
                body_len: 100
            })
        ));
    }

    #[test]
    fn test_second_block_missing() {
        // 171 records fit the body by size, but the second block is cut short
        let mut data = vec![0u8; BLOCK_SIZE + 10];
        let footer = IndexFooter::new(OffsetFlavor::Archive, [0; 8], 171);
        data.extend_from_slice(&footer.to_bytes().expect("footer"));
        assert!(matches!(
            ArchiveIndex::parse(&data),
            Err(ArchiveError::Truncated { .. })
        ));
    }

    #[test]
    fn test_short_buffer() {
        assert!(matches!(
            ArchiveIndex::parse(&[0u8; 10]),
            Err(ArchiveError::Truncated {
                needed: 28,
                available: 10
            })
        ));
    }
}
