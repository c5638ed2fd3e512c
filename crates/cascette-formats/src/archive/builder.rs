//! Group index serialization
//!
//! Group indices are generated locally from the merged view of many CDN
//! archive indices. The output uses the same block layout as a CDN index,
//! so [`ArchiveIndex::parse`](super::ArchiveIndex::parse) reads it back.

use std::io::Write;

use cascette_crypto::ContentKey;
use tracing::debug;

use super::constants::{BLOCK_SIZE, FOOTER_SIZE, KEY_SIZE, TOC_HASH_SIZE};
use super::error::{ArchiveError, ArchiveResult};
use super::footer::{IndexFooter, OffsetFlavor};
use super::index::{IndexEntry, IndexRecord};

/// Builder for group index files
#[derive(Debug, Clone)]
pub struct GroupIndexBuilder {
    flavor: OffsetFlavor,
    records: Vec<IndexRecord>,
}

impl GroupIndexBuilder {
    /// Create a builder emitting records with the given offset flavor
    pub fn new(flavor: OffsetFlavor) -> Self {
        Self {
            flavor,
            records: Vec::new(),
        }
    }

    /// Add one entry. When a key is added twice the first entry is kept.
    pub fn add(&mut self, key: ContentKey, entry: IndexEntry) -> &mut Self {
        self.records.push(IndexRecord { key, entry });
        self
    }

    /// Add many entries
    pub fn extend<I>(&mut self, entries: I) -> &mut Self
    where
        I: IntoIterator<Item = (ContentKey, IndexEntry)>,
    {
        self.records
            .extend(entries.into_iter().map(|(key, entry)| IndexRecord { key, entry }));
        self
    }

    /// Number of entries added so far, duplicates included
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing has been added
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Serialize the index into a fresh buffer
    pub fn build(mut self) -> ArchiveResult<Vec<u8>> {
        // Stable sort, so dedup keeps the first entry added for each key
        self.records.sort_by_key(|r| r.key);
        self.records.dedup_by_key(|r| r.key);

        let flavor = self.flavor;
        let record_size = flavor.record_size();
        let element_count =
            i32::try_from(self.records.len()).map_err(|_| ArchiveError::ElementCountOverflow {
                count: self.records.len(),
                record_size,
                body_len: i32::MAX as usize,
            })?;

        let mut out = Vec::with_capacity(
            self.records.len().div_ceil(BLOCK_SIZE / record_size) * BLOCK_SIZE + FOOTER_SIZE,
        );
        let mut block = Vec::with_capacity(BLOCK_SIZE);
        let mut last_keys: Vec<ContentKey> = Vec::new();
        let mut block_hashes: Vec<[u8; TOC_HASH_SIZE]> = Vec::new();

        let mut flush = |block: &mut Vec<u8>, last_key: ContentKey, out: &mut Vec<u8>| {
            block.resize(BLOCK_SIZE, 0);
            let mut half = [0u8; TOC_HASH_SIZE];
            half.copy_from_slice(&md5::compute(&block[..]).0[..TOC_HASH_SIZE]);
            last_keys.push(last_key);
            block_hashes.push(half);
            out.extend_from_slice(block);
            block.clear();
        };

        let mut last_key = None;
        for record in &self.records {
            if let Some(key) = last_key
                && block.len() + record_size > BLOCK_SIZE
            {
                flush(&mut block, key, &mut out);
            }
            record.encode(flavor, &mut block)?;
            last_key = Some(record.key);
        }
        if let Some(key) = last_key {
            flush(&mut block, key, &mut out);
        }

        let blocks = last_keys.len();
        let mut toc = Vec::with_capacity(blocks * (KEY_SIZE + TOC_HASH_SIZE));
        for key in &last_keys {
            toc.extend_from_slice(key.as_bytes());
        }
        for hash in &block_hashes {
            toc.extend_from_slice(hash);
        }

        let mut toc_hash = [0u8; TOC_HASH_SIZE];
        toc_hash.copy_from_slice(&md5::compute(&toc).0[..TOC_HASH_SIZE]);
        out.extend_from_slice(&toc);

        // The footer checksum covers the footer itself: write it with a zero
        // checksum, hash it, then patch the last 8 bytes.
        let footer = IndexFooter::new(flavor, toc_hash, element_count);
        out.extend_from_slice(&footer.to_bytes()?);
        let footer_start = out.len() - FOOTER_SIZE;
        let checksum = md5::compute(&out[footer_start..]);
        let checksum_start = out.len() - TOC_HASH_SIZE;
        out[checksum_start..].copy_from_slice(&checksum.0[..TOC_HASH_SIZE]);

        debug!(
            "Built group index: {} records in {} blocks, {} bytes",
            element_count,
            blocks,
            out.len()
        );

        Ok(out)
    }

    /// Serialize the index into `writer`, returning the bytes written
    pub fn write_to<W: Write>(self, writer: &mut W) -> ArchiveResult<usize> {
        let data = self.build()?;
        writer.write_all(&data)?;
        Ok(data.len())
    }
}

/// Serialize `entries` as a group index with the given offset flavor
pub fn write_group_index<I>(entries: I, flavor: OffsetFlavor) -> ArchiveResult<Vec<u8>>
where
    I: IntoIterator<Item = (ContentKey, IndexEntry)>,
{
    let mut builder = GroupIndexBuilder::new(flavor);
    builder.extend(entries);
    builder.build()
}
