//! Bucket index (.idx) files
//!
//! Each of the 16 buckets owns one index file mapping 9-byte truncated keys
//! to a location in a data file. Files are rebuilt from scratch on every
//! write, so only the sorted section of the journal format is produced.
//!
//! File layout:
//! ```text
//! [0x00] u32 header size (16) + u32 hashlittle2 of the header
//! [0x08] IndexHeader (16 bytes)
//! [0x18] 8 zero bytes
//! [0x20] u32 entry bytes + u32 hashlittle2 of the entries (0 when empty)
//! [0x28] 18-byte entries in write order
//! [....] zero padding up to 64 KiB
//! ```

use binrw::{BinRead, BinReaderExt, BinResult, BinWrite, BinWriterExt, Endian};
use cascette_crypto::{ContentKey, TruncatedKey, bucket_index, hashlittle2};
use parking_lot::Mutex;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::{BUCKET_COUNT, ContainerError, MAX_ARCHIVE_ID, MAX_ARCHIVE_OFFSET, Result};

/// Journal format version written and accepted
pub const INDEX_VERSION: u16 = 7;

/// Size of one packed entry
pub const ENTRY_SIZE: usize = 18;

/// Size of the header covered by the header hash
pub const HEADER_SIZE: usize = 16;

/// Offset of the first entry
pub const ENTRIES_OFFSET: usize = 0x28;

/// Minimum on-disk size of an index file
pub const INDEX_FILE_SIZE: usize = 0x10000;

/// Where a blob lives: data file number and byte offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StorageLocation {
    /// Data file number (`data.NNN`), 10 bits
    pub archive_id: u16,
    /// Offset within the data file, 30 bits
    pub offset: u32,
}

impl StorageLocation {
    /// Check that the location fits the 10/30-bit packing
    pub fn new(archive_id: u32, offset: u64) -> Result<Self> {
        if archive_id > u32::from(MAX_ARCHIVE_ID) || offset > u64::from(MAX_ARCHIVE_OFFSET) {
            return Err(ContainerError::PackingOverflow { archive_id, offset });
        }
        Ok(Self {
            archive_id: archive_id as u16,
            offset: offset as u32,
        })
    }

    /// The four low bytes: archive low bits over the offset
    const fn packed_low(self) -> u32 {
        (((self.archive_id & 0x03) as u32) << 30) | (self.offset & MAX_ARCHIVE_OFFSET)
    }
}

// One byte of archive high bits, then a big-endian word holding the two
// archive low bits above a 30-bit offset
fn parse_location<R: std::io::Read + std::io::Seek>(
    reader: &mut R,
    _endian: Endian,
    _args: (),
) -> BinResult<StorageLocation> {
    let high = u16::from(reader.read_be::<u8>()?);
    let low = reader.read_be::<u32>()?;
    Ok(StorageLocation {
        archive_id: (high << 2) | (low >> 30) as u16,
        offset: low & MAX_ARCHIVE_OFFSET,
    })
}

fn write_location<W: std::io::Write + std::io::Seek>(
    location: &StorageLocation,
    writer: &mut W,
    _endian: Endian,
    _args: (),
) -> BinResult<()> {
    if location.archive_id > MAX_ARCHIVE_ID || location.offset > MAX_ARCHIVE_OFFSET {
        return Err(binrw::Error::AssertFail {
            pos: 0,
            message: format!(
                "archive {} offset {:#x} does not fit 10/30-bit packing",
                location.archive_id, location.offset
            ),
        });
    }
    writer.write_be(&((location.archive_id >> 2) as u8))?;
    writer.write_be(&location.packed_low())?;
    Ok(())
}

/// One 18-byte bucket index entry
///
/// The key and location are big-endian; the size is little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(big)]
pub struct IndexEntry {
    /// First nine bytes of the content key
    pub key: TruncatedKey,

    /// Data file number and offset of the reconstruction header
    #[br(parse_with = parse_location)]
    #[bw(write_with = write_location)]
    pub location: StorageLocation,

    /// Payload size
    #[brw(little)]
    pub size: u32,
}

impl IndexEntry {
    /// Build an entry, rejecting locations the packing cannot hold
    pub fn new(key: TruncatedKey, archive_id: u32, offset: u64, size: u32) -> Result<Self> {
        Ok(Self {
            key,
            location: StorageLocation::new(archive_id, offset)?,
            size,
        })
    }

    /// Data file number
    pub const fn archive_id(&self) -> u16 {
        self.location.archive_id
    }

    /// Offset within the data file
    pub const fn offset(&self) -> u32 {
        self.location.offset
    }

    /// Bucket this entry belongs to
    pub fn bucket(&self) -> u8 {
        self.key.bucket()
    }
}

/// Index header, little-endian
#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct IndexHeader {
    /// Journal version (7)
    pub version: u16,
    /// Bucket id (0x00-0x0F)
    pub bucket: u8,
    /// Extra bytes (0)
    pub extra_bytes: u8,
    /// Size field bytes (4)
    pub size_bytes: u8,
    /// Location field bytes (5)
    pub location_bytes: u8,
    /// Key field bytes (9)
    pub key_bytes: u8,
    /// Offset bits within the location (30)
    pub offset_bits: u8,
    /// Container size ceiling
    pub archive_total_size_max: u64,
}

impl IndexHeader {
    /// Standard header for `bucket`
    pub const fn new(bucket: u8, archive_total_size_max: u64) -> Self {
        Self {
            version: INDEX_VERSION,
            bucket,
            extra_bytes: 0,
            size_bytes: 4,
            location_bytes: 5,
            key_bytes: 9,
            offset_bits: 30,
            archive_total_size_max,
        }
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::with_capacity(HEADER_SIZE));
        self.write_le(&mut cursor)?;
        Ok(cursor.into_inner())
    }

    fn validate(&self) -> Result<()> {
        if self.version != INDEX_VERSION {
            return Err(ContainerError::InvalidIndex(format!(
                "unsupported version {}",
                self.version
            )));
        }
        let layout = (
            self.size_bytes,
            self.location_bytes,
            self.key_bytes,
            self.offset_bits,
        );
        if layout != (4, 5, 9, 30) {
            return Err(ContainerError::InvalidIndex(format!(
                "unsupported entry layout {layout:?}"
            )));
        }
        if usize::from(self.bucket) >= BUCKET_COUNT {
            return Err(ContainerError::InvalidIndex(format!(
                "bucket {} out of range",
                self.bucket
            )));
        }
        Ok(())
    }
}

fn block_hash(data: &[u8]) -> u32 {
    if data.is_empty() {
        0
    } else {
        hashlittle2(data, 0, 0).0
    }
}

/// Contents of one bucket index file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIndex {
    header: IndexHeader,
    entries: Vec<IndexEntry>,
}

impl LocalIndex {
    /// Empty index for `bucket`
    pub const fn new(bucket: u8, archive_total_size_max: u64) -> Self {
        Self {
            header: IndexHeader::new(bucket, archive_total_size_max),
            entries: Vec::new(),
        }
    }

    /// Bucket id
    pub const fn bucket(&self) -> u8 {
        self.header.bucket
    }

    /// Header as written
    pub const fn header(&self) -> &IndexHeader {
        &self.header
    }

    /// Entries in write order
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are present
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an entry; the caller has routed it to this bucket
    pub fn push(&mut self, entry: IndexEntry) {
        self.entries.push(entry);
    }

    /// Latest entry for a key
    pub fn lookup(&self, key: &ContentKey) -> Option<&IndexEntry> {
        self.entries.iter().rev().find(|e| e.key.matches(key))
    }

    /// Serialize with freshly computed hashes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let header = self.header.to_bytes()?;

        let mut entries = Cursor::new(Vec::with_capacity(self.entries.len() * ENTRY_SIZE));
        for entry in &self.entries {
            entries.write_be(entry)?;
        }
        let entries = entries.into_inner();
        let entries_size = u32::try_from(entries.len()).map_err(|_| {
            ContainerError::InvalidIndex(format!("{} entry bytes", entries.len()))
        })?;

        let total = (ENTRIES_OFFSET + entries.len()).max(INDEX_FILE_SIZE);
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&(HEADER_SIZE as u32).to_le_bytes());
        out.extend_from_slice(&block_hash(&header).to_le_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(&[0u8; 8]);
        out.extend_from_slice(&entries_size.to_le_bytes());
        out.extend_from_slice(&block_hash(&entries).to_le_bytes());
        out.extend_from_slice(&entries);
        out.resize(total, 0);
        Ok(out)
    }

    /// Parse and validate an index file
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < ENTRIES_OFFSET {
            return Err(ContainerError::InvalidIndex(format!(
                "file is {} bytes, header needs {ENTRIES_OFFSET}",
                data.len()
            )));
        }

        let le32 = |at: usize| {
            u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
        };

        let header_size = le32(0x00) as usize;
        if header_size != HEADER_SIZE {
            return Err(ContainerError::InvalidIndex(format!(
                "header size {header_size}, expected {HEADER_SIZE}"
            )));
        }

        let header_bytes = &data[0x08..0x08 + HEADER_SIZE];
        let stored = le32(0x04);
        let actual = block_hash(header_bytes);
        if stored != actual {
            return Err(ContainerError::HeaderChecksum {
                expected: stored,
                actual,
            });
        }

        let header = IndexHeader::read_le(&mut Cursor::new(header_bytes))?;
        header.validate()?;

        let entries_size = le32(0x20) as usize;
        if entries_size % ENTRY_SIZE != 0 {
            return Err(ContainerError::InvalidIndex(format!(
                "entry bytes {entries_size} not a multiple of {ENTRY_SIZE}"
            )));
        }
        let end = ENTRIES_OFFSET + entries_size;
        if end > data.len() {
            return Err(ContainerError::InvalidIndex(format!(
                "entries end at {end}, file is {} bytes",
                data.len()
            )));
        }

        let entry_bytes = &data[ENTRIES_OFFSET..end];
        let stored = le32(0x24);
        let actual = block_hash(entry_bytes);
        if stored != actual {
            return Err(ContainerError::EntriesChecksum {
                expected: stored,
                actual,
            });
        }

        let mut cursor = Cursor::new(entry_bytes);
        let entries = (0..entries_size / ENTRY_SIZE)
            .map(|_| cursor.read_be::<IndexEntry>())
            .collect::<BinResult<Vec<_>>>()?;

        Ok(Self { header, entries })
    }

    /// File name for a bucket and version
    pub fn file_name(bucket: u8, version: u32) -> String {
        format!("{bucket:02x}{version:08x}.idx")
    }

    /// Bucket and version from a file name
    pub fn parse_file_name(name: &str) -> Option<(u8, u32)> {
        let stem = name.strip_suffix(".idx")?;
        if stem.len() != 10 {
            return None;
        }
        let bucket = u8::from_str_radix(stem.get(0..2)?, 16).ok()?;
        let version = u32::from_str_radix(stem.get(2..10)?, 16).ok()?;
        Some((bucket, version))
    }

    /// Write to `dir`, replacing any previous file for this bucket and version
    pub async fn save(&self, dir: &Path, version: u32) -> Result<PathBuf> {
        let path = dir.join(Self::file_name(self.bucket(), version));
        let temp = path.with_extension("tmp");
        let data = self.to_bytes()?;

        tokio::fs::write(&temp, &data).await?;
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }

        debug!(
            "Saved index {:02x} with {} entries to {}",
            self.bucket(),
            self.entries.len(),
            path.display()
        );
        Ok(path)
    }

    /// Read and validate an index file
    pub async fn load(path: &Path) -> Result<Self> {
        let data = tokio::fs::read(path).await?;
        Self::from_bytes(&data)
    }
}

/// The 16 bucket indices of a container, each behind its own lock
#[derive(Debug)]
pub struct LocalIndexSet {
    buckets: [Mutex<LocalIndex>; BUCKET_COUNT],
}

impl LocalIndexSet {
    /// Empty indices for all buckets
    pub fn new(archive_total_size_max: u64) -> Self {
        Self {
            buckets: std::array::from_fn(|i| {
                Mutex::new(LocalIndex::new(i as u8, archive_total_size_max))
            }),
        }
    }

    /// Record a blob location in the bucket chosen by the full key
    pub fn register(
        &self,
        key: &ContentKey,
        archive_id: u32,
        offset: u64,
        size: u32,
    ) -> Result<IndexEntry> {
        let entry = IndexEntry::new(key.truncated(), archive_id, offset, size)?;
        let bucket = usize::from(bucket_index(key.as_bytes()));
        self.buckets[bucket].lock().push(entry);
        Ok(entry)
    }

    /// Latest entry for a key
    pub fn lookup(&self, key: &ContentKey) -> Option<IndexEntry> {
        self.buckets[usize::from(key.bucket())]
            .lock()
            .lookup(key)
            .copied()
    }

    /// Copy of one bucket's index
    pub fn snapshot(&self, bucket: u8) -> Option<LocalIndex> {
        self.buckets
            .get(usize::from(bucket))
            .map(|index| index.lock().clone())
    }

    /// Entry count per bucket
    pub fn entry_counts(&self) -> [usize; BUCKET_COUNT] {
        std::array::from_fn(|i| self.buckets[i].lock().len())
    }

    /// Entries across all buckets
    pub fn total_entries(&self) -> usize {
        self.entry_counts().iter().sum()
    }

    /// Write all 16 files into `dir`
    pub async fn write_all(&self, dir: &Path, version: u32) -> Result<Vec<PathBuf>> {
        tokio::fs::create_dir_all(dir).await?;

        // Locks are not held across awaits
        let snapshots: Vec<LocalIndex> = self.buckets.iter().map(|b| b.lock().clone()).collect();

        let mut paths = Vec::with_capacity(BUCKET_COUNT);
        for index in &snapshots {
            paths.push(index.save(dir, version).await?);
        }

        info!(
            "Wrote {} index files with {} entries to {}",
            paths.len(),
            snapshots.iter().map(LocalIndex::len).sum::<usize>(),
            dir.display()
        );
        Ok(paths)
    }
}
