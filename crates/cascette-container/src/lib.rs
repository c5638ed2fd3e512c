//! Local CASC container reconstruction.
//!
//! This crate rebuilds the on-disk storage a game client expects from
//! content fetched off a CDN. It produces the two file kinds found in
//! `Data/data/`:
//!
//! - **Bucket index files** (`{bucket:02x}{version:08x}.idx`): one per
//!   bucket, mapping 9-byte truncated keys to `(archive, offset, size)`
//! - **Data files** (`data.NNN`): size-capped archives whose blobs are each
//!   preceded by a 30-byte reconstruction header
//!
//! # Pipeline
//!
//! 1. [`merge::merge_archive_indices`] downloads and parses every CDN
//!    archive index in parallel into one key map, which is saved as a group
//!    index under `Data/indices/` and reused on the next run
//! 2. [`Reconstructor`] fetches each requested blob, by byte range when the
//!    map knows its archive and as a loose file otherwise
//! 3. [`ArchiveWriter`] appends it to the current data file and registers
//!    it in the bucket index chosen by the key
//! 4. [`ArchiveWriter::finalize_all`] flushes the last data file and writes
//!    all 16 bucket index files
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cascette_container::{ContainerConfig, Reconstructor, fetch::MirrorSource};
//! use cascette_crypto::ContentKey;
//!
//! # async fn example() -> cascette_container::Result<()> {
//! let config = ContainerConfig::new("/games/wow/Data/data").with_machine_name("BUILDHOST");
//! let source = Arc::new(MirrorSource::new("/mirror/tpr/wow"));
//! let archives = vec![ContentKey::from_hex("0017a402f556fbece46c38dc431a2c9b").unwrap()];
//!
//! let mut reconstructor = Reconstructor::new(config, source);
//! reconstructor.load_archive_indices(&archives).await?;
//! let report = reconstructor.install(&[ContentKey::from_data(b"content")]).await?;
//! println!("{} written, {} skipped", report.written, report.skipped.len());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![allow(clippy::must_use_candidate)]

use thiserror::Error;

// Configuration
pub mod config;

// Remote content retrieval
pub mod fetch;

// Bucket index files
pub mod index;

// Remote index merging
pub mod merge;

// Orchestration
pub mod reconstruct;

// Data files, reconstruction headers and segment keys
pub mod storage;

pub use config::ContainerConfig;
pub use fetch::{ContentSource, FetchError, FetchRequest, PathKind, RetryPolicy};
pub use index::{IndexEntry, LocalIndex, LocalIndexSet};
pub use merge::{MergeReport, MergedIndex, merge_archive_indices};
pub use reconstruct::{ReconstructionReport, Reconstructor};
pub use storage::{
    ArchiveState, ArchiveWriter, BindMode, Channel, ReconstructionHeader, SegmentKeyDeriver,
    SegmentKeys,
};

/// Result type for container operations.
pub type Result<T> = std::result::Result<T, ContainerError>;

/// Errors that can occur while reconstructing a container.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Binary layout error.
    #[error("Binary format error: {0}")]
    BinRw(#[from] binrw::Error),

    /// Remote archive index could not be parsed or built.
    #[error("Archive index error: {0}")]
    Archive(#[from] cascette_formats::ArchiveError),

    /// Key loading or decryption failed.
    #[error("Crypto error: {0}")]
    Crypto(#[from] cascette_crypto::CryptoError),

    /// Remote content could not be retrieved.
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Bucket index file layout is malformed.
    #[error("Invalid index file: {0}")]
    InvalidIndex(String),

    /// Stored bucket index header hash does not match the header.
    #[error("Index header checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    HeaderChecksum {
        /// Hash stored in the file
        expected: u32,
        /// Hash computed from the header bytes
        actual: u32,
    },

    /// Stored bucket index entries hash does not match the entries.
    #[error("Index entries checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    EntriesChecksum {
        /// Hash stored in the file
        expected: u32,
        /// Hash computed from the entry bytes
        actual: u32,
    },

    /// Reconstruction header is malformed or sealed for another location.
    #[error("Invalid reconstruction header: {0}")]
    InvalidHeader(String),

    /// Container size exceeds what segment keys can address.
    ///
    /// `code` is 1 in reconstruction bind mode and 9 otherwise.
    #[error("Container too large ({max_size} bytes), error code {code}")]
    ContainerTooLarge {
        /// Bind-mode dependent error code
        code: u32,
        /// Requested container size
        max_size: u64,
    },

    /// No candidate byte produced the wanted checksum nibble.
    #[error("No segment key for segment {segment} nibble {nibble}")]
    SegmentKeySearch {
        /// Segment being derived
        segment: u16,
        /// Target nibble
        nibble: u8,
    },

    /// Archive id or offset does not fit the 10/30-bit index packing.
    #[error("Location does not fit index packing: archive {archive_id}, offset {offset}")]
    PackingOverflow {
        /// Archive id (must be below 1024)
        archive_id: u32,
        /// Offset (must be below 2^30)
        offset: u64,
    },

    /// A single payload cannot fit even an empty data file.
    #[error("Payload of {size} bytes exceeds archive capacity of {max} bytes")]
    PayloadTooLarge {
        /// Payload size
        size: usize,
        /// Archive size cap
        max: u64,
    },

    /// A remote index has the wrong offset flavor for how it is used.
    #[error("Unexpected offset flavor for {object}: {flavor} offset bytes")]
    UnexpectedFlavor {
        /// Index being loaded
        object: String,
        /// Offset field width found in its footer
        flavor: u8,
    },

    /// A group index references archives the caller did not list.
    #[error("Invalid group index: {0}")]
    InvalidGroupIndex(String),

    /// The writer was used after `finalize_all`.
    #[error("Archive writer already finalized")]
    WriterFinalized,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ContainerError {
    /// Whether the affected index file must be rebuilt from scratch
    pub const fn needs_rebuild(&self) -> bool {
        matches!(
            self,
            Self::HeaderChecksum { .. } | Self::EntriesChecksum { .. } | Self::InvalidIndex(_)
        )
    }

    /// Whether the error aborts a whole reconstruction run
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ContainerTooLarge { .. }
                | Self::SegmentKeySearch { .. }
                | Self::PackingOverflow { .. }
                | Self::Io(_)
                | Self::WriterFinalized
                | Self::Config(_)
        )
    }
}

/// Version information for the crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Data subdirectory where both `.idx` and `.data` files live.
pub const DATA_DIR: &str = "data";

/// CDN index cache subdirectory, sibling of [`DATA_DIR`].
pub const INDICES_DIR: &str = "indices";

/// Number of bucket index files.
pub const BUCKET_COUNT: usize = cascette_crypto::BUCKET_COUNT;

/// Size of the reconstruction header preceding every blob.
pub const RECONSTRUCTION_HEADER_SIZE: usize = 30;

/// Number of segment header keys seeded into each data file.
pub const SEGMENT_KEY_COUNT: usize = 16;

/// Bytes occupied by the seeded segment headers at the start of each data file.
pub const SEGMENT_REGION_SIZE: usize = SEGMENT_KEY_COUNT * RECONSTRUCTION_HEADER_SIZE * 2;

/// Default cap for a single data file (1023 MiB).
pub const DEFAULT_MAX_ARCHIVE_SIZE: u64 = 1023 * 1024 * 1024;

/// Default container ceiling recorded in index headers (1023 GiB).
pub const DEFAULT_CONTAINER_MAX_SIZE: u64 = 1_098_437_885_952;

/// Largest archive id the index packing can carry.
pub const MAX_ARCHIVE_ID: u16 = 0x3FF;

/// Largest offset the index packing can carry.
pub const MAX_ARCHIVE_OFFSET: u32 = 0x3FFF_FFFF;
