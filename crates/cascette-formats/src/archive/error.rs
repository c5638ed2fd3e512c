//! Error types for archive index operations

use thiserror::Error;

/// Archive operation result type
pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// Errors raised while parsing or building archive indices
///
/// All of these are fatal to the one file being processed and never to a
/// batch of files.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// A fixed footer field holds an unexpected value
    #[error("Invalid footer field {field}: expected {expected}, got {actual}")]
    InvalidFooter {
        /// Name of the field
        field: &'static str,
        /// Required value
        expected: u8,
        /// Value found in the file
        actual: u8,
    },

    /// The offset field width is not one of the known flavors
    #[error("Unsupported offset field width: {0} bytes")]
    UnsupportedOffsetBytes(u8),

    /// Declared element count is negative
    #[error("Negative element count: {0}")]
    NegativeElementCount(i32),

    /// Declared element count needs more bytes than the body holds
    #[error(
        "Element count {count} with {record_size}-byte records exceeds body of {body_len} bytes"
    )]
    ElementCountOverflow {
        /// Declared element count
        count: usize,
        /// Size of one record
        record_size: usize,
        /// Bytes available before the footer
        body_len: usize,
    },

    /// Buffer ended before the structure being read
    #[error("Truncated index: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes required
        needed: usize,
        /// Bytes present
        available: usize,
    },

    /// A block hash recorded in the TOC does not match the block
    #[error("Block {0} hash mismatch")]
    BlockChecksum(usize),

    /// Table of contents hash mismatch
    #[error("TOC checksum mismatch")]
    TocChecksum,

    /// Footer checksum mismatch
    #[error("Footer checksum mismatch: expected {expected:02x?}, got {actual:02x?}")]
    FooterChecksum {
        /// Checksum stored in the footer
        expected: [u8; 8],
        /// Checksum recomputed from the footer bytes
        actual: [u8; 8],
    },

    /// An entry does not fit the chosen offset flavor
    #[error("Entry archive index {archive_index} does not fit a {width}-byte offset field")]
    ArchiveIndexOutOfRange {
        /// Archive index of the entry
        archive_index: u16,
        /// Offset field width
        width: u8,
    },

    /// Binary read/write error
    #[error("Binary format error: {0}")]
    BinRead(#[from] binrw::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ArchiveError {
    /// Check if this is a validation error, as opposed to a layout error
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            Self::BlockChecksum(_) | Self::TocChecksum | Self::FooterChecksum { .. }
        )
    }
}
