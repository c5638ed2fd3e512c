//! CDN archive indices
//!
//! An archive index maps content keys to their location inside one or more
//! CDN archives. The same block layout serves four flavors, told apart by
//! the width of the offset field recorded in the footer:
//!
//! | `offset_bytes` | flavor | offset field |
//! |---|---|---|
//! | 0 | loose file index | none |
//! | 4 | archive index | u32 offset |
//! | 5 | patch group index | u8 archive + u32 offset |
//! | 6 | archive group index | u16 archive + u32 offset |
//!
//! # Parse an archive index
//!
//! ```
//! use cascette_crypto::ContentKey;
//! use cascette_formats::archive::{ArchiveIndex, IndexEntry, OffsetFlavor, write_group_index};
//!
//! let key = ContentKey::from_data(b"payload");
//! let data = write_group_index([(key, IndexEntry::new(3, 4096, 7))], OffsetFlavor::ArchiveGroup)?;
//!
//! let index = ArchiveIndex::parse(&data)?;
//! assert_eq!(index.find(&key), Some(&IndexEntry::new(3, 4096, 7)));
//! # Ok::<(), cascette_formats::archive::ArchiveError>(())
//! ```

mod builder;
mod error;
mod footer;
mod index;

pub use builder::{GroupIndexBuilder, write_group_index};
pub use error::{ArchiveError, ArchiveResult};
pub use footer::{IndexFooter, OffsetFlavor, looks_encrypted};
pub use index::{ArchiveIndex, IndexEntry, IndexRecord};

/// Archive index constants
pub mod constants {
    /// Block size in KiB as recorded in the footer
    pub const BLOCK_SIZE_KB: u8 = 4;

    /// Size of each data block in bytes
    pub const BLOCK_SIZE: usize = BLOCK_SIZE_KB as usize * 1024;

    /// Footer size in bytes
    pub const FOOTER_SIZE: usize = 28;

    /// Key width in bytes
    pub const KEY_SIZE: usize = 16;

    /// Bytes kept from each MD5 in the TOC and footer
    pub const TOC_HASH_SIZE: usize = 8;
}
