//! Data file layout
//!
//! - [`reconstruction`]: the 30-byte header in front of every blob
//! - [`segment`]: the 16 Meta keys seeded into each data file
//! - [`writer`]: sequential, size-capped data file assembly

pub mod reconstruction;
pub mod segment;
pub mod writer;

pub use reconstruction::{Channel, ReconstructionHeader};
pub use segment::{BindMode, SegmentKeyDeriver, SegmentKeys};
pub use writer::{ArchiveState, ArchiveWriter, FinalizedContainer, data_file_name};
