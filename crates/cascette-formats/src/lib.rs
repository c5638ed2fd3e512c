//! Binary formats for CASC container reconstruction
//!
//! This crate parses CDN archive indices and serializes the group indices
//! built from them. Both directions share one record codec, so anything
//! written here parses back to the same entries.
//!
//! # Design Principles
//!
//! - **Symmetric Operations**: Both parsing and building supported
//! - **Fail per file**: A malformed index is an error for that file only
//! - **Round-Trip Guarantee**: parse(build(entries)) == entries

#![warn(missing_docs)]

pub mod archive;

pub use archive::{ArchiveError, ArchiveIndex, GroupIndexBuilder, IndexEntry, OffsetFlavor};
