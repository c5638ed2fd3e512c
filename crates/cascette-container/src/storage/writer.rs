//! Data file assembly
//!
//! An [`ArchiveWriter`] owns exactly one open data file at a time. Every
//! data file is seeded with 16 Meta headers before content is appended,
//! and rolls over to the next file number when a write would cross the
//! size cap.

use bytes::{BufMut, BytesMut};
use cascette_crypto::ContentKey;
use cascette_formats::archive::IndexEntry;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::reconstruction::{Channel, ReconstructionHeader};
use super::segment::SegmentKeyDeriver;
use crate::config::ContainerConfig;
use crate::index::LocalIndexSet;
use crate::{
    ContainerError, MAX_ARCHIVE_ID, RECONSTRUCTION_HEADER_SIZE, Result, SEGMENT_REGION_SIZE,
};

/// Lifecycle of the data file currently held by the writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveState {
    /// Allocated, segment headers not yet written
    Empty,
    /// Segment headers written, no content yet
    Seeded,
    /// At least one blob appended
    Writing,
    /// Flushed to disk; no further writes accepted
    Finalized,
}

/// Files produced by [`ArchiveWriter::finalize_all`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinalizedContainer {
    /// Data files in archive order
    pub archives: Vec<PathBuf>,
    /// The 16 bucket index files
    pub index_files: Vec<PathBuf>,
}

/// Name of a data file
pub fn data_file_name(archive_id: u16) -> String {
    format!("data.{archive_id:03}")
}

/// Sequential writer for size-capped data files
#[derive(Debug)]
pub struct ArchiveWriter {
    data_dir: PathBuf,
    max_archive_size: u64,
    index_version: u32,
    deriver: SegmentKeyDeriver,
    indices: Arc<LocalIndexSet>,
    archive_id: u16,
    buffer: BytesMut,
    state: ArchiveState,
    archives: Vec<PathBuf>,
}

impl ArchiveWriter {
    /// Open a writer and seed data file `start_index`.
    ///
    /// Fails when the container is too large for segment keys.
    pub fn open(
        config: &ContainerConfig,
        indices: Arc<LocalIndexSet>,
        start_index: u16,
    ) -> Result<Self> {
        config.validate()?;
        if start_index > MAX_ARCHIVE_ID {
            return Err(ContainerError::PackingOverflow {
                archive_id: u32::from(start_index),
                offset: 0,
            });
        }

        let deriver = SegmentKeyDeriver::new(
            &config.resolved_machine_name(),
            &config.base_dir,
            config.container_max_size,
            config.bind_mode,
        );

        let mut writer = Self {
            data_dir: config.data_dir.clone(),
            max_archive_size: config.max_archive_size,
            index_version: config.index_version,
            deriver,
            indices,
            archive_id: start_index,
            buffer: BytesMut::with_capacity(SEGMENT_REGION_SIZE),
            state: ArchiveState::Empty,
            archives: Vec::new(),
        };
        writer.seed()?;
        Ok(writer)
    }

    /// Number of the open data file
    pub const fn archive_id(&self) -> u16 {
        self.archive_id
    }

    /// Offset the next blob would be written at
    pub fn current_offset(&self) -> usize {
        self.buffer.len()
    }

    /// State of the open data file
    pub const fn state(&self) -> ArchiveState {
        self.state
    }

    /// Bucket indices receiving registrations
    pub fn indices(&self) -> &Arc<LocalIndexSet> {
        &self.indices
    }

    /// Data files flushed so far
    pub fn finalized_archives(&self) -> &[PathBuf] {
        &self.archives
    }

    fn seed(&mut self) -> Result<()> {
        let keys = self.deriver.derive(self.archive_id)?;
        let archive_id = u32::from(self.archive_id);

        // Headers sit 60 bytes apart but are sealed and indexed at 30-byte slots
        for (slot, key) in keys.keys.iter().enumerate() {
            let slot_offset = (slot * RECONSTRUCTION_HEADER_SIZE) as u32;
            let header = ReconstructionHeader::new(
                *key,
                RECONSTRUCTION_HEADER_SIZE as u32,
                Channel::Meta,
                self.archive_id,
                slot_offset,
            );
            self.buffer.put_slice(&header.to_bytes());
            self.buffer.put_bytes(0, RECONSTRUCTION_HEADER_SIZE);
            self.indices.register(
                key,
                archive_id,
                u64::from(slot_offset),
                RECONSTRUCTION_HEADER_SIZE as u32,
            )?;
        }

        self.state = ArchiveState::Seeded;
        debug!("Seeded data file {}", data_file_name(self.archive_id));
        Ok(())
    }

    /// Append one blob and register it in its bucket
    pub async fn write(&mut self, key: ContentKey, payload: &[u8]) -> Result<IndexEntry> {
        if self.state == ArchiveState::Finalized {
            return Err(ContainerError::WriterFinalized);
        }

        let needed = (RECONSTRUCTION_HEADER_SIZE + payload.len()) as u64;
        let too_large = ContainerError::PayloadTooLarge {
            size: payload.len(),
            max: self.max_archive_size,
        };
        if SEGMENT_REGION_SIZE as u64 + needed > self.max_archive_size {
            return Err(too_large);
        }
        let size = u32::try_from(payload.len()).map_err(|_| too_large)?;

        if self.buffer.len() as u64 + needed > self.max_archive_size {
            self.rotate().await?;
        }

        let offset = self.buffer.len();
        self.indices
            .register(&key, u32::from(self.archive_id), offset as u64, size)?;

        let header =
            ReconstructionHeader::new(key, size, Channel::Data, self.archive_id, offset as u32);
        self.buffer.put_slice(&header.to_bytes());
        self.buffer.put_slice(payload);
        self.state = ArchiveState::Writing;

        Ok(IndexEntry::new(self.archive_id, offset as u32, size))
    }

    async fn rotate(&mut self) -> Result<()> {
        let next = u32::from(self.archive_id) + 1;
        if next > u32::from(MAX_ARCHIVE_ID) {
            return Err(ContainerError::PackingOverflow {
                archive_id: next,
                offset: 0,
            });
        }

        self.flush_current().await?;
        self.archive_id = next as u16;
        self.state = ArchiveState::Empty;
        self.seed()
    }

    async fn flush_current(&mut self) -> Result<()> {
        tokio::fs::create_dir_all(&self.data_dir).await?;
        let path = self.data_dir.join(data_file_name(self.archive_id));
        tokio::fs::write(&path, &self.buffer).await?;

        info!(
            "Finalized {} ({} bytes)",
            path.display(),
            self.buffer.len()
        );
        self.buffer.clear();
        self.state = ArchiveState::Finalized;
        self.archives.push(path);
        Ok(())
    }

    /// Flush the open data file and write all 16 bucket index files
    pub async fn finalize_all(&mut self) -> Result<FinalizedContainer> {
        if self.state == ArchiveState::Finalized {
            return Err(ContainerError::WriterFinalized);
        }

        self.flush_current().await?;
        let index_files = self
            .indices
            .write_all(&self.data_dir, self.index_version)
            .await?;

        Ok(FinalizedContainer {
            archives: self.archives.clone(),
            index_files,
        })
    }

    /// Directory receiving the output files
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}
