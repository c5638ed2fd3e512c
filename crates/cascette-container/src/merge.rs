//! Merging remote archive indices
//!
//! Every remote archive ships an `.index` file listing the blobs it holds.
//! [`merge_archive_indices`] downloads and parses those files in parallel
//! and folds them into one [`MergedIndex`], which then answers where each
//! blob can be fetched from. Game archives and patch archives are merged
//! separately, each under its own [`PathKind`].
//!
//! A key listed by several archives resolves to the archive that comes
//! first in the caller's list, whatever order the downloads finish in.

use bytes::Bytes;
use cascette_crypto::{ContentKey, CryptoError, Decryptor};
use cascette_formats::archive::constants::FOOTER_SIZE;
use cascette_formats::archive::{
    ArchiveIndex, IndexEntry, OffsetFlavor, looks_encrypted, write_group_index,
};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};

use crate::fetch::{ContentSource, FetchRequest, PathKind, RetryPolicy};
use crate::{ContainerError, Result};

/// Outcome of a merge run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Archive indices parsed and merged
    pub loaded: usize,
    /// Archive indices skipped, with the reason
    pub skipped: Vec<(ContentKey, String)>,
    /// Distinct keys in the merged map
    pub entries: usize,
    /// Records whose key was already present
    pub duplicates: usize,
    /// The map came from a saved group index instead of a download
    pub reused_group: bool,
}

/// Key to location map built from many archive indices
#[derive(Debug, Default)]
pub struct MergedIndex {
    kind: PathKind,
    archives: Vec<ContentKey>,
    entries: DashMap<ContentKey, IndexEntry>,
}

impl MergedIndex {
    /// Empty map over `archives` in `kind`; an entry's `archive_index`
    /// points into `archives`
    pub fn new(archives: Vec<ContentKey>, kind: PathKind) -> Self {
        Self {
            kind,
            archives,
            entries: DashMap::new(),
        }
    }

    /// Rebuild a map from a saved group index.
    ///
    /// The index must have the group flavor of `kind`, and every record
    /// must name an archive inside `archives`.
    pub fn from_group_index(
        data: &[u8],
        archives: Vec<ContentKey>,
        kind: PathKind,
    ) -> Result<Self> {
        let index = ArchiveIndex::parse(data)?;
        if index.flavor != kind.group_flavor() {
            return Err(ContainerError::UnexpectedFlavor {
                object: format!("{kind} group index"),
                flavor: index.flavor as u8,
            });
        }

        let merged = Self::new(archives, kind);
        for record in index.records {
            let position = usize::from(record.entry.archive_index);
            if position >= merged.archives.len() {
                return Err(ContainerError::InvalidGroupIndex(format!(
                    "record {} names archive {position} of {}",
                    record.key,
                    merged.archives.len()
                )));
            }
            merged.insert(record.key, record.entry);
        }
        Ok(merged)
    }

    /// Read a group index file written by [`Self::write_group_index`]
    pub async fn load_group_index(
        path: &Path,
        archives: Vec<ContentKey>,
        kind: PathKind,
    ) -> Result<Self> {
        let data = tokio::fs::read(path).await?;
        let merged = Self::from_group_index(&data, archives, kind)?;
        info!(
            "Loaded group index {} with {} entries",
            path.display(),
            merged.len()
        );
        Ok(merged)
    }

    /// Insert a record, keeping the lowest archive index on conflict.
    ///
    /// Returns false when the key was already present.
    pub fn insert(&self, key: ContentKey, entry: IndexEntry) -> bool {
        match self.entries.entry(key) {
            Entry::Occupied(mut existing) => {
                if entry.archive_index < existing.get().archive_index {
                    existing.insert(entry);
                }
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        }
    }

    /// Location of a key
    pub fn get(&self, key: &ContentKey) -> Option<IndexEntry> {
        self.entries.get(key).map(|entry| *entry.value())
    }

    /// Remote archive holding the key.
    ///
    /// An entry's `archive_index` is its position in the archive list this
    /// map was built over. Plain archive indices get that position from
    /// [`merge_archive_indices`]; group indices carry it themselves and
    /// must be loaded through [`Self::from_group_index`] with the same list
    /// the group was built from.
    pub fn archive_for(&self, key: &ContentKey) -> Option<ContentKey> {
        let entry = self.get(key)?;
        self.archives.get(usize::from(entry.archive_index)).copied()
    }

    /// Archive keys in merge order
    pub fn archives(&self) -> &[ContentKey] {
        &self.archives
    }

    /// CDN tree the archives live under
    pub const fn kind(&self) -> PathKind {
        self.kind
    }

    /// Number of distinct keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no keys are present
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// How to fetch a blob: a range of its archive when known, loose otherwise
    pub fn request_for(&self, key: &ContentKey) -> FetchRequest {
        match (self.get(key), self.archive_for(key)) {
            (Some(entry), Some(archive)) => FetchRequest::ArchiveRange {
                archive,
                kind: self.kind,
                offset: entry.offset,
                size: entry.size,
            },
            _ => FetchRequest::Loose {
                key: *key,
                kind: self.kind,
            },
        }
    }

    /// Serialize the map as a group index of this tree's flavor
    pub fn to_group_index(&self) -> Result<Vec<u8>> {
        let entries: Vec<(ContentKey, IndexEntry)> = self
            .entries
            .iter()
            .map(|item| (*item.key(), *item.value()))
            .collect();
        Ok(write_group_index(entries, self.kind.group_flavor())?)
    }

    /// Write the group index to `dir`, named by the MD5 of its footer
    pub async fn write_group_index(&self, dir: &Path) -> Result<PathBuf> {
        let data = self.to_group_index()?;
        let footer_start = data.len().saturating_sub(FOOTER_SIZE);
        let name = ContentKey::from_data(&data[footer_start..]);

        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{name}.index"));
        tokio::fs::write(&path, &data).await?;

        info!(
            "Wrote {} group index {} with {} entries",
            self.kind,
            path.display(),
            self.len()
        );
        Ok(path)
    }
}

async fn load_archive_index(
    source: &dyn ContentSource,
    policy: &RetryPolicy,
    decryptor: Option<&dyn Decryptor>,
    archive: &ContentKey,
    kind: PathKind,
    position: u16,
) -> Result<ArchiveIndex> {
    let data = policy
        .fetch(source, &FetchRequest::archive_index(*archive, kind))
        .await?;

    // Best effort: a plaintext index can fail this check and still parse
    let data = if looks_encrypted(&data) {
        let Some(decryptor) = decryptor else {
            return Err(CryptoError::Decryption(format!(
                "index {archive} looks encrypted and no key is configured"
            ))
            .into());
        };
        let plain = decryptor.decrypt(archive, &data)?;
        if looks_encrypted(&plain) {
            return Err(CryptoError::Decryption(format!(
                "index {archive} still malformed after decryption"
            ))
            .into());
        }
        Bytes::from(plain)
    } else {
        data
    };

    let index = ArchiveIndex::parse_for_archive(&data, position)?;
    // Group records point into some other archive list
    if matches!(index.flavor, OffsetFlavor::PatchGroup | OffsetFlavor::ArchiveGroup) {
        return Err(ContainerError::UnexpectedFlavor {
            object: format!("{kind} index {archive}"),
            flavor: index.flavor as u8,
        });
    }
    Ok(index)
}

/// Download and merge the indices of `archives` under `kind`.
///
/// Failed downloads, unparsable indices and group indices are skipped and
/// listed in the report; the run only fails when the archive list itself
/// is unusable.
pub async fn merge_archive_indices(
    source: &dyn ContentSource,
    archives: &[ContentKey],
    kind: PathKind,
    decryptor: Option<&dyn Decryptor>,
    policy: &RetryPolicy,
    concurrency: usize,
) -> Result<(MergedIndex, MergeReport)> {
    let limit = usize::from(kind.group_flavor().max_archive_index()) + 1;
    if archives.len() > limit {
        return Err(ContainerError::Config(format!(
            "{} {kind} archives exceed the {limit} a group index can address",
            archives.len()
        )));
    }

    let merged = MergedIndex::new(archives.to_vec(), kind);
    let duplicates = AtomicUsize::new(0);

    let outcomes: Vec<(ContentKey, Result<usize>)> = stream::iter(archives.iter().enumerate())
        .map(|(position, archive)| {
            let merged = &merged;
            let duplicates = &duplicates;
            async move {
                let result = load_archive_index(
                    source,
                    policy,
                    decryptor,
                    archive,
                    kind,
                    position as u16,
                )
                .await
                .map(|index| {
                    let count = index.records.len();
                    for record in index.records {
                        if !merged.insert(record.key, record.entry) {
                            duplicates.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    debug!("Merged {count} records from index {archive}");
                    count
                });
                (*archive, result)
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut report = MergeReport::default();
    for (archive, outcome) in outcomes {
        match outcome {
            Ok(_) => report.loaded += 1,
            Err(e) => {
                warn!("Skipping archive index {archive}: {e}");
                report.skipped.push((archive, e.to_string()));
            }
        }
    }
    report.entries = merged.len();
    report.duplicates = duplicates.into_inner();

    info!(
        "Merged {} of {} {kind} archive indices: {} keys, {} duplicates",
        report.loaded,
        archives.len(),
        report.entries,
        report.duplicates
    );
    Ok((merged, report))
}
