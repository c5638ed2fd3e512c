//! Container reconstruction pipeline

use bytes::Bytes;
use cascette_crypto::{ArmadilloCrypt, ContentKey, Decryptor, KeyStore};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ContainerConfig;
use crate::fetch::{ContentSource, FetchRequest, PathKind};
use crate::index::LocalIndexSet;
use crate::merge::{MergeReport, MergedIndex, merge_archive_indices};
use crate::storage::ArchiveWriter;
use crate::{ContainerError, INDICES_DIR, Result};

/// Outcome of [`Reconstructor::install`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconstructionReport {
    /// Blobs written to data files
    pub written: usize,
    /// Blobs that could not be fetched or stored, with the reason
    pub skipped: Vec<(ContentKey, String)>,
    /// Data files produced
    pub archives: Vec<PathBuf>,
    /// Bucket index files produced
    pub index_files: Vec<PathBuf>,
}

/// Merged map and merge report for one CDN tree
#[derive(Debug, Default)]
struct ArchiveSet {
    merged: MergedIndex,
    report: Option<MergeReport>,
}

/// Rebuilds a local container from a content source
pub struct Reconstructor {
    config: ContainerConfig,
    source: Arc<dyn ContentSource>,
    decryptor: Option<Arc<dyn Decryptor>>,
    data: ArchiveSet,
    patch: ArchiveSet,
}

impl std::fmt::Debug for Reconstructor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconstructor")
            .field("config", &self.config)
            .field("decryptor", &self.decryptor.is_some())
            .field("merged", &self.data.merged.len())
            .field("patch_merged", &self.patch.merged.len())
            .finish_non_exhaustive()
    }
}

impl Reconstructor {
    /// Create a reconstructor reading from `source`
    pub fn new(config: ContainerConfig, source: Arc<dyn ContentSource>) -> Self {
        Self {
            config,
            source,
            decryptor: None,
            data: ArchiveSet::default(),
            patch: ArchiveSet {
                merged: MergedIndex::new(Vec::new(), PathKind::Patch),
                report: None,
            },
        }
    }

    /// Decrypt protected indices and content with a custom decryptor
    #[must_use]
    pub fn with_decryptor(mut self, decryptor: Arc<dyn Decryptor>) -> Self {
        self.decryptor = Some(decryptor);
        self
    }

    /// Decrypt protected indices and content with the configured Armadillo key
    pub fn with_key_store(self, store: &KeyStore) -> Result<Self> {
        let name = self.config.armadillo_key.as_deref().ok_or_else(|| {
            ContainerError::Config("armadillo_key is not set".to_string())
        })?;
        let crypt = ArmadilloCrypt::from_store(store, name)?;
        Ok(self.with_decryptor(Arc::new(crypt)))
    }

    /// Configuration in use
    pub const fn config(&self) -> &ContainerConfig {
        &self.config
    }

    /// Game archive map built by [`Self::load_archive_indices`]
    pub const fn merged(&self) -> &MergedIndex {
        &self.data.merged
    }

    /// Patch archive map built by [`Self::load_patch_archive_indices`]
    pub const fn patch_merged(&self) -> &MergedIndex {
        &self.patch.merged
    }

    /// Report of the last game archive merge
    pub const fn merge_report(&self) -> Option<&MergeReport> {
        self.data.report.as_ref()
    }

    /// Report of the last patch archive merge
    pub const fn patch_merge_report(&self) -> Option<&MergeReport> {
        self.patch.report.as_ref()
    }

    /// Directory group indices are kept in, next to the data directory
    pub fn indices_dir(&self) -> PathBuf {
        self.config
            .data_dir
            .parent()
            .unwrap_or(self.config.data_dir.as_path())
            .join(INDICES_DIR)
    }

    fn set_mut(&mut self, kind: PathKind) -> &mut ArchiveSet {
        match kind {
            PathKind::Data => &mut self.data,
            PathKind::Patch => &mut self.patch,
        }
    }

    fn set(&self, kind: PathKind) -> &ArchiveSet {
        match kind {
            PathKind::Data => &self.data,
            PathKind::Patch => &self.patch,
        }
    }

    fn store(&mut self, merged: MergedIndex, report: MergeReport) -> &MergeReport {
        let set = self.set_mut(merged.kind());
        set.merged = merged;
        set.report.insert(report)
    }

    async fn merge(
        &self,
        kind: PathKind,
        archives: &[ContentKey],
    ) -> Result<(MergedIndex, MergeReport)> {
        merge_archive_indices(
            self.source.as_ref(),
            archives,
            kind,
            self.decryptor.as_deref(),
            &self.config.retry,
            self.config.merge_concurrency,
        )
        .await
    }

    /// Download and merge the indices of the given game archives
    pub async fn load_archive_indices(&mut self, archives: &[ContentKey]) -> Result<&MergeReport> {
        let (merged, report) = self.merge(PathKind::Data, archives).await?;
        Ok(self.store(merged, report))
    }

    /// Download and merge the indices of the given patch archives
    pub async fn load_patch_archive_indices(
        &mut self,
        archives: &[ContentKey],
    ) -> Result<&MergeReport> {
        let (merged, report) = self.merge(PathKind::Patch, archives).await?;
        Ok(self.store(merged, report))
    }

    /// Load the archive map of `kind`, reusing a saved group index.
    ///
    /// When `group` names a file already present in [`Self::indices_dir`]
    /// it is read instead of downloading every archive index. Otherwise,
    /// or when the saved file does not match `archives`, the indices are
    /// merged and the result is saved as a new group index.
    pub async fn load_archive_group(
        &mut self,
        kind: PathKind,
        archives: &[ContentKey],
        group: Option<ContentKey>,
    ) -> Result<&MergeReport> {
        let dir = self.indices_dir();

        if let Some(group) = group {
            let path = dir.join(format!("{group}.index"));
            if tokio::fs::try_exists(&path).await? {
                match MergedIndex::load_group_index(&path, archives.to_vec(), kind).await {
                    Ok(merged) => {
                        let report = MergeReport {
                            entries: merged.len(),
                            reused_group: true,
                            ..MergeReport::default()
                        };
                        return Ok(self.store(merged, report));
                    }
                    Err(e) => warn!("Rebuilding {kind} group index {group}: {e}"),
                }
            }
        }

        let (merged, report) = self.merge(kind, archives).await?;
        merged.write_group_index(&dir).await?;
        Ok(self.store(merged, report))
    }

    /// Fetch one blob and decrypt it when a decryptor is set.
    ///
    /// The keystream restarts at every fetched object or range, with the
    /// nonce taken from the key of the object the bytes were read from.
    async fn fetch_content(&self, request: &FetchRequest) -> Result<Bytes> {
        let data = self.config.retry.fetch(self.source.as_ref(), request).await?;
        match &self.decryptor {
            Some(decryptor) => Ok(Bytes::from(
                decryptor.decrypt(request.object_key(), &data)?,
            )),
            None => Ok(data),
        }
    }

    /// Fetch every key, write the data files and the bucket index files.
    ///
    /// A blob that cannot be fetched, decrypted or stored is skipped.
    /// Errors that make the container unusable abort the run.
    pub async fn install(&self, keys: &[ContentKey]) -> Result<ReconstructionReport> {
        self.config.validate()?;

        let indices = Arc::new(LocalIndexSet::new(self.config.container_max_size));
        let mut writer = ArchiveWriter::open(&self.config, indices, self.config.start_archive)?;
        let mut report = ReconstructionReport::default();
        let mut seen = HashSet::with_capacity(keys.len());

        for key in keys {
            if !seen.insert(*key) {
                debug!("Skipping repeated key {key}");
                continue;
            }

            let request = self.data.merged.request_for(key);
            let payload = match self.fetch_content(&request).await {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Skipping {key}: {e}");
                    report.skipped.push((*key, e.to_string()));
                    continue;
                }
            };

            match writer.write(*key, &payload).await {
                Ok(_) => report.written += 1,
                Err(e) if !e.is_fatal() => {
                    warn!("Skipping {key}: {e}");
                    report.skipped.push((*key, e.to_string()));
                }
                Err(e) => return Err(e),
            }
        }

        let finalized = writer.finalize_all().await?;
        report.archives = finalized.archives;
        report.index_files = finalized.index_files;

        info!(
            "Reconstructed {} blobs into {} data files, {} skipped",
            report.written,
            report.archives.len(),
            report.skipped.len()
        );
        Ok(report)
    }

    /// Write the merged map of `kind` as a group index in [`Self::indices_dir`]
    pub async fn write_group_index(&self, kind: PathKind) -> Result<PathBuf> {
        self.set(kind)
            .merged
            .write_group_index(&self.indices_dir())
            .await
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::fetch::{MemorySource, RetryPolicy};
    use cascette_crypto::ArmadilloKey;
    use cascette_formats::archive::{GroupIndexBuilder, IndexEntry, OffsetFlavor};

    fn config(dir: &std::path::Path) -> ContainerConfig {
        ContainerConfig::new(dir.join("data"))
            .with_machine_name("TESTHOST")
            .with_retry(RetryPolicy::no_retry())
    }

    #[tokio::test]
    async fn test_loose_install_and_skip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = Arc::new(MemorySource::new());
        let present = ContentKey::from_data(b"present");
        source.insert_loose(present, &b"present"[..]);
        let missing = ContentKey::from_data(b"missing");

        let reconstructor = Reconstructor::new(config(dir.path()), source);
        let report = reconstructor
            .install(&[present, missing, present])
            .await
            .expect("install");

        assert_eq!(report.written, 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, missing);
        assert_eq!(report.archives.len(), 1);
        assert_eq!(report.index_files.len(), 16);
        assert_eq!(
            std::fs::metadata(&report.archives[0]).unwrap().len(),
            960 + 30 + 7
        );
    }

    #[test]
    fn test_key_store_requires_key_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = KeyStore::new();
        store.insert("sc1Dev", ArmadilloKey::new([1; 16]));

        let without_name = Reconstructor::new(config(dir.path()), Arc::new(MemorySource::new()));
        assert!(matches!(
            without_name.with_key_store(&store),
            Err(ContainerError::Config(_))
        ));

        let unknown = Reconstructor::new(
            config(dir.path()).with_armadillo_key("other"),
            Arc::new(MemorySource::new()),
        );
        assert!(matches!(
            unknown.with_key_store(&store),
            Err(ContainerError::Crypto(_))
        ));

        let named = Reconstructor::new(
            config(dir.path()).with_armadillo_key("sc1Dev"),
            Arc::new(MemorySource::new()),
        );
        assert!(named.with_key_store(&store).is_ok());
    }

    #[tokio::test]
    async fn test_unusable_saved_group_is_rebuilt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive = ContentKey::from_data(b"archive");
        let blob = ContentKey::from_data(b"blob");
        let mut builder = GroupIndexBuilder::new(OffsetFlavor::Archive);
        builder.add(blob, IndexEntry::new(0, 0, 4));
        let source = Arc::new(MemorySource::new());
        source.insert_archive_index(archive, builder.build().expect("index"));

        let mut reconstructor = Reconstructor::new(config(dir.path()), source);
        let group = ContentKey::from_data(b"stale group");
        let stale = reconstructor.indices_dir().join(format!("{group}.index"));
        std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
        std::fs::write(&stale, b"not an index").unwrap();

        let report = reconstructor
            .load_archive_group(PathKind::Data, &[archive], Some(group))
            .await
            .expect("rebuild")
            .clone();
        assert!(!report.reused_group);
        assert_eq!(report.loaded, 1);
        assert_eq!(reconstructor.merged().archive_for(&blob), Some(archive));
        assert_eq!(std::fs::read_dir(reconstructor.indices_dir()).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn test_content_decrypt_uses_object_nonce() {
        let dir = tempfile::tempdir().expect("tempdir");
        let crypt = ArmadilloCrypt::new(ArmadilloKey::new([0x11; 16]));
        let payload = b"loose content".to_vec();
        let key = ContentKey::from_data(&payload);
        let source = Arc::new(MemorySource::new());
        source.insert_loose(key, crypt.decrypt(&key, &payload).expect("encrypt"));

        let reconstructor =
            Reconstructor::new(config(dir.path()), source).with_decryptor(Arc::new(crypt));
        let fetched = reconstructor
            .fetch_content(&FetchRequest::loose(key))
            .await
            .expect("fetch");
        assert_eq!(&fetched[..], &payload[..]);
    }
}
