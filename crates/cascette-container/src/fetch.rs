//! Remote content retrieval
//!
//! The container pipeline never talks to a network itself. It asks a
//! [`ContentSource`] for named CDN objects and wraps each request in a
//! [`RetryPolicy`]. Two sources ship with the crate: [`MirrorSource`] reads
//! a CDN directory mirror from disk and [`MemorySource`] serves blobs held
//! in memory.

use async_trait::async_trait;
use bytes::Bytes;
use cascette_crypto::ContentKey;
use cascette_formats::archive::OffsetFlavor;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Errors reported by a content source
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// The object does not exist on the source
    #[error("Not found: {0}")]
    NotFound(String),

    /// The source failed to deliver the object
    #[error("Transport error: {0}")]
    Transport(String),

    /// A single attempt ran past the policy timeout
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

impl FetchError {
    /// Whether another attempt may succeed
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }
}

/// CDN tree an object lives under
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathKind {
    /// Game content under `data/`
    #[default]
    Data,
    /// Patch archives under `patch/`
    Patch,
}

impl PathKind {
    /// Top-level CDN directory
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Patch => "patch",
        }
    }

    /// Offset flavor of the group index built for this tree
    pub const fn group_flavor(self) -> OffsetFlavor {
        match self {
            Self::Data => OffsetFlavor::ArchiveGroup,
            Self::Patch => OffsetFlavor::PatchGroup,
        }
    }
}

impl std::fmt::Display for PathKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A CDN object to retrieve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchRequest {
    /// The `.index` file of a remote archive
    ArchiveIndex {
        /// Archive the index describes
        archive: ContentKey,
        /// Tree holding the archive
        kind: PathKind,
    },
    /// A byte range of a remote archive
    ArchiveRange {
        /// Archive holding the blob
        archive: ContentKey,
        /// Tree holding the archive
        kind: PathKind,
        /// Start of the blob
        offset: u32,
        /// Blob length
        size: u32,
    },
    /// A blob stored on its own
    Loose {
        /// Key of the blob
        key: ContentKey,
        /// Tree holding the blob
        kind: PathKind,
    },
}

impl FetchRequest {
    /// Loose game content blob
    pub const fn loose(key: ContentKey) -> Self {
        Self::Loose {
            key,
            kind: PathKind::Data,
        }
    }

    /// Index of a remote archive in `kind`
    pub const fn archive_index(archive: ContentKey, kind: PathKind) -> Self {
        Self::ArchiveIndex { archive, kind }
    }

    /// Key of the object the request reads from
    pub const fn object_key(&self) -> &ContentKey {
        match self {
            Self::ArchiveIndex { archive, .. } | Self::ArchiveRange { archive, .. } => archive,
            Self::Loose { key, .. } => key,
        }
    }

    /// Tree the object lives under
    pub const fn kind(&self) -> PathKind {
        match self {
            Self::ArchiveIndex { kind, .. }
            | Self::ArchiveRange { kind, .. }
            | Self::Loose { kind, .. } => *kind,
        }
    }

    /// Path relative to a CDN root: `{data,patch}/ab/cd/abcd...[.index]`
    pub fn cdn_path(&self) -> String {
        let hex = self.object_key().to_hex();
        let suffix = if matches!(self, Self::ArchiveIndex { .. }) {
            ".index"
        } else {
            ""
        };
        format!(
            "{}/{}/{}/{hex}{suffix}",
            self.kind(),
            &hex[0..2],
            &hex[2..4]
        )
    }

    /// Byte range within the object, if any
    pub const fn range(&self) -> Option<(u32, u32)> {
        match self {
            Self::ArchiveRange { offset, size, .. } => Some((*offset, *size)),
            _ => None,
        }
    }
}

impl std::fmt::Display for FetchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.range() {
            Some((offset, size)) => write!(f, "{} [{offset}+{size}]", self.cdn_path()),
            None => f.write_str(&self.cdn_path()),
        }
    }
}

/// Retrieval of CDN objects
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Fetch one object or byte range
    async fn fetch(&self, request: &FetchRequest) -> Result<Bytes, FetchError>;
}

/// Retry policy with exponential backoff and a per-attempt timeout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_attempts: u32,

    /// Delay before the first retry
    pub initial_backoff: Duration,

    /// Upper bound for the delay
    pub max_backoff: Duration,

    /// Backoff growth per retry
    pub multiplier: f64,

    /// Limit for a single attempt
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Policy that tries once
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Run `f` until it succeeds, fails permanently, or retries run out
    pub async fn execute<F, Fut, T>(&self, mut f: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut attempt = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let outcome = match tokio::time::timeout(self.timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout(self.timeout)),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() || attempt >= self.max_attempts => return Err(e),
                Err(e) => {
                    attempt += 1;
                    tracing::warn!("Attempt {} failed: {}", attempt, e);
                    tokio::time::sleep(backoff).await;
                    backoff = Duration::from_secs_f64(
                        (backoff.as_secs_f64() * self.multiplier)
                            .min(self.max_backoff.as_secs_f64()),
                    );
                }
            }
        }
    }

    /// Fetch through `source` under this policy
    pub async fn fetch(
        &self,
        source: &dyn ContentSource,
        request: &FetchRequest,
    ) -> Result<Bytes, FetchError> {
        self.execute(|| source.fetch(request)).await
    }
}

/// Reads objects from a local copy of a CDN tree
#[derive(Debug, Clone)]
pub struct MirrorSource {
    root: PathBuf,
}

impl MirrorSource {
    /// Mirror rooted at `root` (the directory holding `data/`)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn map_io(request: &FetchRequest, e: &std::io::Error) -> FetchError {
        match e.kind() {
            ErrorKind::NotFound => FetchError::NotFound(request.to_string()),
            ErrorKind::UnexpectedEof => {
                FetchError::Transport(format!("{request}: object shorter than range"))
            }
            _ => FetchError::Transport(format!("{request}: {e}")),
        }
    }
}

#[async_trait]
impl ContentSource for MirrorSource {
    async fn fetch(&self, request: &FetchRequest) -> Result<Bytes, FetchError> {
        let path = self.root.join(request.cdn_path());

        let Some((offset, size)) = request.range() else {
            let data = tokio::fs::read(&path)
                .await
                .map_err(|e| Self::map_io(request, &e))?;
            return Ok(Bytes::from(data));
        };

        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| Self::map_io(request, &e))?;
        file.seek(std::io::SeekFrom::Start(u64::from(offset)))
            .await
            .map_err(|e| Self::map_io(request, &e))?;
        let mut data = vec![0u8; size as usize];
        file.read_exact(&mut data)
            .await
            .map_err(|e| Self::map_io(request, &e))?;
        Ok(Bytes::from(data))
    }
}

/// Serves objects held in memory, keyed by CDN path
#[derive(Debug, Default)]
pub struct MemorySource {
    objects: DashMap<String, Bytes>,
}

impl MemorySource {
    /// Empty source
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the whole object a request reads from
    pub fn insert(&self, request: &FetchRequest, data: impl Into<Bytes>) {
        self.objects.insert(request.cdn_path(), data.into());
    }

    /// Store a loose blob
    pub fn insert_loose(&self, key: ContentKey, data: impl Into<Bytes>) {
        self.insert(&FetchRequest::loose(key), data);
    }

    /// Store a remote archive's data
    pub fn insert_archive(&self, archive: ContentKey, data: impl Into<Bytes>) {
        self.insert_loose(archive, data);
    }

    /// Store a remote archive's `.index` file
    pub fn insert_archive_index(&self, archive: ContentKey, data: impl Into<Bytes>) {
        self.insert(&FetchRequest::archive_index(archive, PathKind::Data), data);
    }
}

#[async_trait]
impl ContentSource for MemorySource {
    async fn fetch(&self, request: &FetchRequest) -> Result<Bytes, FetchError> {
        let object = self
            .objects
            .get(&request.cdn_path())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| FetchError::NotFound(request.to_string()))?;

        match request.range() {
            None => Ok(object),
            Some((offset, size)) => {
                let start = offset as usize;
                let end = start + size as usize;
                if end > object.len() {
                    return Err(FetchError::Transport(format!(
                        "{request}: object shorter than range"
                    )));
                }
                Ok(object.slice(start..end))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn key() -> ContentKey {
        ContentKey::from_hex("0017a402f556fbece46c38dc431a2c9b").expect("valid hex")
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_cdn_paths() {
        assert_eq!(
            FetchRequest::archive_index(key(), PathKind::Data).cdn_path(),
            "data/00/17/0017a402f556fbece46c38dc431a2c9b.index"
        );
        assert_eq!(
            FetchRequest::loose(key()).cdn_path(),
            "data/00/17/0017a402f556fbece46c38dc431a2c9b"
        );
        let range = FetchRequest::ArchiveRange {
            archive: key(),
            kind: PathKind::Data,
            offset: 10,
            size: 4,
        };
        assert_eq!(range.cdn_path(), FetchRequest::loose(key()).cdn_path());
        assert_eq!(range.range(), Some((10, 4)));
    }

    #[test]
    fn test_patch_paths() {
        assert_eq!(
            FetchRequest::archive_index(key(), PathKind::Patch).cdn_path(),
            "patch/00/17/0017a402f556fbece46c38dc431a2c9b.index"
        );
        let range = FetchRequest::ArchiveRange {
            archive: key(),
            kind: PathKind::Patch,
            offset: 0,
            size: 1,
        };
        assert_eq!(range.cdn_path(), "patch/00/17/0017a402f556fbece46c38dc431a2c9b");
        assert_eq!(PathKind::Data.group_flavor(), OffsetFlavor::ArchiveGroup);
        assert_eq!(PathKind::Patch.group_flavor(), OffsetFlavor::PatchGroup);
        assert_eq!(
            serde_json::from_str::<PathKind>("\"patch\"").expect("kind"),
            PathKind::Patch
        );
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_backoff, Duration::from_millis(100));
        assert_eq!(policy.max_backoff, Duration::from_secs(10));
        assert_eq!(policy.timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_retries_transport_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = fast_policy(3)
            .execute(|| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(FetchError::Transport("reset".to_string()))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = fast_policy(3)
            .execute(|| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(FetchError::NotFound("x".to_string())) }
            })
            .await;
        assert!(matches!(result, Err(FetchError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = fast_policy(2)
            .execute(|| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(FetchError::Transport("down".to_string())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout() {
        let policy = RetryPolicy {
            timeout: Duration::from_millis(50),
            ..fast_policy(0)
        };
        let result: Result<(), _> = policy
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;
        assert_eq!(result, Err(FetchError::Timeout(Duration::from_millis(50))));
    }

    #[tokio::test]
    async fn test_mirror_source() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(FetchRequest::loose(key()).cdn_path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"0123456789").unwrap();

        let source = MirrorSource::new(dir.path());
        let whole = source.fetch(&FetchRequest::loose(key())).await.expect("loose");
        assert_eq!(&whole[..], b"0123456789");

        let range = FetchRequest::ArchiveRange {
            archive: key(),
            kind: PathKind::Data,
            offset: 3,
            size: 4,
        };
        assert_eq!(&source.fetch(&range).await.expect("range")[..], b"3456");

        let past_end = FetchRequest::ArchiveRange {
            archive: key(),
            kind: PathKind::Data,
            offset: 8,
            size: 4,
        };
        assert!(matches!(
            source.fetch(&past_end).await,
            Err(FetchError::Transport(_))
        ));
        assert!(matches!(
            source.fetch(&FetchRequest::archive_index(key(), PathKind::Data)).await,
            Err(FetchError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_source() {
        let source = MemorySource::new();
        source.insert_archive(key(), Bytes::from_static(b"abcdef"));
        source.insert_archive_index(key(), Bytes::from_static(b"idx"));

        let range = FetchRequest::ArchiveRange {
            archive: key(),
            kind: PathKind::Data,
            offset: 2,
            size: 3,
        };
        assert_eq!(&source.fetch(&range).await.unwrap()[..], b"cde");
        assert_eq!(
            &source.fetch(&FetchRequest::archive_index(key(), PathKind::Data)).await.unwrap()[..],
            b"idx"
        );
        assert!(
            source
                .fetch(&FetchRequest::loose(ContentKey::default()))
                .await
                .is_err()
        );
    }
}
