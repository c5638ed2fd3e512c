//! Configuration for container reconstruction

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::fetch::RetryPolicy;
use crate::storage::BindMode;
use crate::{
    ContainerError, DEFAULT_CONTAINER_MAX_SIZE, DEFAULT_MAX_ARCHIVE_SIZE, MAX_ARCHIVE_OFFSET,
    RECONSTRUCTION_HEADER_SIZE, Result, SEGMENT_REGION_SIZE,
};

/// Configuration for a reconstruction run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Directory receiving `data.NNN` and `.idx` files
    pub data_dir: PathBuf,

    /// Installation path hashed into segment header keys
    pub base_dir: String,

    /// Host name hashed into segment header keys; resolved from the
    /// environment when unset
    pub machine_name: Option<String>,

    /// Selects the error code reported for oversized containers
    pub bind_mode: BindMode,

    /// Container ceiling written to index headers and fed to segment key derivation
    pub container_max_size: u64,

    /// Cap for a single data file
    pub max_archive_size: u64,

    /// Index of the first data file written
    pub start_archive: u16,

    /// Version number embedded in `.idx` file names
    pub index_version: u32,

    /// Number of archive indices downloaded in parallel
    pub merge_concurrency: usize,

    /// Retry behaviour for CDN requests
    pub retry: RetryPolicy,

    /// Armadillo key name used for encrypted archive indices
    pub armadillo_key: Option<String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./Data/data"),
            base_dir: "World of Warcraft".to_string(),
            machine_name: None,
            bind_mode: BindMode::Reconstruction,
            container_max_size: DEFAULT_CONTAINER_MAX_SIZE,
            max_archive_size: DEFAULT_MAX_ARCHIVE_SIZE,
            start_archive: 0,
            index_version: 1,
            merge_concurrency: 16,
            retry: RetryPolicy::default(),
            armadillo_key: None,
        }
    }
}

impl ContainerConfig {
    /// Create a new configuration writing into `data_dir`
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Load a configuration from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| ContainerError::Config(format!("invalid JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Set the installation path hashed into segment keys
    #[must_use]
    pub fn with_base_dir(mut self, base_dir: impl Into<String>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    /// Set the host name hashed into segment keys
    #[must_use]
    pub fn with_machine_name(mut self, name: impl Into<String>) -> Self {
        self.machine_name = Some(name.into());
        self
    }

    /// Set the bind mode
    #[must_use]
    pub const fn with_bind_mode(mut self, mode: BindMode) -> Self {
        self.bind_mode = mode;
        self
    }

    /// Set the data file size cap
    #[must_use]
    pub const fn with_max_archive_size(mut self, size: u64) -> Self {
        self.max_archive_size = size;
        self
    }

    /// Set the container ceiling
    #[must_use]
    pub const fn with_container_max_size(mut self, size: u64) -> Self {
        self.container_max_size = size;
        self
    }

    /// Set the first data file index
    #[must_use]
    pub const fn with_start_archive(mut self, index: u16) -> Self {
        self.start_archive = index;
        self
    }

    /// Set the number of parallel index downloads
    #[must_use]
    pub const fn with_merge_concurrency(mut self, concurrency: usize) -> Self {
        self.merge_concurrency = concurrency;
        self
    }

    /// Set the retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Name the Armadillo key for encrypted archive indices
    #[must_use]
    pub fn with_armadillo_key(mut self, name: impl Into<String>) -> Self {
        self.armadillo_key = Some(name.into());
        self
    }

    /// Host name used for segment keys.
    ///
    /// Falls back to `COMPUTERNAME`, then `HOSTNAME`, then `localhost`.
    /// Empty names at any step count as unset.
    pub fn resolved_machine_name(&self) -> String {
        let non_empty = |name: &String| !name.is_empty();
        self.machine_name
            .clone()
            .filter(non_empty)
            .or_else(|| std::env::var("COMPUTERNAME").ok().filter(non_empty))
            .or_else(|| std::env::var("HOSTNAME").ok().filter(non_empty))
            .unwrap_or_else(|| "localhost".to_string())
    }

    /// Check that the size limits are usable
    pub fn validate(&self) -> Result<()> {
        let smallest = (SEGMENT_REGION_SIZE + RECONSTRUCTION_HEADER_SIZE) as u64;
        if self.max_archive_size <= smallest {
            return Err(ContainerError::Config(format!(
                "max_archive_size {} leaves no room after the {} byte segment region",
                self.max_archive_size, SEGMENT_REGION_SIZE
            )));
        }
        if self.max_archive_size > u64::from(MAX_ARCHIVE_OFFSET) {
            return Err(ContainerError::Config(format!(
                "max_archive_size {} exceeds the 30-bit offset range",
                self.max_archive_size
            )));
        }
        if self.merge_concurrency == 0 {
            return Err(ContainerError::Config(
                "merge_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
