//! Repository configuration: which backend a repository lives on and how to reach it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tidepool_io::StorageResult;
use tracing::info;

use crate::cifs::CifsStorage;
use crate::driver::{StorageDriver, MODE_FILE_DEFAULT, MODE_PATH_DEFAULT};
use crate::gcs::{GcsConfig, GcsStorage};
use crate::posix::PosixStorage;
use crate::s3::{S3Config, S3Storage};
use crate::sftp::{SftpConfig, SftpStorage};
use crate::storage::{Storage, StorageOptions};

/// Storage backend of a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Local filesystem.
    #[default]
    Posix,
    /// CIFS mount.
    Cifs,
    /// S3 compatible object store.
    S3(S3Config),
    /// Google Cloud Storage.
    Gcs(GcsConfig),
    /// SFTP over ssh.
    Sftp(SftpConfig),
}

impl BackendConfig {
    /// Driver name of the backend.
    pub fn kind(&self) -> &'static str {
        match self {
            BackendConfig::Posix => "posix",
            BackendConfig::Cifs => "cifs",
            BackendConfig::S3(_) => "s3",
            BackendConfig::Gcs(_) => "gcs",
            BackendConfig::Sftp(_) => "sftp",
        }
    }

    async fn driver(&self) -> StorageResult<Arc<dyn StorageDriver>> {
        Ok(match self {
            BackendConfig::Posix => Arc::new(PosixStorage::new()),
            BackendConfig::Cifs => Arc::new(CifsStorage::new()),
            BackendConfig::S3(config) => Arc::new(S3Storage::new(config)?),
            BackendConfig::Gcs(config) => Arc::new(GcsStorage::new(config)?),
            BackendConfig::Sftp(config) => Arc::new(SftpStorage::connect(config).await?),
        })
    }
}

/// A repository: its base path, defaults for new files and paths, and its backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    /// Base path of the repository on the backend.
    pub path: String,
    /// Mode for new files.
    pub mode_file: u32,
    /// Mode for new paths.
    pub mode_path: u32,
    /// Allow writes.
    pub write: bool,
    /// Reject absolute paths outside `path`.
    pub path_enforce: bool,
    /// Backend holding the repository.
    pub backend: BackendConfig,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            mode_file: MODE_FILE_DEFAULT,
            mode_path: MODE_PATH_DEFAULT,
            write: false,
            path_enforce: true,
            backend: BackendConfig::Posix,
        }
    }
}

impl RepoConfig {
    /// Facade settings of the repository.
    pub fn storage_options(&self) -> StorageOptions {
        StorageOptions {
            path: self.path.clone(),
            mode_file: self.mode_file,
            mode_path: self.mode_path,
            write: self.write,
            path_enforce: self.path_enforce,
        }
    }

    /// Connect to the backend and build the storage facade.
    pub async fn build(&self) -> StorageResult<Storage> {
        let driver = self.backend.driver().await?;
        info!(
            backend = self.backend.kind(),
            path = %self.path,
            write = self.write,
            "repository storage ready"
        );
        Storage::new(driver, self.storage_options())
    }
}
