//! CIFS share driver: the Posix driver without path syncs or links.

use async_trait::async_trait;
use tidepool_io::{ReadSource, StorageResult, WriteSink};

use crate::driver::{ReadOptions, StorageDriver, WriteOptions};
use crate::info::{Feature, Features, InfoLevel, StorageInfo};
use crate::posix::PosixStorage;

/// Driver for a mounted CIFS share.
#[derive(Debug, Clone)]
pub struct CifsStorage {
    posix: PosixStorage,
}

impl Default for CifsStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl CifsStorage {
    /// Create the driver.
    pub fn new() -> Self {
        Self {
            posix: PosixStorage::without_path_sync(),
        }
    }
}

#[async_trait]
impl StorageDriver for CifsStorage {
    fn kind(&self) -> &'static str {
        "cifs"
    }

    fn features(&self) -> Features {
        self.posix
            .features()
            .without(Feature::PathSync)
            .without(Feature::Hardlink)
            .without(Feature::Symlink)
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        self.posix.exists(path).await
    }

    async fn path_exists(&self, path: &str) -> StorageResult<bool> {
        self.posix.path_exists(path).await
    }

    async fn info(
        &self,
        path: &str,
        level: InfoLevel,
        follow_link: bool,
    ) -> StorageResult<StorageInfo> {
        self.posix.info(path, level, follow_link).await
    }

    async fn list(&self, path: &str, level: InfoLevel) -> StorageResult<Option<Vec<StorageInfo>>> {
        self.posix.list(path, level).await
    }

    fn new_read(&self, path: &str, options: &ReadOptions) -> StorageResult<Box<dyn ReadSource>> {
        self.posix.new_read(path, options)
    }

    fn new_write(&self, path: &str, options: &WriteOptions) -> StorageResult<Box<dyn WriteSink>> {
        self.posix.new_write(path, &self.write_options(options.clone()))
    }

    fn write_options(&self, mut options: WriteOptions) -> WriteOptions {
        options.sync_path = false;
        options
    }

    async fn move_file(
        &self,
        source: &str,
        destination: &str,
        options: &WriteOptions,
    ) -> StorageResult<bool> {
        self.posix
            .move_file(source, destination, &self.write_options(options.clone()))
            .await
    }

    async fn path_create(
        &self,
        path: &str,
        error_on_exists: bool,
        no_parent_create: bool,
        mode: u32,
    ) -> StorageResult<()> {
        self.posix
            .path_create(path, error_on_exists, no_parent_create, mode)
            .await
    }

    async fn path_remove(&self, path: &str, recurse: bool) -> StorageResult<bool> {
        self.posix.path_remove(path, recurse).await
    }

    async fn path_sync(&self, _path: &str) -> StorageResult<()> {
        Ok(())
    }

    async fn remove(&self, path: &str, error_on_missing: bool) -> StorageResult<()> {
        self.posix.remove(path, error_on_missing).await
    }
}
