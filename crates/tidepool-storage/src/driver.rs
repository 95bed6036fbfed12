//! Driver trait implemented once per storage backend.
//!
//! Drivers receive absolute, already resolved paths from the facade. They never see path
//! expressions and never check whether the facade is writable.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tidepool_io::{ReadSource, StorageResult, WriteSink};

use crate::info::{Features, InfoLevel, StorageInfo};

/// Default file mode for new files.
pub const MODE_FILE_DEFAULT: u32 = 0o640;
/// Default mode for new paths.
pub const MODE_PATH_DEFAULT: u32 = 0o750;

/// Options for a read stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadOptions {
    /// Return false from open instead of failing when the file is missing.
    pub ignore_missing: bool,
    /// Byte offset to start reading at.
    pub offset: u64,
    /// Stop after this many bytes.
    pub limit: Option<u64>,
}

impl ReadOptions {
    /// Options with `ignore_missing` set.
    pub fn ignore_missing() -> Self {
        Self {
            ignore_missing: true,
            ..Self::default()
        }
    }
}

/// Options for a write stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteOptions {
    /// File mode; the facade default when unset.
    pub mode_file: Option<u32>,
    /// Mode for paths created on the way; the facade default when unset.
    pub mode_path: Option<u32>,
    /// Owner to set after open.
    pub user: Option<String>,
    /// Group to set after open.
    pub group: Option<String>,
    /// Modification time (epoch seconds) to set on close.
    pub time_modified: Option<i64>,
    /// Create missing parent paths.
    pub create_path: bool,
    /// Flush the file to durable storage on close.
    pub sync_file: bool,
    /// Flush the parent path on close.
    pub sync_path: bool,
    /// Write to a temporary name and rename on close.
    pub atomic: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            mode_file: None,
            mode_path: None,
            user: None,
            group: None,
            time_modified: None,
            create_path: true,
            sync_file: true,
            sync_path: true,
            atomic: true,
        }
    }
}

impl WriteOptions {
    /// File mode, falling back to [`MODE_FILE_DEFAULT`].
    pub fn file_mode(&self) -> u32 {
        self.mode_file.unwrap_or(MODE_FILE_DEFAULT)
    }

    /// Path mode, falling back to [`MODE_PATH_DEFAULT`].
    pub fn path_mode(&self) -> u32 {
        self.mode_path.unwrap_or(MODE_PATH_DEFAULT)
    }
}

/// Primitive operations of one storage backend.
#[async_trait]
pub trait StorageDriver: Send + Sync + std::fmt::Debug {
    /// Short backend name ("posix", "s3", ...).
    fn kind(&self) -> &'static str;

    /// Capabilities of this backend.
    fn features(&self) -> Features;

    /// True only when `path` is an existing file.
    async fn exists(&self, path: &str) -> StorageResult<bool>;

    /// True only when `path` is an existing path.
    async fn path_exists(&self, path: &str) -> StorageResult<bool>;

    /// Info for `path`; `exists` is false when it is missing.
    async fn info(&self, path: &str, level: InfoLevel, follow_link: bool)
        -> StorageResult<StorageInfo>;

    /// Entries directly inside `path`, names relative to it. None when the path is missing.
    async fn list(&self, path: &str, level: InfoLevel) -> StorageResult<Option<Vec<StorageInfo>>>;

    /// Raw source for a read stream. Nothing is touched until the source is opened.
    fn new_read(&self, path: &str, options: &ReadOptions) -> StorageResult<Box<dyn ReadSource>>;

    /// Raw sink for a write stream. Nothing is touched until the sink is opened.
    fn new_write(&self, path: &str, options: &WriteOptions) -> StorageResult<Box<dyn WriteSink>>;

    /// Adjust write options to what the backend actually does.
    fn write_options(&self, options: WriteOptions) -> WriteOptions {
        options
    }

    /// Rename `source` to `destination`. Returns false when the backend cannot, so the caller
    /// copies instead.
    async fn move_file(
        &self,
        source: &str,
        destination: &str,
        options: &WriteOptions,
    ) -> StorageResult<bool>;

    /// Create a path.
    async fn path_create(
        &self,
        path: &str,
        error_on_exists: bool,
        no_parent_create: bool,
        mode: u32,
    ) -> StorageResult<()>;

    /// Remove a path; returns false when it was missing.
    async fn path_remove(&self, path: &str, recurse: bool) -> StorageResult<bool>;

    /// Flush a path to durable storage.
    async fn path_sync(&self, path: &str) -> StorageResult<()>;

    /// Remove a file.
    async fn remove(&self, path: &str, error_on_missing: bool) -> StorageResult<()>;
}

/// Parent of an absolute path; "/" for top-level entries.
pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Join a path and a relative name.
pub fn join_path(path: &str, name: &str) -> String {
    if name.is_empty() {
        path.to_string()
    } else if path.ends_with('/') {
        format!("{}{}", path, name)
    } else {
        format!("{}/{}", path, name)
    }
}

/// Byte budget for reads with a limit.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadLimit {
    remaining: Option<u64>,
}

impl ReadLimit {
    pub(crate) fn new(limit: Option<u64>) -> Self {
        Self { remaining: limit }
    }

    /// How many of `want` bytes may still be read.
    pub(crate) fn allow(&self, want: usize) -> usize {
        match self.remaining {
            Some(remaining) => want.min(usize::try_from(remaining).unwrap_or(usize::MAX)),
            None => want,
        }
    }

    pub(crate) fn consume(&mut self, n: usize) {
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(n as u64);
        }
    }

    pub(crate) fn exhausted(&self) -> bool {
        self.remaining == Some(0)
    }
}
