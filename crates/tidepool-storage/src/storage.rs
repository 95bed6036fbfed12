//! Storage facade: path resolution, write protection and composite operations over one driver.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tidepool_io::{StorageError, StorageResult, IO_BUFFER_SIZE_DEFAULT};
use tracing::debug;

use crate::driver::{
    join_path, parent_path, ReadOptions, StorageDriver, WriteOptions, MODE_FILE_DEFAULT, MODE_PATH_DEFAULT,
};
use crate::info::{Feature, Features, InfoLevel, StorageInfo, StorageType};
use crate::read::StorageRead;
use crate::write::StorageWrite;

const EXISTS_RETRY_INTERVAL: Duration = Duration::from_millis(100);

static DRY_RUN: AtomicBool = AtomicBool::new(false);

/// Set the process-wide dry-run flag. Writable storage cannot be created while it is set.
pub fn set_dry_run(dry_run: bool) {
    DRY_RUN.store(dry_run, Ordering::SeqCst);
}

/// Current process-wide dry-run flag.
pub fn dry_run() -> bool {
    DRY_RUN.load(Ordering::SeqCst)
}

/// Expands a `<NAME>` expression and optional sub path to a path. None when the expression is
/// unknown.
pub type PathExpressionFn = Arc<dyn Fn(&str, Option<&str>) -> Option<String> + Send + Sync>;

/// Facade settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    /// Base path every relative path is resolved against.
    pub path: String,
    /// Default mode for new files.
    pub mode_file: u32,
    /// Default mode for new paths.
    pub mode_path: u32,
    /// Allow mutating operations.
    pub write: bool,
    /// Reject absolute paths outside the base path.
    pub path_enforce: bool,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            mode_file: MODE_FILE_DEFAULT,
            mode_path: MODE_PATH_DEFAULT,
            write: false,
            path_enforce: true,
        }
    }
}

/// Order of list results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortOrder {
    /// Driver order.
    #[default]
    None,
    /// Ascending by name.
    Asc,
    /// Descending by name.
    Desc,
}

/// Options for [`Storage::info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InfoOptions {
    /// Amount of detail.
    pub level: InfoLevel,
    /// Return `exists = false` instead of failing when missing.
    pub ignore_missing: bool,
    /// Report on the link destination instead of the link.
    pub follow_link: bool,
}

/// Options for [`Storage::info_list`] and [`Storage::list`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListOptions {
    /// Amount of detail (info lists only).
    pub level: InfoLevel,
    /// Descend into sub paths; names become relative paths.
    pub recurse: bool,
    /// Result order.
    pub sort: SortOrder,
    /// Regular expression entry names must match.
    pub expression: Option<String>,
    /// Fail when the path is missing (only for drivers with real paths).
    pub error_on_missing: bool,
    /// Return None instead of an empty list when the path is missing.
    pub null_on_missing: bool,
}

/// Caller-facing storage over one driver.
#[derive(Clone)]
pub struct Storage {
    driver: Arc<dyn StorageDriver>,
    options: StorageOptions,
    expression: Option<PathExpressionFn>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("driver", &self.driver.kind())
            .field("options", &self.options)
            .field("expression", &self.expression.is_some())
            .finish()
    }
}

fn same_driver(a: &Arc<dyn StorageDriver>, b: &Arc<dyn StorageDriver>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

impl Storage {
    /// Create a facade. Fails when `options.write` is set during a dry run.
    pub fn new(driver: Arc<dyn StorageDriver>, options: StorageOptions) -> StorageResult<Self> {
        Self::build(driver, options, dry_run())
    }

    fn build(
        driver: Arc<dyn StorageDriver>,
        mut options: StorageOptions,
        dry_run: bool,
    ) -> StorageResult<Self> {
        if options.write && dry_run {
            return Err(StorageError::Assert(format!(
                "unable to create writable storage for '{}' during a dry run",
                options.path
            )));
        }
        if options.path.len() > 1 && options.path.ends_with('/') {
            options.path.pop();
        }
        if !options.path.starts_with('/') {
            return Err(StorageError::Assert(format!(
                "storage base path '{}' must be absolute",
                options.path
            )));
        }
        debug!(driver = driver.kind(), path = %options.path, write = options.write, "storage created");
        Ok(Self {
            driver,
            options,
            expression: None,
        })
    }

    /// Register the resolver for `<NAME>` path expressions.
    pub fn with_path_expression(mut self, expression: PathExpressionFn) -> Self {
        self.expression = Some(expression);
        self
    }

    /// Base path.
    pub fn path_base(&self) -> &str {
        &self.options.path
    }

    /// Facade settings.
    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    /// Active driver.
    pub fn driver(&self) -> &Arc<dyn StorageDriver> {
        &self.driver
    }

    /// True when mutating operations are allowed.
    pub fn writable(&self) -> bool {
        self.options.write
    }

    /// Driver capabilities.
    pub fn features(&self) -> Features {
        self.driver.features()
    }

    /// True when the driver has `feature`.
    pub fn feature(&self, feature: Feature) -> bool {
        self.driver.features().has(feature)
    }

    /// Resolve a path or `<NAME>` expression to an absolute path inside the base path.
    pub fn path(&self, expression: &str) -> StorageResult<String> {
        self.resolve(expression, self.options.path_enforce)
    }

    /// Resolve like [`Storage::path`] but accept absolute paths outside the base path.
    pub fn path_unenforced(&self, expression: &str) -> StorageResult<String> {
        self.resolve(expression, false)
    }

    fn check_base(&self, path: &str, enforce: bool) -> StorageResult<()> {
        let base = self.options.path.as_str();
        if enforce
            && base != "/"
            && path != base
            && !(path.starts_with(base) && path.as_bytes().get(base.len()) == Some(&b'/'))
        {
            return Err(StorageError::Assert(format!(
                "absolute path '{}' is not in base path '{}'",
                path, base
            )));
        }
        Ok(())
    }

    fn join_base(&self, relative: &str) -> String {
        if self.options.path == "/" {
            format!("/{}", relative)
        } else {
            format!("{}/{}", self.options.path, relative)
        }
    }

    fn resolve(&self, expression: &str, enforce: bool) -> StorageResult<String> {
        if expression.is_empty() {
            return Ok(self.options.path.clone());
        }
        if expression.starts_with('/') {
            self.check_base(expression, enforce)?;
            return Ok(expression.to_string());
        }

        let mut relative = expression.to_string();
        if expression.starts_with('<') {
            let Some(resolver) = self.expression.as_ref() else {
                return Err(StorageError::Assert(format!(
                    "expression '{}' not valid without callback function",
                    expression
                )));
            };
            let Some(end) = expression.find('>') else {
                return Err(StorageError::Assert(format!(
                    "end > not found in path expression '{}'",
                    expression
                )));
            };
            let token = &expression[..=end];
            let sub_path = match &expression[end + 1..] {
                "" => None,
                rest => match rest.strip_prefix('/') {
                    Some(sub) => Some(sub),
                    None => {
                        return Err(StorageError::Assert(format!(
                            "'/' should separate expression and path '{}'",
                            expression
                        )));
                    }
                },
            };
            relative = match resolver(token, sub_path) {
                Some(path) if !path.is_empty() => path,
                _ => {
                    return Err(StorageError::Assert(format!(
                        "evaluated path '{}' cannot be null",
                        expression
                    )));
                }
            };
            if relative.starts_with('/') {
                self.check_base(&relative, enforce)?;
                return Ok(relative);
            }
        }

        if relative.ends_with('/') {
            return Err(StorageError::Assert(format!(
                "path '{}' should not end in '/'",
                relative
            )));
        }
        Ok(self.join_base(&relative))
    }

    pub(crate) fn check_write(&self, operation: &str) -> StorageResult<()> {
        if !self.options.write {
            return Err(StorageError::Assert(format!(
                "unable to {} on read-only storage '{}'",
                operation, self.options.path
            )));
        }
        Ok(())
    }

    /// True when `path` is an existing file. With a timeout, keeps checking until the file
    /// appears or the timeout elapses.
    pub async fn exists(&self, path: &str, timeout: Option<Duration>) -> StorageResult<bool> {
        let path = self.path(path)?;
        let deadline = tokio::time::Instant::now() + timeout.unwrap_or_default();
        loop {
            if self.driver.exists(&path).await? {
                return Ok(true);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(EXISTS_RETRY_INTERVAL.min(deadline - now)).await;
        }
    }

    /// True when `path` is an existing path.
    pub async fn path_exists(&self, path: &str) -> StorageResult<bool> {
        let path = self.path(path)?;
        self.driver.path_exists(&path).await
    }

    /// Info for a file, path or link.
    pub async fn info(&self, path: &str, options: InfoOptions) -> StorageResult<StorageInfo> {
        let path = self.path(path)?;
        let info = self
            .driver
            .info(&path, options.level, options.follow_link)
            .await?;
        if !info.exists && !options.ignore_missing {
            return Err(StorageError::MissingTarget(format!(
                "unable to get info for missing path/file '{}'",
                path
            )));
        }
        Ok(info)
    }

    /// Info for the entries of a path, names relative to it.
    pub async fn info_list(
        &self,
        path: &str,
        options: &ListOptions,
    ) -> StorageResult<Option<Vec<StorageInfo>>> {
        let root = self.path(path)?;
        let filter = match options.expression.as_deref() {
            Some(expression) => Some(Regex::new(expression).map_err(|e| {
                StorageError::Assert(format!("invalid expression '{}': {}", expression, e))
            })?),
            None => None,
        };
        let level = if options.recurse {
            options.level.max(InfoLevel::Type)
        } else {
            options.level
        };

        let Some(top) = self.driver.list(&root, level).await? else {
            if options.error_on_missing && self.feature(Feature::Path) {
                return Err(StorageError::MissingTarget(format!(
                    "unable to list file info for missing path '{}'",
                    root
                )));
            }
            return Ok(if options.null_on_missing {
                None
            } else {
                Some(Vec::new())
            });
        };

        let mut result = Vec::new();
        let mut stack: Vec<(String, std::vec::IntoIter<StorageInfo>)> =
            vec![(String::new(), top.into_iter())];
        loop {
            let next = match stack.last_mut() {
                None => break,
                Some((prefix, entries)) => entries.next().map(|info| (prefix.clone(), info)),
            };
            let Some((prefix, mut info)) = next else {
                stack.pop();
                continue;
            };
            if !prefix.is_empty() {
                info.name = format!("{}/{}", prefix, info.name);
            }
            if options.recurse && info.kind == StorageType::Path {
                let child = join_path(&root, &info.name);
                if let Some(entries) = self.driver.list(&child, level).await? {
                    stack.push((info.name.clone(), entries.into_iter()));
                }
            }
            if filter.as_ref().map_or(true, |re| re.is_match(&info.name)) {
                result.push(info);
            }
        }

        match options.sort {
            SortOrder::None => {}
            SortOrder::Asc => result.sort_by(|a, b| a.name.cmp(&b.name)),
            SortOrder::Desc => result.sort_by(|a, b| b.name.cmp(&a.name)),
        }
        Ok(Some(result))
    }

    /// Names of the entries of a path.
    pub async fn list(&self, path: &str, options: &ListOptions) -> StorageResult<Option<Vec<String>>> {
        let options = ListOptions {
            level: if options.recurse {
                InfoLevel::Type
            } else {
                InfoLevel::Exists
            },
            ..options.clone()
        };
        Ok(self
            .info_list(path, &options)
            .await?
            .map(|list| list.into_iter().map(|info| info.name).collect()))
    }

    /// Create a read stream.
    pub fn new_read(&self, path: &str, options: ReadOptions) -> StorageResult<StorageRead> {
        let path = self.path(path)?;
        StorageRead::new(self.driver.clone(), path, options)
    }

    /// Create a write stream. Unset modes take the facade defaults.
    pub fn new_write(&self, path: &str, mut options: WriteOptions) -> StorageResult<StorageWrite> {
        self.check_write("write")?;
        let path = self.path(path)?;
        options.mode_file.get_or_insert(self.options.mode_file);
        options.mode_path.get_or_insert(self.options.mode_path);
        let options = self.driver.write_options(options);
        StorageWrite::new(self.driver.clone(), path, options)
    }

    /// Read a whole file, or exactly `exact_size` bytes of it. None when the file is missing and
    /// the read ignores missing files.
    pub async fn get(
        &self,
        mut read: StorageRead,
        exact_size: Option<usize>,
    ) -> StorageResult<Option<Vec<u8>>> {
        if !read.open().await? {
            return Ok(None);
        }
        let data = match exact_size {
            None => read.read_all().await?,
            Some(size) => {
                let mut buf = vec![0u8; size];
                let n = read.read(&mut buf).await?;
                let mut extra = [0u8; 1];
                let more = if n == size { read.read(&mut extra).await? } else { 0 };
                if n != size || more != 0 {
                    return Err(StorageError::ReadFailed(format!(
                        "unable to read {} byte(s) from '{}'",
                        size,
                        read.name()
                    )));
                }
                buf
            }
        };
        read.close().await?;
        Ok(Some(data))
    }

    /// Write `data` as the whole content of a file.
    pub async fn put(&self, mut write: StorageWrite, data: &[u8]) -> StorageResult<()> {
        write.open().await?;
        write.write(data).await?;
        write.close().await
    }

    /// Stream a file into another. Returns false when the source is missing and its read
    /// ignores missing files.
    pub async fn copy(&self, read: &mut StorageRead, write: &mut StorageWrite) -> StorageResult<bool> {
        if !read.open().await? {
            return Ok(false);
        }
        write.open().await?;
        let mut buf = vec![0u8; IO_BUFFER_SIZE_DEFAULT];
        loop {
            let n = read.read(&mut buf).await?;
            if n > 0 {
                write.write(&buf[..n]).await?;
            }
            if n < buf.len() || read.eof() {
                break;
            }
        }
        read.close().await?;
        write.close().await?;
        Ok(true)
    }

    /// Move a file: a driver rename when possible, otherwise copy, remove the source and sync
    /// its path.
    pub async fn move_file(&self, mut read: StorageRead, mut write: StorageWrite) -> StorageResult<()> {
        self.check_write("move")?;
        if same_driver(read.driver(), write.driver())
            && write
                .driver()
                .move_file(read.name(), write.name(), write.options())
                .await?
        {
            return Ok(());
        }

        debug!(source = %read.name(), destination = %write.name(), "move by copy");
        if !self.copy(&mut read, &mut write).await? {
            return Err(StorageError::MissingTarget(format!(
                "unable to move missing file '{}'",
                read.name()
            )));
        }
        let source_driver = read.driver().clone();
        source_driver.remove(read.name(), true).await?;
        if write.options().sync_path {
            source_driver.path_sync(parent_path(read.name())).await?;
        }
        Ok(())
    }

    /// Create a path. An unset mode takes the facade default.
    pub async fn path_create(
        &self,
        path: &str,
        error_on_exists: bool,
        no_parent_create: bool,
        mode: Option<u32>,
    ) -> StorageResult<()> {
        self.check_write("create path")?;
        let path = self.path(path)?;
        self.driver
            .path_create(
                &path,
                error_on_exists,
                no_parent_create,
                mode.unwrap_or(self.options.mode_path),
            )
            .await
    }

    /// Remove a path.
    pub async fn path_remove(
        &self,
        path: &str,
        error_on_missing: bool,
        recurse: bool,
    ) -> StorageResult<()> {
        self.check_write("remove path")?;
        let path = self.path(path)?;
        if !self.driver.path_remove(&path, recurse).await? && error_on_missing {
            return Err(StorageError::MissingTarget(format!(
                "unable to remove missing path '{}'",
                path
            )));
        }
        Ok(())
    }

    /// Flush a path to durable storage.
    pub async fn path_sync(&self, path: &str) -> StorageResult<()> {
        self.check_write("sync path")?;
        let path = self.path(path)?;
        self.driver.path_sync(&path).await
    }

    /// Remove a file.
    pub async fn remove(&self, path: &str, error_on_missing: bool) -> StorageResult<()> {
        self.check_write("remove")?;
        let path = self.path(path)?;
        self.driver.remove(&path, error_on_missing).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::posix::PosixStorage;
    use proptest::prelude::*;

    fn storage_at(base: &str, write: bool) -> Storage {
        Storage::build(
            Arc::new(PosixStorage::new()),
            StorageOptions {
                path: base.to_string(),
                write,
                ..StorageOptions::default()
            },
            false,
        )
        .unwrap()
    }

    fn temp_storage() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_at(&dir.path().to_string_lossy(), true);
        (dir, storage)
    }

    fn assert_message(result: StorageResult<String>, message: &str) {
        assert_eq!(result.unwrap_err(), StorageError::Assert(message.to_string()));
    }

    fn resolver() -> PathExpressionFn {
        Arc::new(|token: &str, sub: Option<&str>| match token {
            "<REPO>" => Some(match sub {
                Some(sub) => format!("repo/{}", sub),
                None => "repo".to_string(),
            }),
            "<ABS>" => Some("/elsewhere".to_string()),
            _ => None,
        })
    }

    #[test]
    fn test_path_absolute_and_relative() {
        let storage = storage_at("/var/lib/db", false);
        assert_eq!(storage.path("").unwrap(), "/var/lib/db");
        assert_eq!(storage.path("/var/lib/db").unwrap(), "/var/lib/db");
        assert_eq!(storage.path("/var/lib/db/x").unwrap(), "/var/lib/db/x");
        assert_eq!(storage.path("a/b").unwrap(), "/var/lib/db/a/b");
        assert_message(
            storage.path("/var/lib/dbx"),
            "absolute path '/var/lib/dbx' is not in base path '/var/lib/db'",
        );
        assert_eq!(storage.path_unenforced("/tmp/x").unwrap(), "/tmp/x");
        assert_message(storage.path("a/"), "path 'a/' should not end in '/'");
    }

    proptest! {
        #[test]
        fn prop_relative_path_resolves_under_base(
            base in "(/[a-z]{1,8}){1,3}",
            segments in prop::collection::vec("[a-z0-9_.-]{1,10}", 1..5),
        ) {
            let storage = storage_at(&base, false);
            let relative = segments.join("/");
            let resolved = storage.path(&relative).unwrap();
            prop_assert_eq!(&resolved, &format!("{}/{}", base, relative));
            // a resolved path resolves to itself
            prop_assert_eq!(storage.path(&resolved).unwrap(), resolved);
        }

        #[test]
        fn prop_absolute_path_outside_base_rejected(
            base in "(/[a-z]{1,8}){1,3}",
            suffix in "[a-z0-9]{1,8}",
            rest in "(/[a-z]{1,8}){0,2}",
        ) {
            let storage = storage_at(&base, false);
            // shares the base as a string prefix but not as a path component
            let outside = format!("{}{}{}", base, suffix, rest);
            prop_assert!(matches!(storage.path(&outside), Err(StorageError::Assert(_))));
            prop_assert_eq!(storage.path_unenforced(&outside).unwrap(), outside);
        }
    }

    #[test]
    fn test_path_root_base() {
        let storage = storage_at("/", false);
        assert_eq!(storage.path("x").unwrap(), "/x");
        assert_eq!(storage.path("/any/where").unwrap(), "/any/where");
    }

    #[test]
    fn test_path_expression() {
        let storage = storage_at("/base", false).with_path_expression(resolver());
        assert_eq!(storage.path("<REPO>").unwrap(), "/base/repo");
        assert_eq!(storage.path("<REPO>/file").unwrap(), "/base/repo/file");
        assert_message(
            storage.path("<ABS>"),
            "absolute path '/elsewhere' is not in base path '/base'",
        );
        assert_message(storage.path("<NOPE>"), "evaluated path '<NOPE>' cannot be null");
        assert_message(
            storage.path("<REPO"),
            "end > not found in path expression '<REPO'",
        );
        assert_message(
            storage.path("<REPO>file"),
            "'/' should separate expression and path '<REPO>file'",
        );
    }

    #[test]
    fn test_expression_without_callback() {
        let storage = storage_at("/base", false);
        assert_message(
            storage.path("<REPO>"),
            "expression '<REPO>' not valid without callback function",
        );
    }

    #[test]
    fn test_dry_run_rejects_writable_storage() {
        let driver: Arc<dyn StorageDriver> = Arc::new(PosixStorage::new());
        let options = StorageOptions {
            write: true,
            ..StorageOptions::default()
        };
        assert!(matches!(
            Storage::build(driver.clone(), options.clone(), true),
            Err(StorageError::Assert(_))
        ));
        assert!(Storage::build(driver.clone(), StorageOptions::default(), true).is_ok());
        assert!(Storage::build(driver, options, false).is_ok());
    }

    #[tokio::test]
    async fn test_read_only_rejects_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_at(&dir.path().to_string_lossy(), false);
        assert!(matches!(
            storage.new_write("file", WriteOptions::default()),
            Err(StorageError::Assert(_))
        ));
        assert!(matches!(
            storage.path_create("p", false, false, None).await,
            Err(StorageError::Assert(_))
        ));
        assert!(matches!(storage.remove("f", false).await, Err(StorageError::Assert(_))));
        assert!(matches!(storage.path_sync("").await, Err(StorageError::Assert(_))));
        assert!(matches!(
            storage.path_remove("p", false, true).await,
            Err(StorageError::Assert(_))
        ));
    }

    #[tokio::test]
    async fn test_put_get() {
        let (_dir, storage) = temp_storage();
        storage
            .put(storage.new_write("a/file", WriteOptions::default()).unwrap(), b"content")
            .await
            .unwrap();
        let data = storage
            .get(storage.new_read("a/file", ReadOptions::default()).unwrap(), None)
            .await
            .unwrap();
        assert_eq!(data.as_deref(), Some(&b"content"[..]));

        let exact = storage
            .get(storage.new_read("a/file", ReadOptions::default()).unwrap(), Some(7))
            .await
            .unwrap();
        assert_eq!(exact.as_deref(), Some(&b"content"[..]));

        let short = storage
            .get(storage.new_read("a/file", ReadOptions::default()).unwrap(), Some(10))
            .await
            .unwrap_err();
        assert!(matches!(short, StorageError::ReadFailed(m) if m.starts_with("unable to read 10 byte(s) from '")));
        let long = storage
            .get(storage.new_read("a/file", ReadOptions::default()).unwrap(), Some(3))
            .await;
        assert!(matches!(long, Err(StorageError::ReadFailed(_))));

        let missing = storage
            .get(storage.new_read("nope", ReadOptions::ignore_missing()).unwrap(), None)
            .await
            .unwrap();
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn test_default_modes_applied() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::build(
            Arc::new(PosixStorage::new()),
            StorageOptions {
                path: dir.path().to_string_lossy().into_owned(),
                mode_file: 0o600,
                write: true,
                ..StorageOptions::default()
            },
            false,
        )
        .unwrap();
        let write = storage.new_write("f", WriteOptions::default()).unwrap();
        assert_eq!(write.options().mode_file, Some(0o600));
        assert_eq!(write.options().mode_path, Some(MODE_PATH_DEFAULT));
        storage.put(write, b"x").await.unwrap();
        let info = storage
            .info(
                "f",
                InfoOptions {
                    level: InfoLevel::Detail,
                    ..InfoOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(info.mode, 0o600);
    }

    #[tokio::test]
    async fn test_info_missing() {
        let (_dir, storage) = temp_storage();
        let err = storage.info("nope", InfoOptions::default()).await.unwrap_err();
        assert!(err.is_missing());
        assert!(err.message().starts_with("unable to get info for missing path/file '"));
        let info = storage
            .info(
                "nope",
                InfoOptions {
                    ignore_missing: true,
                    ..InfoOptions::default()
                },
            )
            .await
            .unwrap();
        assert!(!info.exists);
    }

    #[tokio::test]
    async fn test_list_options() {
        let (dir, storage) = temp_storage();
        std::fs::create_dir_all(dir.path().join("data/sub")).unwrap();
        std::fs::write(dir.path().join("data/b.txt"), b"b").unwrap();
        std::fs::write(dir.path().join("data/a.txt"), b"a").unwrap();
        std::fs::write(dir.path().join("data/sub/c.log"), b"c").unwrap();

        let asc = ListOptions {
            sort: SortOrder::Asc,
            ..ListOptions::default()
        };
        assert_eq!(
            storage.list("data", &asc).await.unwrap().unwrap(),
            vec!["a.txt", "b.txt", "sub"]
        );

        let desc_recurse = ListOptions {
            sort: SortOrder::Desc,
            recurse: true,
            ..ListOptions::default()
        };
        assert_eq!(
            storage.list("data", &desc_recurse).await.unwrap().unwrap(),
            vec!["sub/c.log", "sub", "b.txt", "a.txt"]
        );

        let txt = ListOptions {
            sort: SortOrder::Asc,
            recurse: true,
            expression: Some(r"\.txt$".to_string()),
            ..ListOptions::default()
        };
        assert_eq!(
            storage.list("data", &txt).await.unwrap().unwrap(),
            vec!["a.txt", "b.txt"]
        );

        let info = storage.info_list("data", &asc).await.unwrap().unwrap();
        assert_eq!(info[0].size, 1);
        assert_eq!(info[2].kind, StorageType::Path);
    }

    #[tokio::test]
    async fn test_list_missing() {
        let (_dir, storage) = temp_storage();
        assert_eq!(
            storage.list("nope", &ListOptions::default()).await.unwrap(),
            Some(Vec::new())
        );
        let null = ListOptions {
            null_on_missing: true,
            ..ListOptions::default()
        };
        assert_eq!(storage.list("nope", &null).await.unwrap(), None);
        let error = ListOptions {
            error_on_missing: true,
            ..ListOptions::default()
        };
        let err = storage.list("nope", &error).await.unwrap_err();
        assert!(err.is_missing());
        assert!(err.message().starts_with("unable to list file info for missing path '"));
    }

    #[tokio::test]
    async fn test_copy_and_move() {
        let (dir, storage) = temp_storage();
        storage
            .put(storage.new_write("src", WriteOptions::default()).unwrap(), b"payload")
            .await
            .unwrap();

        let mut read = storage.new_read("src", ReadOptions::default()).unwrap();
        let mut write = storage.new_write("copy", WriteOptions::default()).unwrap();
        assert!(storage.copy(&mut read, &mut write).await.unwrap());
        assert_eq!(std::fs::read(dir.path().join("copy")).unwrap(), b"payload");

        let mut read = storage.new_read("nope", ReadOptions::ignore_missing()).unwrap();
        let mut write = storage.new_write("never", WriteOptions::default()).unwrap();
        assert!(!storage.copy(&mut read, &mut write).await.unwrap());
        assert!(!dir.path().join("never").exists());

        storage
            .move_file(
                storage.new_read("src", ReadOptions::default()).unwrap(),
                storage.new_write("moved/dst", WriteOptions::default()).unwrap(),
            )
            .await
            .unwrap();
        assert!(!dir.path().join("src").exists());
        assert_eq!(std::fs::read(dir.path().join("moved/dst")).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_move_across_drivers_copies() {
        let (dir, storage) = temp_storage();
        let other = storage_at(&dir.path().to_string_lossy(), true);
        storage
            .put(storage.new_write("src", WriteOptions::default()).unwrap(), b"payload")
            .await
            .unwrap();
        storage
            .move_file(
                storage.new_read("src", ReadOptions::default()).unwrap(),
                other.new_write("dst", WriteOptions::default()).unwrap(),
            )
            .await
            .unwrap();
        assert!(!dir.path().join("src").exists());
        assert_eq!(std::fs::read(dir.path().join("dst")).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_exists_with_timeout() {
        let (dir, storage) = temp_storage();
        assert!(!storage
            .exists("late", Some(Duration::from_millis(30)))
            .await
            .unwrap());
        let path = dir.path().join("late");
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            std::fs::write(path, b"x").unwrap();
        });
        assert!(storage
            .exists("late", Some(Duration::from_secs(5)))
            .await
            .unwrap());
        writer.await.unwrap();
        assert!(!storage.path_exists("late").await.unwrap());
        assert!(storage.path_exists("").await.unwrap());
    }

    #[tokio::test]
    async fn test_path_remove_error_on_missing() {
        let (_dir, storage) = temp_storage();
        storage.path_remove("nope", false, true).await.unwrap();
        let err = storage.path_remove("nope", true, true).await.unwrap_err();
        assert!(err.is_missing());
        storage.path_create("p/q", false, false, None).await.unwrap();
        storage.path_sync("p").await.unwrap();
        storage.path_remove("p", true, true).await.unwrap();
    }
}
