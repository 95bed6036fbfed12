//! Local filesystem driver.

use std::ffi::{CStr, CString};
use std::io::SeekFrom;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use async_trait::async_trait;
use tidepool_io::{ReadSource, StorageError, StorageResult, WriteSink};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::driver::{parent_path, ReadLimit, ReadOptions, StorageDriver, WriteOptions};
use crate::info::{Feature, Features, InfoLevel, StorageInfo, StorageType};

/// Extension of the temporary file written by atomic writes.
pub const TEMP_FILE_EXT: &str = "tidepool.tmp";

/// Driver for a locally mounted filesystem.
#[derive(Debug, Clone)]
pub struct PosixStorage {
    sync_path: bool,
}

impl Default for PosixStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl PosixStorage {
    /// Driver that syncs paths.
    pub fn new() -> Self {
        Self { sync_path: true }
    }

    /// Driver whose path sync is a no-op, for filesystems that do not support it.
    pub fn without_path_sync() -> Self {
        Self { sync_path: false }
    }
}

fn storage_type(file_type: std::fs::FileType) -> StorageType {
    if file_type.is_file() {
        StorageType::File
    } else if file_type.is_dir() {
        StorageType::Path
    } else if file_type.is_symlink() {
        StorageType::Link
    } else {
        StorageType::Special
    }
}

fn c_path(path: &str) -> StorageResult<CString> {
    CString::new(path).map_err(|_| StorageError::Assert(format!("path '{}' contains a nul byte", path)))
}

fn lookup_buffer() -> Vec<libc::c_char> {
    vec![0; 16384]
}

pub(crate) fn user_name(uid: u32) -> Option<String> {
    let mut buf = lookup_buffer();
    // SAFETY: passwd is plain data; getpwuid_r fills it with pointers into `buf`, which outlives
    // every read below
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let rc = unsafe { libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result) };
    if rc != 0 || result.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(pwd.pw_name) }.to_string_lossy().into_owned())
}

pub(crate) fn group_name(gid: u32) -> Option<String> {
    let mut buf = lookup_buffer();
    // SAFETY: as for user_name
    let mut grp: libc::group = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::group = std::ptr::null_mut();
    let rc = unsafe { libc::getgrgid_r(gid, &mut grp, buf.as_mut_ptr(), buf.len(), &mut result) };
    if rc != 0 || result.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(grp.gr_name) }.to_string_lossy().into_owned())
}

fn user_id(name: &str) -> Option<u32> {
    let name = CString::new(name).ok()?;
    let mut buf = lookup_buffer();
    // SAFETY: as for user_name
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let rc = unsafe {
        libc::getpwnam_r(name.as_ptr(), &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result)
    };
    if rc != 0 || result.is_null() {
        return None;
    }
    Some(pwd.pw_uid)
}

fn group_id(name: &str) -> Option<u32> {
    let name = CString::new(name).ok()?;
    let mut buf = lookup_buffer();
    // SAFETY: as for user_name
    let mut grp: libc::group = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::group = std::ptr::null_mut();
    let rc = unsafe {
        libc::getgrnam_r(name.as_ptr(), &mut grp, buf.as_mut_ptr(), buf.len(), &mut result)
    };
    if rc != 0 || result.is_null() {
        return None;
    }
    Some(grp.gr_gid)
}

async fn build_info(
    path: &str,
    name: String,
    metadata: std::fs::Metadata,
    level: InfoLevel,
) -> StorageInfo {
    let kind = storage_type(metadata.file_type());
    let mut info = StorageInfo {
        name,
        exists: true,
        kind,
        size: if kind == StorageType::File { metadata.len() } else { 0 },
        time_modified: metadata.mtime(),
        mode: metadata.permissions().mode() & 0o7777,
        user_id: metadata.uid(),
        group_id: metadata.gid(),
        ..StorageInfo::default()
    };
    if level >= InfoLevel::Detail {
        info.user = user_name(info.user_id);
        info.group = group_name(info.group_id);
        if kind == StorageType::Link {
            match fs::read_link(path).await {
                Ok(dest) => info.link_destination = Some(dest.to_string_lossy().into_owned()),
                Err(e) => warn!(path, error = %e, "unable to read link destination"),
            }
        }
    }
    info.truncate(level)
}

async fn sync_dir(path: &str) -> StorageResult<()> {
    let dir = match File::open(path).await {
        Ok(dir) => dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StorageError::MissingTarget(format!(
                "unable to sync missing path '{}'",
                path
            )));
        }
        Err(e) => {
            return Err(StorageError::from_io(
                &e,
                format!("unable to open path '{}' for sync", path),
                StorageError::OpenFailed,
            ));
        }
    };
    dir.sync_all().await.map_err(|e| {
        StorageError::from_io(&e, format!("unable to sync path '{}'", path), StorageError::SyncFailed)
    })
}

async fn create_dir_all(path: &str, mode: u32) -> StorageResult<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true).mode(mode);
    builder.create(path).await.map_err(|e| {
        StorageError::from_io(
            &e,
            format!("unable to create path '{}'", path),
            StorageError::PathCreateFailed,
        )
    })
}

#[async_trait]
impl StorageDriver for PosixStorage {
    fn kind(&self) -> &'static str {
        "posix"
    }

    fn features(&self) -> Features {
        let features = Features::of(&[
            Feature::Path,
            Feature::Compress,
            Feature::Hardlink,
            Feature::Symlink,
            Feature::InfoDetail,
        ]);
        if self.sync_path {
            features.with(Feature::PathSync)
        } else {
            features
        }
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        let info = self.info(path, InfoLevel::Type, true).await?;
        Ok(info.exists && info.kind == StorageType::File)
    }

    async fn path_exists(&self, path: &str) -> StorageResult<bool> {
        let info = self.info(path, InfoLevel::Type, true).await?;
        Ok(info.exists && info.kind == StorageType::Path)
    }

    async fn info(
        &self,
        path: &str,
        level: InfoLevel,
        follow_link: bool,
    ) -> StorageResult<StorageInfo> {
        let metadata = if follow_link {
            fs::metadata(path).await
        } else {
            fs::symlink_metadata(path).await
        };
        match metadata {
            Ok(metadata) => Ok(build_info(path, path.to_string(), metadata, level).await),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StorageInfo::missing(path)),
            Err(e) => Err(StorageError::from_io(
                &e,
                format!("unable to get info for path/file '{}'", path),
                StorageError::InfoFailed,
            )),
        }
    }

    async fn list(&self, path: &str, level: InfoLevel) -> StorageResult<Option<Vec<StorageInfo>>> {
        let open_error = |e: std::io::Error| {
            StorageError::from_io(
                &e,
                format!("unable to open path '{}' for read", path),
                StorageError::OpenFailed,
            )
        };
        let mut dir = match fs::read_dir(path).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(open_error(e)),
        };

        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(open_error)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if level == InfoLevel::Exists {
                entries.push(StorageInfo {
                    name,
                    exists: true,
                    ..StorageInfo::default()
                });
                continue;
            }
            let entry_path = entry.path();
            let entry_path = entry_path.to_string_lossy();
            match fs::symlink_metadata(entry_path.as_ref()).await {
                Ok(metadata) => {
                    entries.push(build_info(&entry_path, name, metadata, level).await);
                }
                // removed between readdir and stat
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(StorageError::from_io(
                        &e,
                        format!("unable to get info for path/file '{}'", entry_path),
                        StorageError::InfoFailed,
                    ));
                }
            }
        }
        Ok(Some(entries))
    }

    fn new_read(&self, path: &str, options: &ReadOptions) -> StorageResult<Box<dyn ReadSource>> {
        Ok(Box::new(PosixRead {
            path: path.to_string(),
            options: options.clone(),
            file: None,
            limit: ReadLimit::new(options.limit),
        }))
    }

    fn new_write(&self, path: &str, options: &WriteOptions) -> StorageResult<Box<dyn WriteSink>> {
        let mut options = options.clone();
        if !self.sync_path {
            options.sync_path = false;
        }
        let temp = options
            .atomic
            .then(|| format!("{}.{}", path, TEMP_FILE_EXT));
        Ok(Box::new(PosixWrite {
            path: path.to_string(),
            temp,
            options,
            file: None,
            committed: false,
        }))
    }

    fn write_options(&self, mut options: WriteOptions) -> WriteOptions {
        if !self.sync_path {
            options.sync_path = false;
        }
        options
    }

    async fn move_file(
        &self,
        source: &str,
        destination: &str,
        options: &WriteOptions,
    ) -> StorageResult<bool> {
        let mut created = false;
        loop {
            match fs::rename(source, destination).await {
                Ok(()) => break,
                Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
                    debug!(source, destination, "rename across devices, falling back to copy");
                    return Ok(false);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    if fs::symlink_metadata(source).await.is_err() {
                        return Err(StorageError::MissingTarget(format!(
                            "unable to move missing file '{}'",
                            source
                        )));
                    }
                    if !options.create_path || created {
                        return Err(StorageError::MissingTarget(format!(
                            "unable to move '{}' to missing path '{}'",
                            source,
                            parent_path(destination)
                        )));
                    }
                    create_dir_all(parent_path(destination), options.path_mode()).await?;
                    created = true;
                }
                Err(e) => {
                    return Err(StorageError::from_io(
                        &e,
                        format!("unable to move '{}' to '{}'", source, destination),
                        StorageError::MoveFailed,
                    ));
                }
            }
        }

        if options.sync_path && self.sync_path {
            let destination_path = parent_path(destination);
            sync_dir(destination_path).await?;
            if parent_path(source) != destination_path {
                sync_dir(parent_path(source)).await?;
            }
        }
        Ok(true)
    }

    async fn path_create(
        &self,
        path: &str,
        error_on_exists: bool,
        no_parent_create: bool,
        mode: u32,
    ) -> StorageResult<()> {
        let mut builder = fs::DirBuilder::new();
        builder.mode(mode);
        let mut parent_created = false;
        loop {
            match builder.create(path).await {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if error_on_exists {
                        return Err(StorageError::AlreadyExists(format!(
                            "unable to create path '{}': path already exists",
                            path
                        )));
                    }
                    return Ok(());
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::NotFound
                        && !no_parent_create
                        && !parent_created =>
                {
                    create_dir_all(parent_path(path), mode).await?;
                    parent_created = true;
                }
                Err(e) => {
                    return Err(StorageError::from_io(
                        &e,
                        format!("unable to create path '{}'", path),
                        StorageError::PathCreateFailed,
                    ));
                }
            }
        }
    }

    async fn path_remove(&self, path: &str, recurse: bool) -> StorageResult<bool> {
        let result = if recurse {
            fs::remove_dir_all(path).await
        } else {
            fs::remove_dir(path).await
        };
        match result {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::from_io(
                &e,
                format!("unable to remove path '{}'", path),
                StorageError::RemoveFailed,
            )),
        }
    }

    async fn path_sync(&self, path: &str) -> StorageResult<()> {
        if !self.sync_path {
            return Ok(());
        }
        sync_dir(path).await
    }

    async fn remove(&self, path: &str, error_on_missing: bool) -> StorageResult<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !error_on_missing => Ok(()),
            Err(e) => Err(StorageError::from_io(
                &e,
                format!("unable to remove '{}'", path),
                StorageError::RemoveFailed,
            )),
        }
    }
}

/// Read source over a local file.
#[derive(Debug)]
struct PosixRead {
    path: String,
    options: ReadOptions,
    file: Option<File>,
    limit: ReadLimit,
}

#[async_trait]
impl ReadSource for PosixRead {
    async fn open(&mut self) -> StorageResult<bool> {
        let mut file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if self.options.ignore_missing {
                    return Ok(false);
                }
                return Err(StorageError::MissingTarget(format!(
                    "unable to open missing file '{}' for read",
                    self.path
                )));
            }
            Err(e) => {
                return Err(StorageError::from_io(
                    &e,
                    format!("unable to open file '{}' for read", self.path),
                    StorageError::OpenFailed,
                ));
            }
        };
        if self.options.offset > 0 {
            file.seek(SeekFrom::Start(self.options.offset))
                .await
                .map_err(|e| {
                    StorageError::from_io(
                        &e,
                        format!("unable to seek to {} in file '{}'", self.options.offset, self.path),
                        StorageError::ReadFailed,
                    )
                })?;
        }
        self.file = Some(file);
        Ok(true)
    }

    async fn read(&mut self, buf: &mut [u8]) -> StorageResult<usize> {
        let Some(file) = self.file.as_mut() else {
            return Ok(0);
        };
        let want = self.limit.allow(buf.len());
        if want == 0 {
            return Ok(0);
        }
        let n = file.read(&mut buf[..want]).await.map_err(|e| {
            StorageError::from_io(
                &e,
                format!("unable to read from '{}'", self.path),
                StorageError::ReadFailed,
            )
        })?;
        self.limit.consume(n);
        Ok(n)
    }

    async fn close(&mut self) -> StorageResult<()> {
        self.file = None;
        Ok(())
    }
}

/// Write sink over a local file.
#[derive(Debug)]
struct PosixWrite {
    path: String,
    // set for atomic writes
    temp: Option<String>,
    options: WriteOptions,
    file: Option<File>,
    committed: bool,
}

impl PosixWrite {
    fn target(&self) -> &str {
        self.temp.as_deref().unwrap_or(&self.path)
    }

    async fn open_file(&self) -> std::io::Result<File> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(self.options.file_mode())
            .open(self.target())
            .await
    }

    fn chown(&self) -> StorageResult<()> {
        if self.options.user.is_none() && self.options.group.is_none() {
            return Ok(());
        }
        let uid = match self.options.user.as_deref() {
            Some(name) => Some(user_id(name).ok_or_else(|| {
                StorageError::Assert(format!("unable to find user '{}'", name))
            })?),
            None => None,
        };
        let gid = match self.options.group.as_deref() {
            Some(name) => Some(group_id(name).ok_or_else(|| {
                StorageError::Assert(format!("unable to find group '{}'", name))
            })?),
            None => None,
        };
        std::os::unix::fs::chown(self.target(), uid, gid).map_err(|e| {
            StorageError::from_io(
                &e,
                format!("unable to set ownership for '{}'", self.target()),
                StorageError::OpenFailed,
            )
        })
    }

    fn set_time(&self) -> StorageResult<()> {
        let Some(time) = self.options.time_modified else {
            return Ok(());
        };
        let path = c_path(self.target())?;
        let times = libc::utimbuf {
            actime: time as libc::time_t,
            modtime: time as libc::time_t,
        };
        // SAFETY: `path` is a valid nul-terminated string and `times` lives across the call
        let rc = unsafe { libc::utime(path.as_ptr(), &times) };
        if rc != 0 {
            let e = std::io::Error::last_os_error();
            return Err(StorageError::from_io(
                &e,
                format!("unable to set time for '{}'", self.target()),
                StorageError::CloseFailed,
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl WriteSink for PosixWrite {
    async fn open(&mut self) -> StorageResult<()> {
        let file = match self.open_file().await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && self.options.create_path => {
                create_dir_all(parent_path(&self.path), self.options.path_mode()).await?;
                self.open_file().await.map_err(|e| {
                    StorageError::from_io(
                        &e,
                        format!("unable to open file '{}' for write", self.target()),
                        StorageError::OpenFailed,
                    )
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::MissingTarget(format!(
                    "unable to open file '{}' for write in missing path: {}",
                    self.target(),
                    e
                )));
            }
            Err(e) => {
                return Err(StorageError::from_io(
                    &e,
                    format!("unable to open file '{}' for write", self.target()),
                    StorageError::OpenFailed,
                ));
            }
        };
        self.file = Some(file);
        self.chown()
    }

    async fn write(&mut self, data: &[u8]) -> StorageResult<()> {
        let Some(file) = self.file.as_mut() else {
            return Err(StorageError::Assert(format!("file '{}' is not open", self.path)));
        };
        file.write_all(data).await.map_err(|e| {
            StorageError::from_io(
                &e,
                format!("unable to write '{}'", self.path),
                StorageError::WriteFailed,
            )
        })
    }

    async fn close(&mut self) -> StorageResult<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        file.flush().await.map_err(|e| {
            StorageError::from_io(
                &e,
                format!("unable to close file '{}' after write", self.target()),
                StorageError::CloseFailed,
            )
        })?;
        if self.options.sync_file {
            file.sync_all().await.map_err(|e| {
                StorageError::from_io(
                    &e,
                    format!("unable to sync file '{}' after write", self.target()),
                    StorageError::SyncFailed,
                )
            })?;
        }
        drop(file);
        self.set_time()?;

        if let Some(temp) = self.temp.as_deref() {
            fs::rename(temp, &self.path).await.map_err(|e| {
                StorageError::from_io(
                    &e,
                    format!("unable to move '{}' to '{}'", temp, self.path),
                    StorageError::MoveFailed,
                )
            })?;
        }
        self.committed = true;

        if self.options.sync_path {
            sync_dir(parent_path(&self.path)).await?;
        }
        Ok(())
    }
}

impl Drop for PosixWrite {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        // closes the handle; an uncommitted temp file must not linger next to the final name
        self.file = None;
        if let Some(temp) = self.temp.as_deref() {
            if Path::new(temp).exists() {
                if let Err(e) = std::fs::remove_file(temp) {
                    warn!(path = temp, error = %e, "unable to remove temp file of aborted write");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidepool_io::{IoRead, IoWrite};

    fn dir_path(dir: &tempfile::TempDir, name: &str) -> String {
        format!("{}/{}", dir.path().display(), name)
    }

    async fn write_file(driver: &PosixStorage, path: &str, data: &[u8], options: &WriteOptions) {
        let mut io = IoWrite::new(driver.new_write(path, options).unwrap());
        io.open().await.unwrap();
        io.write(data).await.unwrap();
        io.close().await.unwrap();
    }

    async fn read_file(driver: &PosixStorage, path: &str, options: &ReadOptions) -> Option<Vec<u8>> {
        let mut io = IoRead::new(driver.new_read(path, options).unwrap());
        if !io.open().await.unwrap() {
            return None;
        }
        let data = io.read_all().await.unwrap();
        io.close().await.unwrap();
        Some(data)
    }

    #[tokio::test]
    async fn test_atomic_write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let driver = PosixStorage::new();
        let path = dir_path(&dir, "sub/dir/file.txt");
        write_file(&driver, &path, b"hello world", &WriteOptions::default()).await;

        assert!(driver.exists(&path).await.unwrap());
        assert!(!Path::new(&format!("{}.{}", path, TEMP_FILE_EXT)).exists());
        assert_eq!(
            read_file(&driver, &path, &ReadOptions::default()).await.unwrap(),
            b"hello world"
        );
    }

    #[tokio::test]
    async fn test_read_offset_and_limit() {
        let dir = tempfile::tempdir().unwrap();
        let driver = PosixStorage::new();
        let path = dir_path(&dir, "file");
        write_file(&driver, &path, b"0123456789", &WriteOptions::default()).await;
        let options = ReadOptions {
            offset: 2,
            limit: Some(5),
            ..ReadOptions::default()
        };
        assert_eq!(read_file(&driver, &path, &options).await.unwrap(), b"23456");
    }

    #[tokio::test]
    async fn test_ignore_missing() {
        let dir = tempfile::tempdir().unwrap();
        let driver = PosixStorage::new();
        let path = dir_path(&dir, "missing");
        assert_eq!(read_file(&driver, &path, &ReadOptions::ignore_missing()).await, None);

        let mut io = IoRead::new(driver.new_read(&path, &ReadOptions::default()).unwrap());
        let err = io.open().await.unwrap_err();
        assert_eq!(
            err,
            StorageError::MissingTarget(format!("unable to open missing file '{}' for read", path))
        );
    }

    #[tokio::test]
    async fn test_abort_without_close_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let driver = PosixStorage::new();
        let path = dir_path(&dir, "file");
        {
            let mut io = IoWrite::new(driver.new_write(&path, &WriteOptions::default()).unwrap());
            io.open().await.unwrap();
            io.write(b"partial").await.unwrap();
        }
        assert!(!Path::new(&path).exists());
        assert!(!Path::new(&format!("{}.{}", path, TEMP_FILE_EXT)).exists());

        write_file(&driver, &path, b"complete", &WriteOptions::default()).await;
        assert_eq!(
            read_file(&driver, &path, &ReadOptions::default()).await.unwrap(),
            b"complete"
        );
    }

    #[tokio::test]
    async fn test_close_twice_does_not_rename_again() {
        let dir = tempfile::tempdir().unwrap();
        let driver = PosixStorage::new();
        let path = dir_path(&dir, "file");
        let mut io = IoWrite::new(driver.new_write(&path, &WriteOptions::default()).unwrap());
        io.open().await.unwrap();
        io.write(b"data").await.unwrap();
        io.close().await.unwrap();
        std::fs::remove_file(&path).unwrap();
        io.close().await.unwrap();
        assert!(!Path::new(&path).exists());
    }

    #[tokio::test]
    async fn test_failed_commit_is_not_reported_closed() {
        let dir = tempfile::tempdir().unwrap();
        let driver = PosixStorage::new();
        let path = dir_path(&dir, "target");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(format!("{}/occupant", path), b"x").unwrap();

        let mut io = IoWrite::new(driver.new_write(&path, &WriteOptions::default()).unwrap());
        io.open().await.unwrap();
        io.write(b"data").await.unwrap();
        let first = io.close().await.unwrap_err();
        assert!(matches!(first, StorageError::MoveFailed(_)));
        assert_eq!(io.close().await.unwrap_err(), first);
        assert!(Path::new(&path).is_dir());
    }

    #[tokio::test]
    async fn test_write_without_create_path() {
        let dir = tempfile::tempdir().unwrap();
        let driver = PosixStorage::new();
        let path = dir_path(&dir, "missing/file");
        let options = WriteOptions {
            create_path: false,
            ..WriteOptions::default()
        };
        let mut io = IoWrite::new(driver.new_write(&path, &options).unwrap());
        assert!(io.open().await.unwrap_err().is_missing());
    }

    #[tokio::test]
    async fn test_mode_and_time() {
        let dir = tempfile::tempdir().unwrap();
        let driver = PosixStorage::new();
        let path = dir_path(&dir, "file");
        let options = WriteOptions {
            mode_file: Some(0o600),
            time_modified: Some(1_500_000_000),
            atomic: false,
            ..WriteOptions::default()
        };
        write_file(&driver, &path, b"x", &options).await;
        let info = driver.info(&path, InfoLevel::Detail, false).await.unwrap();
        assert!(info.exists);
        assert_eq!(info.kind, StorageType::File);
        assert_eq!(info.size, 1);
        assert_eq!(info.mode, 0o600);
        assert_eq!(info.time_modified, 1_500_000_000);
    }

    #[tokio::test]
    async fn test_info_link() {
        let dir = tempfile::tempdir().unwrap();
        let driver = PosixStorage::new();
        let target = dir_path(&dir, "target");
        let link = dir_path(&dir, "link");
        std::fs::write(&target, b"abc").unwrap();
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let info = driver.info(&link, InfoLevel::Detail, false).await.unwrap();
        assert_eq!(info.kind, StorageType::Link);
        assert_eq!(info.link_destination.as_deref(), Some(target.as_str()));
        let followed = driver.info(&link, InfoLevel::Basic, true).await.unwrap();
        assert_eq!(followed.kind, StorageType::File);
        assert_eq!(followed.size, 3);
    }

    #[tokio::test]
    async fn test_exists_only_for_files() {
        let dir = tempfile::tempdir().unwrap();
        let driver = PosixStorage::new();
        let base = dir.path().to_string_lossy().into_owned();
        assert!(!driver.exists(&base).await.unwrap());
        assert!(driver.path_exists(&base).await.unwrap());
        assert!(!driver.exists(&dir_path(&dir, "nope")).await.unwrap());
    }

    #[tokio::test]
    async fn test_list() {
        let dir = tempfile::tempdir().unwrap();
        let driver = PosixStorage::new();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let base = dir.path().to_string_lossy().into_owned();
        let mut list = driver.list(&base, InfoLevel::Type).await.unwrap().unwrap();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name, "a.txt");
        assert_eq!(list[0].kind, StorageType::File);
        assert_eq!(list[1].name, "sub");
        assert_eq!(list[1].kind, StorageType::Path);

        assert_eq!(driver.list(&dir_path(&dir, "nope"), InfoLevel::Exists).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_move_creates_destination_path() {
        let dir = tempfile::tempdir().unwrap();
        let driver = PosixStorage::new();
        let source = dir_path(&dir, "source");
        let destination = dir_path(&dir, "new/dest");
        std::fs::write(&source, b"data").unwrap();
        assert!(driver
            .move_file(&source, &destination, &WriteOptions::default())
            .await
            .unwrap());
        assert_eq!(std::fs::read(&destination).unwrap(), b"data");

        let err = driver
            .move_file(&source, &destination, &WriteOptions::default())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StorageError::MissingTarget(format!("unable to move missing file '{}'", source))
        );
    }

    #[tokio::test]
    async fn test_path_create_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let driver = PosixStorage::new();
        let path = dir_path(&dir, "a/b/c");
        driver.path_create(&path, false, false, 0o750).await.unwrap();
        assert!(driver.path_exists(&path).await.unwrap());
        driver.path_create(&path, false, false, 0o750).await.unwrap();
        assert!(matches!(
            driver.path_create(&path, true, false, 0o750).await,
            Err(StorageError::AlreadyExists(_))
        ));
        assert!(driver
            .path_create(&dir_path(&dir, "x/y"), false, true, 0o750)
            .await
            .unwrap_err()
            .is_missing());

        std::fs::write(format!("{}/file", path), b"x").unwrap();
        let top = dir_path(&dir, "a");
        assert!(matches!(
            driver.path_remove(&top, false).await,
            Err(StorageError::RemoveFailed(_))
        ));
        assert!(driver.path_remove(&top, true).await.unwrap());
        assert!(!driver.path_remove(&top, true).await.unwrap());
        driver.path_sync(&dir.path().to_string_lossy()).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let driver = PosixStorage::new();
        let path = dir_path(&dir, "file");
        driver.remove(&path, false).await.unwrap();
        assert!(driver.remove(&path, true).await.unwrap_err().is_missing());
        std::fs::write(&path, b"x").unwrap();
        driver.remove(&path, true).await.unwrap();
        assert!(!Path::new(&path).exists());
    }
}
