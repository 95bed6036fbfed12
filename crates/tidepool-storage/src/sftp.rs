//! SFTP driver.
//!
//! Talks SFTP v3 over the stdin/stdout of a spawned `ssh -s sftp` or over any async byte pipe.
//! One session is shared by the driver and all of its streams; requests are serialized on it.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tidepool_io::{ReadSource, StorageError, StorageResult, WriteSink};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::driver::{join_path, parent_path, ReadLimit, ReadOptions, StorageDriver, WriteOptions};
use crate::info::{Feature, Features, InfoLevel, StorageInfo, StorageType};
use crate::posix::TEMP_FILE_EXT;
use crate::sftp_proto::{
    SftpAttrs, SftpSession, SFTP_IO_SIZE, SSH_FXF_CREAT, SSH_FXF_READ, SSH_FXF_TRUNC,
    SSH_FXF_WRITE, S_IFDIR, S_IFLNK, S_IFREG,
};

/// SSH connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SftpConfig {
    /// Host to connect to.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Login user; the ssh default when unset.
    pub user: Option<String>,
    /// Private key passed with `-i`.
    pub key_file: Option<String>,
    /// Known hosts file; host key checking stays strict either way.
    pub known_hosts_file: Option<String>,
    /// ssh executable.
    pub ssh_command: String,
    /// Timeout for each SFTP reply in milliseconds.
    pub timeout_ms: u64,
}

impl Default for SftpConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            user: None,
            key_file: None,
            known_hosts_file: None,
            ssh_command: "ssh".to_string(),
            timeout_ms: 60_000,
        }
    }
}

impl SftpConfig {
    /// Arguments for the ssh process, ending with the sftp subsystem request.
    pub fn ssh_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-p".to_string(),
            self.port.to_string(),
        ];
        if let Some(key) = &self.key_file {
            args.push("-i".to_string());
            args.push(key.clone());
        }
        if let Some(known_hosts) = &self.known_hosts_file {
            args.push("-o".to_string());
            args.push(format!("UserKnownHostsFile={}", known_hosts));
        }
        args.push(match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        });
        args.push("-s".to_string());
        args.push("sftp".to_string());
        args
    }
}

type Session = Arc<Mutex<SftpSession>>;

/// Driver for a host reachable over SFTP.
#[derive(Debug, Clone)]
pub struct SftpStorage {
    session: Session,
}

fn kind_of(attrs: &SftpAttrs) -> StorageType {
    match attrs.file_type() {
        Some(S_IFREG) | None => StorageType::File,
        Some(S_IFDIR) => StorageType::Path,
        Some(S_IFLNK) => StorageType::Link,
        Some(_) => StorageType::Special,
    }
}

fn info_of(name: String, attrs: &SftpAttrs) -> StorageInfo {
    let (user_id, group_id) = attrs.uid_gid.unwrap_or_default();
    StorageInfo {
        name,
        exists: true,
        kind: kind_of(attrs),
        size: attrs.size.unwrap_or_default(),
        time_modified: attrs.atime_mtime.map(|(_, mtime)| i64::from(mtime)).unwrap_or_default(),
        mode: attrs.permissions.map(|p| p & 0o7777).unwrap_or_default(),
        user_id,
        group_id,
        ..StorageInfo::default()
    }
}

impl SftpStorage {
    /// Spawn ssh and start a session on its pipes.
    pub async fn connect(config: &SftpConfig) -> StorageResult<Self> {
        if config.host.is_empty() {
            return Err(StorageError::Config("sftp host is not set".to_string()));
        }
        let mut child = tokio::process::Command::new(&config.ssh_command)
            .args(config.ssh_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                StorageError::Service(format!(
                    "unable to spawn '{}' for sftp to '{}': {}",
                    config.ssh_command, config.host, e
                ))
            })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(StorageError::Service("ssh pipes are not available".to_string()));
        };
        debug!(host = %config.host, pid = ?child.id(), "ssh spawned for sftp");
        let session = SftpSession::start(
            Box::new(stdout),
            Box::new(stdin),
            Duration::from_millis(config.timeout_ms),
            Some(child),
        )
        .await?;
        Ok(Self::from_session(session))
    }

    /// Start a session over an existing byte pipe.
    pub async fn from_stream<R, W>(reader: R, writer: W, timeout: Duration) -> StorageResult<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let session = SftpSession::start(Box::new(reader), Box::new(writer), timeout, None).await?;
        Ok(Self::from_session(session))
    }

    fn from_session(session: SftpSession) -> Self {
        Self {
            session: Arc::new(Mutex::new(session)),
        }
    }

    /// Create `path` and any missing parents; existing paths are fine.
    async fn create_path_all(session: &mut SftpSession, path: &str, mode: u32) -> StorageResult<()> {
        let mut missing = Vec::new();
        let mut current = path.to_string();
        while current != "/" && session.stat(&current, true).await?.is_none() {
            let parent = parent_path(&current).to_string();
            missing.push(std::mem::replace(&mut current, parent));
        }
        for path in missing.iter().rev() {
            session.mkdir(path, mode).await?;
        }
        Ok(())
    }

    async fn remove_tree(session: &mut SftpSession, path: &str) -> StorageResult<()> {
        // directories still to visit, directories to remove afterwards (deepest last)
        let mut pending = vec![path.to_string()];
        let mut directories = Vec::new();
        while let Some(dir) = pending.pop() {
            for entry in Self::read_dir(session, &dir).await? {
                let child = join_path(&dir, &entry.0);
                if entry.1.file_type() == Some(S_IFDIR) {
                    pending.push(child);
                } else {
                    session.remove(&child).await?;
                }
            }
            directories.push(dir);
        }
        for dir in directories.iter().rev() {
            session.rmdir(dir).await?;
        }
        Ok(())
    }

    async fn read_dir(session: &mut SftpSession, path: &str) -> StorageResult<Vec<(String, SftpAttrs)>> {
        let handle = session.opendir(path).await?;
        let mut result = Vec::new();
        let listing = async {
            while let Some(names) = session.readdir(&handle).await? {
                for name in names {
                    if name.filename != "." && name.filename != ".." {
                        result.push((name.filename, name.attrs));
                    }
                }
            }
            Ok::<_, StorageError>(())
        }
        .await;
        session.close(&handle).await?;
        listing?;
        Ok(result)
    }
}

#[async_trait]
impl StorageDriver for SftpStorage {
    fn kind(&self) -> &'static str {
        "sftp"
    }

    fn features(&self) -> Features {
        Features::of(&[Feature::Path, Feature::Symlink])
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        let info = self.info(path, InfoLevel::Type, true).await?;
        Ok(info.exists && info.kind == StorageType::File)
    }

    async fn path_exists(&self, path: &str) -> StorageResult<bool> {
        let info = self.info(path, InfoLevel::Type, true).await?;
        Ok(info.exists && info.kind == StorageType::Path)
    }

    async fn info(&self, path: &str, level: InfoLevel, follow_link: bool) -> StorageResult<StorageInfo> {
        let mut session = self.session.lock().await;
        let Some(attrs) = session.stat(path, follow_link).await? else {
            return Ok(StorageInfo::missing(path));
        };
        let mut info = info_of(path.to_string(), &attrs);
        if level >= InfoLevel::Detail && info.kind == StorageType::Link {
            info.link_destination = Some(session.readlink(path).await?);
        }
        Ok(info.truncate(level))
    }

    async fn list(&self, path: &str, level: InfoLevel) -> StorageResult<Option<Vec<StorageInfo>>> {
        let mut session = self.session.lock().await;
        let entries = match Self::read_dir(&mut session, path).await {
            Ok(entries) => entries,
            Err(e) if e.is_missing() => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut result = Vec::with_capacity(entries.len());
        for (name, attrs) in entries {
            let mut info = info_of(name, &attrs);
            if level >= InfoLevel::Detail && info.kind == StorageType::Link {
                info.link_destination = Some(session.readlink(&join_path(path, &info.name)).await?);
            }
            result.push(info.truncate(level));
        }
        Ok(Some(result))
    }

    fn new_read(&self, path: &str, options: &ReadOptions) -> StorageResult<Box<dyn ReadSource>> {
        Ok(Box::new(SftpRead {
            session: self.session.clone(),
            path: path.to_string(),
            options: options.clone(),
            handle: None,
            position: options.offset,
            limit: ReadLimit::new(options.limit),
            pending: Bytes::new(),
            eof: false,
        }))
    }

    fn new_write(&self, path: &str, options: &WriteOptions) -> StorageResult<Box<dyn WriteSink>> {
        Ok(Box::new(SftpWrite {
            session: self.session.clone(),
            path: path.to_string(),
            temp: format!("{}.{}", path, TEMP_FILE_EXT),
            options: options.clone(),
            handle: None,
            position: 0,
        }))
    }

    fn write_options(&self, mut options: WriteOptions) -> WriteOptions {
        options.sync_path = false;
        options
    }

    async fn move_file(&self, source: &str, destination: &str, options: &WriteOptions) -> StorageResult<bool> {
        let mut session = self.session.lock().await;
        match session.rename(source, destination).await {
            Ok(()) => return Ok(true),
            Err(e) if !e.is_missing() => return Err(e),
            Err(_) => {}
        }
        if session.stat(source, false).await?.is_none() {
            return Err(StorageError::MissingTarget(format!(
                "unable to move missing file '{}'",
                source
            )));
        }
        if !options.create_path {
            return Err(StorageError::MissingTarget(format!(
                "unable to move '{}' to missing path '{}'",
                source,
                parent_path(destination)
            )));
        }
        Self::create_path_all(&mut session, parent_path(destination), options.path_mode()).await?;
        session.rename(source, destination).await?;
        Ok(true)
    }

    async fn path_create(&self, path: &str, error_on_exists: bool, no_parent_create: bool, mode: u32) -> StorageResult<()> {
        let mut session = self.session.lock().await;
        let error = match session.mkdir(path, mode).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        if let Some(attrs) = session.stat(path, true).await? {
            if attrs.file_type() == Some(S_IFDIR) && !error_on_exists {
                return Ok(());
            }
            return Err(StorageError::AlreadyExists(format!(
                "unable to create path '{}' because it already exists",
                path
            )));
        }
        if error.is_missing() && !no_parent_create {
            Self::create_path_all(&mut session, parent_path(path), mode).await?;
            return session.mkdir(path, mode).await;
        }
        Err(error)
    }

    async fn path_remove(&self, path: &str, recurse: bool) -> StorageResult<bool> {
        let mut session = self.session.lock().await;
        match session.stat(path, false).await? {
            None => return Ok(false),
            Some(attrs) if attrs.file_type() != Some(S_IFDIR) => {
                return Err(StorageError::RemoveFailed(format!(
                    "unable to remove path '{}' because it is not a path",
                    path
                )));
            }
            Some(_) => {}
        }
        if recurse {
            Self::remove_tree(&mut session, path).await?;
        } else {
            session.rmdir(path).await?;
        }
        Ok(true)
    }

    async fn path_sync(&self, _path: &str) -> StorageResult<()> {
        Ok(())
    }

    async fn remove(&self, path: &str, error_on_missing: bool) -> StorageResult<()> {
        match self.session.lock().await.remove(path).await {
            Err(e) if e.is_missing() && !error_on_missing => Ok(()),
            result => result,
        }
    }
}

#[derive(Debug)]
struct SftpRead {
    session: Session,
    path: String,
    options: ReadOptions,
    handle: Option<Bytes>,
    position: u64,
    limit: ReadLimit,
    pending: Bytes,
    eof: bool,
}

#[async_trait]
impl ReadSource for SftpRead {
    async fn open(&mut self) -> StorageResult<bool> {
        let mut session = self.session.lock().await;
        match session.open(&self.path, SSH_FXF_READ, &SftpAttrs::default()).await {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(true)
            }
            Err(e) if e.is_missing() && self.options.ignore_missing => Ok(false),
            Err(e) if e.is_missing() => Err(StorageError::MissingTarget(format!(
                "unable to open missing file '{}' for read",
                self.path
            ))),
            Err(e) => Err(e),
        }
    }

    async fn read(&mut self, buf: &mut [u8]) -> StorageResult<usize> {
        loop {
            if self.limit.exhausted() {
                return Ok(0);
            }
            if !self.pending.is_empty() {
                let n = self.limit.allow(buf.len().min(self.pending.len()));
                buf[..n].copy_from_slice(&self.pending.split_to(n));
                self.limit.consume(n);
                return Ok(n);
            }
            let Some(handle) = self.handle.as_ref() else {
                return Ok(0);
            };
            if self.eof {
                return Ok(0);
            }
            let want = self.limit.allow(SFTP_IO_SIZE) as u32;
            match self.session.lock().await.read(handle, self.position, want).await? {
                Some(data) if !data.is_empty() => {
                    self.position += data.len() as u64;
                    self.pending = data;
                }
                _ => self.eof = true,
            }
        }
    }

    async fn close(&mut self) -> StorageResult<()> {
        if let Some(handle) = self.handle.take() {
            self.session.lock().await.close(&handle).await?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct SftpWrite {
    session: Session,
    path: String,
    temp: String,
    options: WriteOptions,
    handle: Option<Bytes>,
    position: u64,
}

impl SftpWrite {
    fn target(&self) -> &str {
        if self.options.atomic {
            &self.temp
        } else {
            &self.path
        }
    }
}

#[async_trait]
impl WriteSink for SftpWrite {
    async fn open(&mut self) -> StorageResult<()> {
        let mut session = self.session.lock().await;
        let target = self.target().to_string();
        let flags = SSH_FXF_WRITE | SSH_FXF_CREAT | SSH_FXF_TRUNC;
        let attrs = SftpAttrs::with_permissions(self.options.file_mode());
        let handle = match session.open(&target, flags, &attrs).await {
            Err(e) if e.is_missing() && self.options.create_path => {
                SftpStorage::create_path_all(&mut session, parent_path(&target), self.options.path_mode())
                    .await?;
                session.open(&target, flags, &attrs).await?
            }
            result => result?,
        };
        self.handle = Some(handle);
        self.position = 0;
        debug!(path = %self.path, "sftp write opened");
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> StorageResult<()> {
        let Some(handle) = self.handle.as_ref() else {
            return Err(StorageError::Assert(format!(
                "unable to write to unopened file '{}'",
                self.path
            )));
        };
        let mut session = self.session.lock().await;
        for piece in data.chunks(SFTP_IO_SIZE) {
            session.write(handle, self.position, piece).await?;
            self.position += piece.len() as u64;
        }
        Ok(())
    }

    async fn close(&mut self) -> StorageResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let mut session = self.session.lock().await;
        if self.options.sync_file {
            session.fsync(&handle).await?;
        }
        session.close(&handle).await?;
        if let Some(time) = self.options.time_modified {
            let time = u32::try_from(time).unwrap_or_default();
            let attrs = SftpAttrs {
                atime_mtime: Some((time, time)),
                ..SftpAttrs::default()
            };
            session.setstat(self.target(), &attrs).await?;
        }
        if self.options.atomic {
            session.rename(&self.temp, &self.path).await?;
        }
        debug!(path = %self.path, bytes = self.position, "sftp write committed");
        Ok(())
    }
}

impl Drop for SftpWrite {
    fn drop(&mut self) {
        // never committed: release the handle and clear the temp file in the background
        let Some(handle) = self.handle.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let session = self.session.clone();
        let temp = self.options.atomic.then(|| self.temp.clone());
        runtime.spawn(async move {
            let mut session = session.lock().await;
            if let Err(e) = session.close(&handle).await {
                warn!(error = %e, "unable to close abandoned sftp handle");
            }
            if let Some(temp) = temp {
                if let Err(e) = session.remove(&temp).await {
                    warn!(path = %temp, error = %e, "unable to remove abandoned temp file");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sftp_test_server;
    use tidepool_io::{IoRead, IoWrite};

    async fn driver(root: &std::path::Path) -> SftpStorage {
        let (reader, writer) = sftp_test_server::spawn(root.to_path_buf(), true);
        SftpStorage::from_stream(reader, writer, Duration::from_secs(5))
            .await
            .unwrap()
    }

    async fn put(driver: &SftpStorage, path: &str, data: &[u8], options: WriteOptions) {
        let mut io = IoWrite::new(driver.new_write(path, &options).unwrap());
        io.open().await.unwrap();
        io.write(data).await.unwrap();
        io.close().await.unwrap();
    }

    async fn get(driver: &SftpStorage, path: &str, options: ReadOptions) -> Option<Vec<u8>> {
        let mut io = IoRead::new(driver.new_read(path, &options).unwrap());
        if !io.open().await.unwrap() {
            return None;
        }
        let data = io.read_all().await.unwrap();
        io.close().await.unwrap();
        Some(data)
    }

    #[test]
    fn test_ssh_args() {
        let config = SftpConfig {
            host: "backup.example".to_string(),
            user: Some("pg".to_string()),
            key_file: Some("/keys/id".to_string()),
            ..SftpConfig::default()
        };
        assert_eq!(
            config.ssh_args(),
            vec!["-o", "BatchMode=yes", "-p", "22", "-i", "/keys/id", "pg@backup.example", "-s", "sftp"]
        );
    }

    #[tokio::test]
    async fn test_write_creates_path_and_reads_back() {
        let dir = tempfile::TempDir::new().unwrap();
        let sftp = driver(dir.path()).await;
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        put(&sftp, "/repo/sub/file", &data, WriteOptions::default()).await;

        assert_eq!(std::fs::read(dir.path().join("repo/sub/file")).unwrap(), data);
        assert!(!dir.path().join(format!("repo/sub/file.{}", TEMP_FILE_EXT)).exists());
        assert_eq!(get(&sftp, "/repo/sub/file", ReadOptions::default()).await.unwrap(), data);

        let options = ReadOptions {
            offset: 40_000,
            limit: Some(5),
            ..ReadOptions::default()
        };
        assert_eq!(
            get(&sftp, "/repo/sub/file", options).await.unwrap(),
            data[40_000..40_005].to_vec()
        );
    }

    #[tokio::test]
    async fn test_missing_read() {
        let dir = tempfile::TempDir::new().unwrap();
        let sftp = driver(dir.path()).await;
        assert_eq!(get(&sftp, "/nope", ReadOptions::ignore_missing()).await, None);
        let mut io = IoRead::new(sftp.new_read("/nope", &ReadOptions::default()).unwrap());
        assert_eq!(
            io.open().await.unwrap_err(),
            StorageError::MissingTarget("unable to open missing file '/nope' for read".to_string())
        );
    }

    #[tokio::test]
    async fn test_write_without_create_path_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let sftp = driver(dir.path()).await;
        let options = WriteOptions {
            create_path: false,
            ..WriteOptions::default()
        };
        let mut io = IoWrite::new(sftp.new_write("/missing/file", &options).unwrap());
        assert!(io.open().await.unwrap_err().is_missing());
    }

    #[tokio::test]
    async fn test_abort_without_close_leaves_no_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let sftp = driver(dir.path()).await;
        {
            let mut io = IoWrite::new(sftp.new_write("/file", &WriteOptions::default()).unwrap());
            io.open().await.unwrap();
            io.write(b"partial").await.unwrap();
        }
        let temp = dir.path().join(format!("file.{}", TEMP_FILE_EXT));
        tokio::time::timeout(Duration::from_secs(5), async {
            while temp.exists() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(!dir.path().join("file").exists());
        put(&sftp, "/file", b"whole", WriteOptions::default()).await;
        assert_eq!(std::fs::read(dir.path().join("file")).unwrap(), b"whole");
    }

    #[tokio::test]
    async fn test_info_list_and_modes() {
        let dir = tempfile::TempDir::new().unwrap();
        let sftp = driver(dir.path()).await;
        let options = WriteOptions {
            mode_file: Some(0o600),
            time_modified: Some(1_600_000_000),
            atomic: false,
            ..WriteOptions::default()
        };
        put(&sftp, "/data/a.txt", b"abc", options).await;
        put(&sftp, "/data/b.txt", b"", WriteOptions::default()).await;
        std::fs::create_dir(dir.path().join("data/sub")).unwrap();

        let info = sftp.info("/data/a.txt", InfoLevel::Detail, false).await.unwrap();
        assert!(info.exists);
        assert_eq!(info.size, 3);
        assert_eq!(info.mode, 0o600);
        assert_eq!(info.time_modified, 1_600_000_000);
        assert!(sftp.exists("/data/a.txt").await.unwrap());
        assert!(!sftp.exists("/data").await.unwrap());
        assert!(sftp.path_exists("/data").await.unwrap());
        assert!(!sftp.info("/data/zzz", InfoLevel::Basic, false).await.unwrap().exists);

        let mut list = sftp.list("/data", InfoLevel::Type).await.unwrap().unwrap();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        let names: Vec<(&str, StorageType)> = list.iter().map(|i| (i.name.as_str(), i.kind)).collect();
        assert_eq!(
            names,
            vec![("a.txt", StorageType::File), ("b.txt", StorageType::File), ("sub", StorageType::Path)]
        );
        assert_eq!(sftp.list("/nope", InfoLevel::Exists).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_path_ops_and_move() {
        let dir = tempfile::TempDir::new().unwrap();
        let sftp = driver(dir.path()).await;

        sftp.path_create("/a/b/c", false, false, 0o750).await.unwrap();
        sftp.path_create("/a/b/c", false, false, 0o750).await.unwrap();
        assert!(matches!(
            sftp.path_create("/a/b/c", true, false, 0o750).await,
            Err(StorageError::AlreadyExists(_))
        ));
        assert!(sftp.path_create("/x/y", false, true, 0o750).await.unwrap_err().is_missing());

        put(&sftp, "/a/b/c/f", b"1", WriteOptions::default()).await;
        assert!(sftp.move_file("/a/b/c/f", "/moved/g", &WriteOptions::default()).await.unwrap());
        assert_eq!(std::fs::read(dir.path().join("moved/g")).unwrap(), b"1");
        assert_eq!(
            sftp.move_file("/a/b/c/f", "/moved/h", &WriteOptions::default()).await.unwrap_err(),
            StorageError::MissingTarget("unable to move missing file '/a/b/c/f'".to_string())
        );

        assert!(sftp.path_remove("/a", true).await.unwrap());
        assert!(!dir.path().join("a").exists());
        assert!(!sftp.path_remove("/a", true).await.unwrap());

        sftp.remove("/moved/g", true).await.unwrap();
        sftp.remove("/moved/g", false).await.unwrap();
        assert!(sftp.remove("/moved/g", true).await.unwrap_err().is_missing());
        sftp.path_sync("/moved").await.unwrap();
    }

    #[tokio::test]
    async fn test_rename_without_posix_extension_replaces_destination() {
        let dir = tempfile::TempDir::new().unwrap();
        let (reader, writer) = sftp_test_server::spawn(dir.path().to_path_buf(), false);
        let sftp = SftpStorage::from_stream(reader, writer, Duration::from_secs(5))
            .await
            .unwrap();
        put(&sftp, "/f", b"one", WriteOptions::default()).await;
        put(&sftp, "/f", b"two", WriteOptions::default()).await;
        assert_eq!(std::fs::read(dir.path().join("f")).unwrap(), b"two");
    }
}
