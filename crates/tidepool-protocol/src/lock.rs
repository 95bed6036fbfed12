//! Advisory cross-process locks taken during the protocol handshake.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tidepool_io::{StorageError, StorageResult};
use tracing::{debug, warn};

const LOCK_FILE_EXT: &str = ".lock";
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Which lock files to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LockType {
    /// Archive lock only.
    Archive,
    /// Backup lock only.
    #[default]
    Backup,
    /// Archive and backup locks.
    All,
}

impl LockType {
    fn file_kinds(&self) -> &'static [&'static str] {
        match self {
            LockType::Archive => &["archive"],
            LockType::Backup => &["backup"],
            LockType::All => &["archive", "backup"],
        }
    }
}

/// Where and how to lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockOptions {
    /// Directory holding the lock files.
    pub lock_path: PathBuf,
    /// Stanza the lock protects.
    pub stanza: String,
    /// Lock files to take.
    pub lock_type: LockType,
    /// Id shared by every process of one execution; a lock already held under it counts as ours.
    pub exec_id: String,
    /// How long to keep retrying a held lock, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            lock_path: PathBuf::from("/tmp/tidepool"),
            stanza: "main".to_string(),
            lock_type: LockType::default(),
            exec_id: new_exec_id(),
            timeout_ms: 0,
        }
    }
}

/// Generate a fresh execution id.
pub fn new_exec_id() -> String {
    format!("{}-{}", std::process::id(), uuid::Uuid::new_v4().simple())
}

#[derive(Debug, Serialize, Deserialize)]
struct LockData {
    #[serde(rename = "execId")]
    exec_id: String,
    pid: u32,
}

#[derive(Debug)]
struct HeldFile {
    path: PathBuf,
    // None when the lock is held by another process of the same execution
    file: Option<File>,
}

/// Held lock; released (file removed, then closed) on drop.
#[derive(Debug)]
pub struct ProcessLock {
    files: Vec<HeldFile>,
}

enum Attempt {
    Locked(File),
    SameExec,
    Busy(std::io::Error),
}

fn read_exec_id(file: &mut File) -> Option<String> {
    let mut content = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut content).ok()?;
    serde_json::from_str::<LockData>(&content).ok().map(|d| d.exec_id)
}

fn try_lock(path: &Path, exec_id: &str) -> StorageResult<Attempt> {
    let open = || {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o640)
            .open(path)
    };
    let mut file = match open() {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageError::from_io(
                        &e,
                        format!("unable to create lock path '{}'", parent.display()),
                        StorageError::PathCreateFailed,
                    )
                })?;
            }
            open().map_err(|e| lock_error(path, &e))?
        }
        Err(e) => return Err(lock_error(path, &e)),
    };

    // SAFETY: the descriptor is owned by `file` and stays open for the duration of the call
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(Attempt::Locked(file));
    }
    let err = std::io::Error::last_os_error();
    if err.kind() != std::io::ErrorKind::WouldBlock {
        return Err(lock_error(path, &err));
    }
    if read_exec_id(&mut file).as_deref() == Some(exec_id) {
        return Ok(Attempt::SameExec);
    }
    Ok(Attempt::Busy(err))
}

fn lock_error(path: &Path, err: &std::io::Error) -> StorageError {
    let hint = match err.kind() {
        std::io::ErrorKind::WouldBlock => "\nHINT: is another tidepool process running?".to_string(),
        std::io::ErrorKind::PermissionDenied => format!(
            "\nHINT: does the user running tidepool have permissions on the '{}' file?",
            path.display()
        ),
        _ => String::new(),
    };
    StorageError::Protocol(format!(
        "unable to acquire lock on file '{}': {}{}",
        path.display(),
        err,
        hint
    ))
}

impl ProcessLock {
    /// Lock file for one stanza and kind.
    pub fn file_path(options: &LockOptions, kind: &str) -> PathBuf {
        options
            .lock_path
            .join(format!("{}-{}{}", options.stanza, kind, LOCK_FILE_EXT))
    }

    /// Acquire every lock file for `options.lock_type`, retrying held locks until the timeout.
    pub async fn acquire(options: &LockOptions) -> StorageResult<Self> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(options.timeout_ms);
        let mut lock = ProcessLock { files: Vec::new() };

        for kind in options.lock_type.file_kinds() {
            let path = Self::file_path(options, kind);
            loop {
                match try_lock(&path, &options.exec_id)? {
                    Attempt::Locked(mut file) => {
                        let data = LockData {
                            exec_id: options.exec_id.clone(),
                            pid: std::process::id(),
                        };
                        let json = serde_json::to_string(&data).map_err(|e| {
                            StorageError::Format(format!("unable to encode lock data: {}", e))
                        })?;
                        file.set_len(0)
                            .and_then(|_| file.write_all(json.as_bytes()))
                            .and_then(|_| file.flush())
                            .map_err(|e| {
                                StorageError::from_io(
                                    &e,
                                    format!("unable to write lock file '{}'", path.display()),
                                    StorageError::WriteFailed,
                                )
                            })?;
                        debug!(path = %path.display(), exec_id = %options.exec_id, "lock acquired");
                        lock.files.push(HeldFile {
                            path,
                            file: Some(file),
                        });
                        break;
                    }
                    Attempt::SameExec => {
                        debug!(path = %path.display(), "lock already held by this execution");
                        lock.files.push(HeldFile { path, file: None });
                        break;
                    }
                    Attempt::Busy(err) => {
                        if tokio::time::Instant::now() >= deadline {
                            return Err(lock_error(&path, &err));
                        }
                        tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
                    }
                }
            }
        }
        Ok(lock)
    }

    /// Lock files held by this process.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(|f| f.path.as_path())
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        for held in self.files.drain(..) {
            if let Some(file) = held.file {
                // remove before closing so no other process can lock a file about to vanish
                if let Err(e) = std::fs::remove_file(&held.path) {
                    warn!(path = %held.path.display(), error = %e, "unable to remove lock file");
                }
                drop(file);
                debug!(path = %held.path.display(), "lock released");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(dir: &Path, exec_id: &str) -> LockOptions {
        LockOptions {
            lock_path: dir.join("lock"),
            stanza: "db".to_string(),
            lock_type: LockType::Backup,
            exec_id: exec_id.to_string(),
            timeout_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_acquire_creates_path_and_writes_data() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(dir.path(), "exec-1");
        let lock = ProcessLock::acquire(&opts).await.unwrap();
        let path = ProcessLock::file_path(&opts, "backup");
        assert!(path.ends_with("lock/db-backup.lock"));
        let data: LockData =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(data.exec_id, "exec-1");
        assert_eq!(data.pid, std::process::id());
        drop(lock);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_second_lock_fails_with_hint() {
        let dir = tempfile::tempdir().unwrap();
        let _held = ProcessLock::acquire(&options(dir.path(), "exec-1"))
            .await
            .unwrap();
        let err = ProcessLock::acquire(&options(dir.path(), "exec-2"))
            .await
            .unwrap_err();
        match err {
            StorageError::Protocol(msg) => {
                assert!(msg.starts_with("unable to acquire lock on file '"));
                assert!(msg.ends_with("HINT: is another tidepool process running?"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_same_exec_id_counts_as_held() {
        let dir = tempfile::tempdir().unwrap();
        let first = ProcessLock::acquire(&options(dir.path(), "shared"))
            .await
            .unwrap();
        let second = ProcessLock::acquire(&options(dir.path(), "shared"))
            .await
            .unwrap();
        let path = ProcessLock::file_path(&options(dir.path(), "shared"), "backup");
        drop(second);
        assert!(path.exists());
        drop(first);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_lock_all_takes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path(), "exec-all");
        opts.lock_type = LockType::All;
        let lock = ProcessLock::acquire(&opts).await.unwrap();
        let names: Vec<String> = lock
            .paths()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["db-archive.lock", "db-backup.lock"]);
    }

    #[tokio::test]
    async fn test_released_lock_can_be_retaken() {
        let dir = tempfile::tempdir().unwrap();
        drop(ProcessLock::acquire(&options(dir.path(), "a")).await.unwrap());
        assert!(ProcessLock::acquire(&options(dir.path(), "b")).await.is_ok());
    }
}
