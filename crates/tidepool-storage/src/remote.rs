//! Remote driver: forwards every primitive to a protocol server that owns the real storage.
//!
//! File content never travels inside a command pack. `storageOpenRead` answers with a found
//! flag and then streams chunks; `storageOpenWrite` answers empty and then receives chunks and a
//! commit flag. Filters attached to a remote stream run on the server and their results come
//! back with the final message.
//!
//! A protocol client carries one exchange at a time. Plain commands from concurrent tasks queue
//! for the client, but an open stream holds it until the stream finishes or is dropped, and calls
//! made meanwhile fail instead of waiting.

use std::ops::{Deref, DerefMut};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tidepool_io::{FilterDef, FilterResults, ReadSource, StorageError, StorageResult, WriteSink};
use tidepool_protocol::{ClientConfig, Pack, ProtocolClient, ProtocolCommand};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::driver::{ReadOptions, StorageDriver, WriteOptions};
use crate::info::{Features, InfoLevel, StorageInfo};

/// Does a file exist: `[path] -> [bool]`.
pub const STORAGE_EXISTS: &str = "storageExists";
/// Base path and feature bits: `() -> [path, features]`.
pub const STORAGE_FEATURE: &str = "storageFeature";
/// Info for one entry: `[path, level, follow_link] -> [info]`.
pub const STORAGE_INFO: &str = "storageInfo";
/// Entries of a path: `[path, level] -> [Option<Vec<info>>]`.
pub const STORAGE_INFO_LIST: &str = "storageInfoList";
/// Entry names of a path: `[path] -> [Option<Vec<name>>]`.
pub const STORAGE_LIST: &str = "storageList";
/// Move a file on the server: `[source, destination, write options] -> [bool]`.
pub const STORAGE_MOVE: &str = "storageMove";
/// Stream a file from the server: `[path, read options, filters] -> [found]`, chunks, `[results]`.
pub const STORAGE_OPEN_READ: &str = "storageOpenRead";
/// Stream a file to the server: `[path, write options, filters] -> ()`, chunks, commit, `[results]`.
pub const STORAGE_OPEN_WRITE: &str = "storageOpenWrite";
/// Create a path: `[path, error_on_exists, no_parent_create, mode]`.
pub const STORAGE_PATH_CREATE: &str = "storagePathCreate";
/// Does a path exist: `[path] -> [bool]`.
pub const STORAGE_PATH_EXISTS: &str = "storagePathExists";
/// Remove a path: `[path, recurse] -> [bool]`.
pub const STORAGE_PATH_REMOVE: &str = "storagePathRemove";
/// Sync a path: `[path]`.
pub const STORAGE_PATH_SYNC: &str = "storagePathSync";
/// Remove a file: `[path, error_on_missing]`.
pub const STORAGE_REMOVE: &str = "storageRemove";

/// Every storage command id.
pub const STORAGE_COMMANDS: [&str; 13] = [
    STORAGE_EXISTS,
    STORAGE_FEATURE,
    STORAGE_INFO,
    STORAGE_INFO_LIST,
    STORAGE_LIST,
    STORAGE_MOVE,
    STORAGE_OPEN_READ,
    STORAGE_OPEN_WRITE,
    STORAGE_PATH_CREATE,
    STORAGE_PATH_EXISTS,
    STORAGE_PATH_REMOVE,
    STORAGE_PATH_SYNC,
    STORAGE_REMOVE,
];

#[derive(Debug, Clone)]
struct SharedClient {
    client: Arc<Mutex<ProtocolClient>>,
    streaming: Arc<AtomicBool>,
}

impl SharedClient {
    fn new(client: ProtocolClient) -> Self {
        Self {
            client: Arc::new(Mutex::new(client)),
            streaming: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Lock the client for one command. Fails at once while a stream holds it.
    async fn command(&self) -> StorageResult<OwnedMutexGuard<ProtocolClient>> {
        if self.streaming.load(Ordering::Acquire) {
            return Err(StorageError::Assert(
                "remote storage is busy with an open stream".to_string(),
            ));
        }
        Ok(self.client.clone().lock_owned().await)
    }

    /// Lock the client for a stream, which keeps it until the session is dropped.
    async fn stream(&self) -> StorageResult<StreamSession> {
        let client = self.command().await?;
        self.streaming.store(true, Ordering::Release);
        Ok(StreamSession {
            client,
            streaming: self.streaming.clone(),
        })
    }
}

#[derive(Debug)]
struct StreamSession {
    client: OwnedMutexGuard<ProtocolClient>,
    streaming: Arc<AtomicBool>,
}

impl Deref for StreamSession {
    type Target = ProtocolClient;

    fn deref(&self) -> &ProtocolClient {
        &self.client
    }
}

impl DerefMut for StreamSession {
    fn deref_mut(&mut self) -> &mut ProtocolClient {
        &mut self.client
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.streaming.store(false, Ordering::Release);
    }
}

fn result(pack: Option<Pack>, command: &str) -> StorageResult<Pack> {
    pack.ok_or_else(|| {
        StorageError::Format(format!("remote command '{}' returned no result", command))
    })
}

fn filter_results(pack: Option<Pack>) -> StorageResult<FilterResults> {
    match pack {
        Some(pack) => pack.reader().serde(),
        None => Ok(FilterResults::default()),
    }
}

#[derive(Debug)]
struct RemoteInner {
    client: SharedClient,
    path: String,
    features: Features,
    // the remote process lives as long as the driver
    child: parking_lot::Mutex<Option<tokio::process::Child>>,
}

/// Driver backed by a protocol server.
#[derive(Debug, Clone)]
pub struct RemoteStorage {
    inner: Arc<RemoteInner>,
}

impl RemoteStorage {
    /// Driver over a connected client. Fetches the remote base path and features.
    pub async fn new(client: ProtocolClient) -> StorageResult<Self> {
        Self::build(client, None).await
    }

    /// Start `program` (typically ssh running the remote binary) and talk to it over its
    /// stdin/stdout.
    pub async fn spawn(program: &str, args: &[String], config: &ClientConfig) -> StorageResult<Self> {
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                StorageError::Service(format!("unable to spawn remote '{}': {}", program, e))
            })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(StorageError::Service("remote pipes are not available".to_string()));
        };
        debug!(program, pid = ?child.id(), "remote process spawned");
        let client = ProtocolClient::connect(config, Box::new(stdout), Box::new(stdin)).await?;
        Self::build(client, Some(child)).await
    }

    async fn build(
        mut client: ProtocolClient,
        child: Option<tokio::process::Child>,
    ) -> StorageResult<Self> {
        let pack = result(
            client.execute(ProtocolCommand::new(STORAGE_FEATURE)).await?,
            STORAGE_FEATURE,
        )?;
        let mut reader = pack.reader();
        let path = reader.str()?;
        let features = Features::from_bits(reader.u64()?);
        info!(client = client.name(), path = %path, "remote storage connected");
        Ok(Self {
            inner: Arc::new(RemoteInner {
                client: SharedClient::new(client),
                path,
                features,
                child: parking_lot::Mutex::new(child),
            }),
        })
    }

    /// Base path of the storage on the remote side.
    pub fn path_base(&self) -> &str {
        &self.inner.path
    }

    /// End the remote command loop.
    pub async fn close(&self) -> StorageResult<()> {
        self.inner.client.command().await?.close().await?;
        if let Some(mut child) = self.inner.child.lock().take() {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "remote process already gone");
            }
        }
        Ok(())
    }

    async fn execute(&self, command: ProtocolCommand) -> StorageResult<Option<Pack>> {
        self.inner.client.command().await?.execute(command).await
    }

    async fn execute_bool(&self, id: &str, param: Pack) -> StorageResult<bool> {
        let pack = result(self.execute(ProtocolCommand::new(id).param(param)).await?, id)?;
        let value = pack.reader().bool()?;
        Ok(value)
    }
}

#[async_trait]
impl StorageDriver for RemoteStorage {
    fn kind(&self) -> &'static str {
        "remote"
    }

    fn features(&self) -> Features {
        self.inner.features
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        self.execute_bool(STORAGE_EXISTS, Pack::new().str(path)).await
    }

    async fn path_exists(&self, path: &str) -> StorageResult<bool> {
        self.execute_bool(STORAGE_PATH_EXISTS, Pack::new().str(path)).await
    }

    async fn info(
        &self,
        path: &str,
        level: InfoLevel,
        follow_link: bool,
    ) -> StorageResult<StorageInfo> {
        let param = Pack::new().str(path).serde(&level)?.bool(follow_link);
        let pack = result(
            self.execute(ProtocolCommand::new(STORAGE_INFO).param(param)).await?,
            STORAGE_INFO,
        )?;
        let info = pack.reader().serde()?;
        Ok(info)
    }

    async fn list(&self, path: &str, level: InfoLevel) -> StorageResult<Option<Vec<StorageInfo>>> {
        if level == InfoLevel::Exists {
            let command = ProtocolCommand::new(STORAGE_LIST).param(Pack::new().str(path));
            let pack = result(self.execute(command).await?, STORAGE_LIST)?;
            let names: Option<Vec<String>> = pack.reader().serde()?;
            return Ok(names.map(|names| {
                names
                    .into_iter()
                    .map(|name| StorageInfo {
                        name,
                        exists: true,
                        ..StorageInfo::default()
                    })
                    .collect()
            }));
        }
        let param = Pack::new().str(path).serde(&level)?;
        let pack = result(
            self.execute(ProtocolCommand::new(STORAGE_INFO_LIST).param(param)).await?,
            STORAGE_INFO_LIST,
        )?;
        let list = pack.reader().serde()?;
        Ok(list)
    }

    fn new_read(&self, path: &str, options: &ReadOptions) -> StorageResult<Box<dyn ReadSource>> {
        Ok(Box::new(RemoteRead {
            client: self.inner.client.clone(),
            session: None,
            path: path.to_string(),
            options: options.clone(),
            filters: None,
            pending: Vec::new(),
            pending_pos: 0,
            results: None,
        }))
    }

    fn new_write(&self, path: &str, options: &WriteOptions) -> StorageResult<Box<dyn WriteSink>> {
        Ok(Box::new(RemoteWrite {
            client: self.inner.client.clone(),
            session: None,
            path: path.to_string(),
            options: options.clone(),
            filters: None,
            results: None,
        }))
    }

    async fn move_file(
        &self,
        source: &str,
        destination: &str,
        options: &WriteOptions,
    ) -> StorageResult<bool> {
        let param = Pack::new().str(source).str(destination).serde(options)?;
        self.execute_bool(STORAGE_MOVE, param).await
    }

    async fn path_create(
        &self,
        path: &str,
        error_on_exists: bool,
        no_parent_create: bool,
        mode: u32,
    ) -> StorageResult<()> {
        let param = Pack::new()
            .str(path)
            .bool(error_on_exists)
            .bool(no_parent_create)
            .u64(u64::from(mode));
        self.execute(ProtocolCommand::new(STORAGE_PATH_CREATE).param(param)).await?;
        Ok(())
    }

    async fn path_remove(&self, path: &str, recurse: bool) -> StorageResult<bool> {
        self.execute_bool(STORAGE_PATH_REMOVE, Pack::new().str(path).bool(recurse)).await
    }

    async fn path_sync(&self, path: &str) -> StorageResult<()> {
        self.execute(ProtocolCommand::new(STORAGE_PATH_SYNC).param(Pack::new().str(path))).await?;
        Ok(())
    }

    async fn remove(&self, path: &str, error_on_missing: bool) -> StorageResult<()> {
        let param = Pack::new().str(path).bool(error_on_missing);
        self.execute(ProtocolCommand::new(STORAGE_REMOVE).param(param)).await?;
        Ok(())
    }
}

#[derive(Debug)]
struct RemoteRead {
    client: SharedClient,
    session: Option<StreamSession>,
    path: String,
    options: ReadOptions,
    filters: Option<Vec<FilterDef>>,
    pending: Vec<u8>,
    pending_pos: usize,
    results: Option<FilterResults>,
}

#[async_trait]
impl ReadSource for RemoteRead {
    async fn open(&mut self) -> StorageResult<bool> {
        let mut client = self.client.stream().await?;
        let param = Pack::new()
            .str(self.path.as_str())
            .serde(&self.options)?
            .serde(&self.filters)?;
        let pack = result(
            client.execute(ProtocolCommand::new(STORAGE_OPEN_READ).param(param)).await?,
            STORAGE_OPEN_READ,
        )?;
        if !pack.reader().bool()? {
            return Ok(false);
        }
        client.begin_read();
        self.session = Some(client);
        debug!(path = %self.path, "remote read opened");
        Ok(true)
    }

    async fn read(&mut self, buf: &mut [u8]) -> StorageResult<usize> {
        loop {
            if self.pending_pos < self.pending.len() {
                let n = buf.len().min(self.pending.len() - self.pending_pos);
                buf[..n].copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + n]);
                self.pending_pos += n;
                return Ok(n);
            }
            let Some(client) = self.session.as_mut() else {
                return Ok(0);
            };
            match client.read_chunk().await? {
                Some(chunk) => {
                    self.pending = chunk;
                    self.pending_pos = 0;
                }
                None => {
                    let results = filter_results(client.finish_read().await?)?;
                    self.results = Some(results);
                    self.session = None;
                    return Ok(0);
                }
            }
        }
    }

    async fn close(&mut self) -> StorageResult<()> {
        // an unfinished exchange is drained before the client's next command
        self.session = None;
        Ok(())
    }

    fn offload_filters(&mut self, defs: &[FilterDef]) -> bool {
        self.filters = Some(defs.to_vec());
        true
    }

    fn remote_results(&mut self) -> Option<FilterResults> {
        self.results.take()
    }
}

#[derive(Debug)]
struct RemoteWrite {
    client: SharedClient,
    session: Option<StreamSession>,
    path: String,
    options: WriteOptions,
    filters: Option<Vec<FilterDef>>,
    results: Option<FilterResults>,
}

#[async_trait]
impl WriteSink for RemoteWrite {
    async fn open(&mut self) -> StorageResult<()> {
        let mut client = self.client.stream().await?;
        let param = Pack::new()
            .str(self.path.as_str())
            .serde(&self.options)?
            .serde(&self.filters)?;
        client
            .execute(ProtocolCommand::new(STORAGE_OPEN_WRITE).param(param))
            .await?;
        client.begin_write();
        self.session = Some(client);
        debug!(path = %self.path, "remote write opened");
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> StorageResult<()> {
        let Some(client) = self.session.as_mut() else {
            return Err(StorageError::Assert(format!(
                "unable to write to unopened remote file '{}'",
                self.path
            )));
        };
        if !data.is_empty() {
            client.write_chunk(data).await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> StorageResult<()> {
        // dropping an unclosed session makes the client abort the write before its next command
        let Some(mut client) = self.session.take() else {
            return Ok(());
        };
        self.results = Some(filter_results(client.finish_write().await?)?);
        debug!(path = %self.path, "remote write committed");
        Ok(())
    }

    fn offload_filters(&mut self, defs: &[FilterDef]) -> bool {
        self.filters = Some(defs.to_vec());
        true
    }

    fn remote_results(&mut self) -> Option<FilterResults> {
        self.results.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::posix::PosixStorage;
    use crate::remote_server::register_storage_handlers;
    use crate::storage::{ListOptions, Storage, StorageOptions};
    use std::time::Duration;
    use tidepool_io::{HashFilter, HashType, SizeFilter};
    use tidepool_protocol::{stream_pair, HandlerRegistry, ProtocolServer, ServerConfig};

    struct Harness {
        dir: tempfile::TempDir,
        base: String,
        storage: Storage,
    }

    async fn start() -> Harness {
        let dir = tempfile::TempDir::new().unwrap();
        let base = format!("{}/repo", dir.path().display());
        std::fs::create_dir(&base).unwrap();
        let server_storage = Storage::new(
            Arc::new(PosixStorage::new()),
            StorageOptions {
                path: base.clone(),
                write: true,
                ..StorageOptions::default()
            },
        )
        .unwrap();
        let mut handlers = HandlerRegistry::new();
        register_storage_handlers(&mut handlers, server_storage);

        let (client_stream, server_stream) = stream_pair(Duration::from_secs(10));
        tokio::spawn(async move {
            let mut server = ProtocolServer::from_stream(ServerConfig::default(), server_stream).await?;
            server.process(&handlers).await
        });
        let client = ProtocolClient::from_stream(&ClientConfig::default(), client_stream)
            .await
            .unwrap();
        let remote = RemoteStorage::new(client).await.unwrap();
        assert_eq!(remote.path_base(), base);
        let storage = Storage::new(
            Arc::new(remote.clone()),
            StorageOptions {
                path: remote.path_base().to_string(),
                write: true,
                ..StorageOptions::default()
            },
        )
        .unwrap();
        Harness { dir, base, storage }
    }

    #[tokio::test]
    async fn test_list_in_server_order() {
        let h = start().await;
        std::fs::create_dir(format!("{}/data", h.base)).unwrap();
        std::fs::write(format!("{}/data/a.txt", h.base), b"a").unwrap();
        std::fs::write(format!("{}/data/b.txt", h.base), b"b").unwrap();

        let names = h.storage.list("data", &ListOptions::default()).await.unwrap().unwrap();
        let server_names: Vec<String> = PosixStorage::new()
            .list(&format!("{}/data", h.base), InfoLevel::Exists)
            .await
            .unwrap()
            .unwrap()
            .into_iter()
            .map(|info| info.name)
            .collect();
        assert_eq!(names, server_names);
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(sorted, vec!["a.txt", "b.txt"]);

        let missing = ListOptions {
            null_on_missing: true,
            ..ListOptions::default()
        };
        assert_eq!(h.storage.list("nope", &missing).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_error_crosses_intact() {
        let h = start().await;
        let err = h
            .storage
            .get(h.storage.new_read("missing", ReadOptions::default()).unwrap(), None)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StorageError::MissingTarget(format!(
                "unable to open missing file '{}/missing' for read",
                h.base
            ))
        );
        let read = h.storage.new_read("missing", ReadOptions::ignore_missing()).unwrap();
        assert_eq!(h.storage.get(read, None).await.unwrap(), None);
        assert!(h.storage.exists("missing", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_streamed_write_and_read_with_remote_filters() {
        let h = start().await;
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 253) as u8).collect();

        let mut write = h.storage.new_write("sub/file", WriteOptions::default()).unwrap();
        write.add_filter(Box::new(SizeFilter::new())).unwrap();
        write.add_filter(Box::new(HashFilter::new(HashType::Sha256))).unwrap();
        write.open().await.unwrap();
        for piece in data.chunks(70_000) {
            write.write(piece).await.unwrap();
        }
        write.close().await.unwrap();
        assert_eq!(write.results().size(), Some(data.len() as u64));
        assert_eq!(
            write.results().hash(),
            Some(HashFilter::digest_of(HashType::Sha256, &data).as_str())
        );
        assert_eq!(std::fs::read(format!("{}/sub/file", h.base)).unwrap(), data);

        let mut read = h.storage.new_read("sub/file", ReadOptions::default()).unwrap();
        read.add_filter(Box::new(SizeFilter::new())).unwrap();
        assert!(read.open().await.unwrap());
        assert_eq!(read.read_all().await.unwrap(), data);
        read.close().await.unwrap();
        assert_eq!(read.results().size(), Some(data.len() as u64));

        let options = ReadOptions {
            offset: 10,
            limit: Some(4),
            ..ReadOptions::default()
        };
        let read = h.storage.new_read("sub/file", options).unwrap();
        assert_eq!(h.storage.get(read, None).await.unwrap().unwrap(), data[10..14].to_vec());
    }

    #[tokio::test]
    async fn test_open_stream_holds_the_client() {
        let h = start().await;
        std::fs::write(format!("{}/big", h.base), vec![7u8; 500_000]).unwrap();

        let mut read = h.storage.new_read("big", ReadOptions::default()).unwrap();
        assert!(read.open().await.unwrap());
        let mut buf = [0u8; 10];
        read.read(&mut buf).await.unwrap();
        assert!(matches!(
            h.storage.exists("big", None).await,
            Err(StorageError::Assert(_))
        ));
        drop(read);
        assert!(h.storage.exists("big", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_commands_queue_for_the_client() {
        let h = start().await;
        std::fs::write(format!("{}/a", h.base), b"a").unwrap();
        let (a, b, c) = tokio::join!(
            h.storage.exists("a", None),
            h.storage.exists("b", None),
            h.storage.path_exists(""),
        );
        assert!(a.unwrap());
        assert!(!b.unwrap());
        assert!(c.unwrap());

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let storage = h.storage.clone();
                tokio::spawn(async move { storage.exists("a", None).await })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().unwrap());
        }
    }

    #[tokio::test]
    async fn test_dropped_write_is_aborted() {
        let h = start().await;
        {
            let mut write = h.storage.new_write("file", WriteOptions::default()).unwrap();
            write.open().await.unwrap();
            write.write(b"partial").await.unwrap();
        }
        assert!(!h.storage.exists("file", None).await.unwrap());
        let write = h.storage.new_write("file", WriteOptions::default()).unwrap();
        h.storage.put(write, b"whole").await.unwrap();
        assert_eq!(std::fs::read(format!("{}/file", h.base)).unwrap(), b"whole");
    }

    #[tokio::test]
    async fn test_path_ops_info_and_move() {
        let h = start().await;
        assert!(h.storage.feature(crate::info::Feature::Path));

        h.storage.path_create("a/b", false, false, None).await.unwrap();
        assert!(h.storage.path_exists("a/b").await.unwrap());
        assert!(matches!(
            h.storage.path_create("a/b", true, false, None).await,
            Err(StorageError::AlreadyExists(_))
        ));

        let write = h.storage.new_write("a/b/f", WriteOptions::default()).unwrap();
        h.storage.put(write, b"12345").await.unwrap();
        let info = h
            .storage
            .info("a/b/f", crate::storage::InfoOptions::default())
            .await
            .unwrap();
        assert_eq!(info.size, 5);

        let list = h
            .storage
            .info_list(
                "a",
                &ListOptions {
                    level: InfoLevel::Basic,
                    recurse: true,
                    sort: crate::storage::SortOrder::Asc,
                    ..ListOptions::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        let names: Vec<&str> = list.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["b", "b/f"]);

        let read = h.storage.new_read("a/b/f", ReadOptions::default()).unwrap();
        let write = h.storage.new_write("c/g", WriteOptions::default()).unwrap();
        h.storage.move_file(read, write).await.unwrap();
        assert!(!h.dir.path().join("repo/a/b/f").exists());
        assert_eq!(std::fs::read(format!("{}/c/g", h.base)).unwrap(), b"12345");

        h.storage.path_sync("c").await.unwrap();
        h.storage.remove("c/g", true).await.unwrap();
        assert!(h.storage.remove("c/g", true).await.unwrap_err().is_missing());
        h.storage.path_remove("a", true, true).await.unwrap();
        assert!(h.storage.path_remove("a", true, true).await.unwrap_err().is_missing());
    }
}
