//! Server side of the remote driver: storage command handlers over a local [`Storage`].

use std::sync::Arc;

use async_trait::async_trait;
use tidepool_io::{FilterDef, StorageError, StorageResult, IO_BUFFER_SIZE_DEFAULT};
use tidepool_protocol::{CommandHandler, HandlerRegistry, Pack, ServerSession};
use tracing::debug;

use crate::driver::{ReadOptions, StorageDriver, WriteOptions};
use crate::info::InfoLevel;
use crate::remote::*;
use crate::storage::{InfoOptions, Storage};

struct StorageHandler {
    storage: Storage,
    command: &'static str,
}

fn require_param(param: Option<Pack>, command: &str) -> StorageResult<Pack> {
    param.ok_or_else(|| {
        StorageError::Protocol(format!("command '{}' requires parameters", command))
    })
}

impl StorageHandler {
    async fn open_read(
        &self,
        param: Pack,
        session: &mut ServerSession<'_>,
    ) -> StorageResult<Option<Pack>> {
        let mut reader = param.reader();
        let path = reader.str()?;
        let options: ReadOptions = reader.serde()?;
        let filters: Option<Vec<FilterDef>> = reader.serde()?;

        let mut read = self.storage.new_read(&path, options)?;
        for def in filters.unwrap_or_default() {
            read.add_filter(def.build()?)?;
        }
        if !read.open().await? {
            return Ok(Some(Pack::new().bool(false)));
        }
        session.respond(Some(Pack::new().bool(true))).await?;

        let mut buf = vec![0u8; IO_BUFFER_SIZE_DEFAULT];
        loop {
            let n = read.read(&mut buf).await?;
            if n > 0 {
                session.write_chunk(&buf[..n]).await?;
            }
            if n < buf.len() || read.eof() {
                break;
            }
        }
        session.write_chunk_end().await?;
        read.close().await?;
        Ok(Some(Pack::new().serde(&read.results())?))
    }

    async fn open_write(
        &self,
        param: Pack,
        session: &mut ServerSession<'_>,
    ) -> StorageResult<Option<Pack>> {
        let mut reader = param.reader();
        let path = reader.str()?;
        let options: WriteOptions = reader.serde()?;
        let filters: Option<Vec<FilterDef>> = reader.serde()?;

        let mut write = self.storage.new_write(&path, options)?;
        for def in filters.unwrap_or_default() {
            write.add_filter(def.build()?)?;
        }
        write.open().await?;
        session.respond(None).await?;

        session.begin_read();
        while let Some(chunk) = session.read_chunk().await? {
            write.write(&chunk).await?;
        }
        if !session.read_commit().await? {
            debug!(path = %write.name(), "remote write aborted");
            return Ok(None);
        }
        write.close().await?;
        Ok(Some(Pack::new().serde(&write.results())?))
    }

    async fn execute(
        &self,
        param: Option<Pack>,
        session: &mut ServerSession<'_>,
    ) -> StorageResult<Option<Pack>> {
        if self.command == STORAGE_FEATURE {
            return Ok(Some(
                Pack::new()
                    .str(self.storage.path_base())
                    .u64(self.storage.features().bits()),
            ));
        }

        let param = require_param(param, self.command)?;
        match self.command {
            STORAGE_OPEN_READ => return self.open_read(param, session).await,
            STORAGE_OPEN_WRITE => return self.open_write(param, session).await,
            _ => {}
        }

        let storage = &self.storage;
        let mut reader = param.reader();
        let path = reader.str()?;
        let result = match self.command {
            STORAGE_EXISTS => Pack::new().bool(storage.exists(&path, None).await?),
            STORAGE_PATH_EXISTS => Pack::new().bool(storage.path_exists(&path).await?),
            STORAGE_INFO => {
                let level: InfoLevel = reader.serde()?;
                let follow_link = reader.bool()?;
                let options = InfoOptions {
                    level,
                    ignore_missing: true,
                    follow_link,
                };
                Pack::new().serde(&storage.info(&path, options).await?)?
            }
            STORAGE_LIST => {
                let list = storage
                    .driver()
                    .list(&storage.path(&path)?, InfoLevel::Exists)
                    .await?
                    .map(|list| list.into_iter().map(|info| info.name).collect::<Vec<_>>());
                Pack::new().serde(&list)?
            }
            STORAGE_INFO_LIST => {
                let level: InfoLevel = reader.serde()?;
                let list = storage.driver().list(&storage.path(&path)?, level).await?;
                Pack::new().serde(&list)?
            }
            STORAGE_MOVE => {
                let destination = reader.str()?;
                let options: WriteOptions = reader.serde()?;
                let read = storage.new_read(&path, ReadOptions::default())?;
                let write = storage.new_write(&destination, options)?;
                storage.move_file(read, write).await?;
                Pack::new().bool(true)
            }
            STORAGE_PATH_CREATE => {
                let error_on_exists = reader.bool()?;
                let no_parent_create = reader.bool()?;
                let mode = u32::try_from(reader.u64()?).map_err(|_| {
                    StorageError::Format(format!("invalid mode for path '{}'", path))
                })?;
                storage
                    .path_create(&path, error_on_exists, no_parent_create, Some(mode))
                    .await?;
                return Ok(None);
            }
            STORAGE_PATH_REMOVE => {
                let recurse = reader.bool()?;
                storage.check_write("remove path")?;
                let removed = storage.driver().path_remove(&storage.path(&path)?, recurse).await?;
                Pack::new().bool(removed)
            }
            STORAGE_PATH_SYNC => {
                storage.path_sync(&path).await?;
                return Ok(None);
            }
            STORAGE_REMOVE => {
                storage.remove(&path, reader.bool()?).await?;
                return Ok(None);
            }
            other => {
                return Err(StorageError::Protocol(format!("invalid command '{}'", other)));
            }
        };
        Ok(Some(result))
    }
}

#[async_trait]
impl CommandHandler for StorageHandler {
    async fn handle(
        &self,
        param: Option<Pack>,
        session: &mut ServerSession<'_>,
    ) -> StorageResult<Option<Pack>> {
        self.execute(param, session).await
    }
}

/// Register a handler for every storage command, all backed by `storage`.
pub fn register_storage_handlers(registry: &mut HandlerRegistry, storage: Storage) {
    for command in STORAGE_COMMANDS {
        registry.register(
            command,
            Arc::new(StorageHandler {
                storage: storage.clone(),
                command,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::posix::PosixStorage;
    use crate::storage::StorageOptions;
    use std::time::Duration;
    use tidepool_protocol::{
        stream_pair, ClientConfig, ProtocolClient, ProtocolCommand, ProtocolServer, ServerConfig,
    };

    async fn serve(base: &str, write: bool) -> ProtocolClient {
        let storage = Storage::new(
            Arc::new(PosixStorage::new()),
            StorageOptions {
                path: base.to_string(),
                write,
                ..StorageOptions::default()
            },
        )
        .unwrap();
        let mut handlers = HandlerRegistry::new();
        register_storage_handlers(&mut handlers, storage);
        let (client_stream, server_stream) = stream_pair(Duration::from_secs(10));
        tokio::spawn(async move {
            let mut server = ProtocolServer::from_stream(ServerConfig::default(), server_stream).await?;
            server.process(&handlers).await
        });
        ProtocolClient::from_stream(&ClientConfig::default(), client_stream)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_read_only_storage_rejects_mutations() {
        let dir = tempfile::TempDir::new().unwrap();
        let base = dir.path().to_str().unwrap().to_string();
        std::fs::write(dir.path().join("file"), b"x").unwrap();
        let mut client = serve(&base, false).await;

        let command = ProtocolCommand::new(STORAGE_REMOVE).param(Pack::new().str("file").bool(true));
        assert!(matches!(client.execute(command).await, Err(StorageError::Assert(_))));
        let command = ProtocolCommand::new(STORAGE_PATH_REMOVE).param(Pack::new().str("").bool(true));
        assert!(matches!(client.execute(command).await, Err(StorageError::Assert(_))));
        assert!(dir.path().join("file").exists());

        let command = ProtocolCommand::new(STORAGE_EXISTS).param(Pack::new().str("file"));
        let pack = client.execute(command).await.unwrap().unwrap();
        assert!(pack.reader().bool().unwrap());
    }

    #[tokio::test]
    async fn test_paths_outside_base_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let base = dir.path().join("repo");
        std::fs::create_dir(&base).unwrap();
        let mut client = serve(base.to_str().unwrap(), true).await;

        let command = ProtocolCommand::new(STORAGE_EXISTS).param(Pack::new().str("/etc/passwd"));
        let err = client.execute(command).await.unwrap_err();
        assert!(err.message().contains("is not in base path"));
    }

    #[tokio::test]
    async fn test_missing_parameters() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut client = serve(dir.path().to_str().unwrap(), true).await;
        let err = client.execute(ProtocolCommand::new(STORAGE_INFO)).await.unwrap_err();
        assert!(matches!(err, StorageError::Protocol(_)));

        let pack = client.execute(ProtocolCommand::new(STORAGE_FEATURE)).await.unwrap().unwrap();
        let mut reader = pack.reader();
        assert_eq!(reader.str().unwrap(), dir.path().to_str().unwrap());
        assert_eq!(reader.u64().unwrap(), PosixStorage::new().features().bits());
    }
}
