//! Protocol server: greeting, handshake lock and the command dispatch loop.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tidepool_io::{StorageError, StorageResult};
use tracing::{debug, info, warn};

use crate::lock::{LockOptions, ProcessLock};
use crate::message::{ProtocolMessage, COMMAND_EXIT, COMMAND_NOOP, PROTOCOL_NAME, PROTOCOL_VERSION};
use crate::pack::Pack;
use crate::stream::{BoxedReader, BoxedWriter, ProtocolStream};

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Name used in logs and error traces.
    pub name: String,
    /// Service announced in the greeting.
    pub service: String,
    /// Worker index; only process 0 takes the handshake lock.
    pub process_index: u32,
    /// Lock taken on the first noop, if any.
    pub lock: Option<LockOptions>,
    /// Sleep intervals (ms) between retries of a failed handler that has not sent anything yet.
    pub retry_interval_ms: Vec<u64>,
    /// Longest wait for any single read, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "remote".to_string(),
            service: "remote".to_string(),
            process_index: 0,
            lock: None,
            retry_interval_ms: Vec::new(),
            timeout_ms: 1_800_000,
        }
    }
}

/// Handler for one command id.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Execute the command. The returned pack is sent as the final data message.
    ///
    /// Handlers that stream content call [`ServerSession::respond`] first, then use the chunk
    /// methods, and finally return the closing result.
    async fn handle(
        &self,
        param: Option<Pack>,
        session: &mut ServerSession<'_>,
    ) -> StorageResult<Option<Pack>>;
}

/// Command handlers by id.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `id`, replacing any earlier registration.
    pub fn register(&mut self, id: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(id.into(), handler);
    }

    /// Handler for `id`.
    pub fn get(&self, id: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(id).cloned()
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

/// Access to the connection while one command is being handled.
pub struct ServerSession<'a> {
    stream: &'a mut ProtocolStream,
    responded: bool,
    sending: bool,
    receiving: bool,
    received_end: bool,
}

impl<'a> ServerSession<'a> {
    fn new(stream: &'a mut ProtocolStream) -> Self {
        Self {
            stream,
            responded: false,
            sending: false,
            receiving: false,
            received_end: false,
        }
    }

    /// Send an intermediate data message before streaming.
    pub async fn respond(&mut self, data: Option<Pack>) -> StorageResult<()> {
        self.responded = true;
        self.stream.write_message(&ProtocolMessage::Data(data)).await
    }

    /// Stream one chunk of content to the client.
    pub async fn write_chunk(&mut self, data: &[u8]) -> StorageResult<()> {
        self.sending = true;
        self.stream.write_chunk(data).await
    }

    /// End the content stream sent to the client.
    pub async fn write_chunk_end(&mut self) -> StorageResult<()> {
        self.sending = false;
        self.stream.write_chunk_end().await
    }

    /// Expect the client to stream content next.
    pub fn begin_read(&mut self) {
        self.receiving = true;
        self.received_end = false;
    }

    /// Next chunk streamed by the client; `None` at its terminator.
    pub async fn read_chunk(&mut self) -> StorageResult<Option<Vec<u8>>> {
        let chunk = self.stream.read_chunk().await?;
        if chunk.is_none() {
            self.received_end = true;
        }
        Ok(chunk)
    }

    /// Read the message following the client's content: true to commit, false to abort.
    pub async fn read_commit(&mut self) -> StorageResult<bool> {
        self.receiving = false;
        match self.stream.read_message().await? {
            ProtocolMessage::Data(Some(pack)) => pack.reader().bool(),
            other => Err(StorageError::Protocol(format!(
                "expected commit flag but got {} message",
                other.kind()
            ))),
        }
    }

    fn untouched(&self) -> bool {
        !self.responded && !self.sending && !self.receiving
    }

    async fn unwind(&mut self) -> StorageResult<()> {
        if self.sending {
            self.write_chunk_end().await?;
        }
        if self.receiving {
            if !self.received_end {
                while self.stream.read_chunk().await?.is_some() {}
            }
            self.receiving = false;
            self.stream.read_message().await?;
        }
        Ok(())
    }
}

/// Server end of a protocol connection.
pub struct ProtocolServer {
    config: ServerConfig,
    stream: ProtocolStream,
    lock: Option<ProcessLock>,
    handshake: bool,
}

impl ProtocolServer {
    /// Create a server over a read/write pair and send the greeting.
    pub async fn new(config: ServerConfig, reader: BoxedReader, writer: BoxedWriter) -> StorageResult<Self> {
        let stream = ProtocolStream::new(reader, writer, Duration::from_millis(config.timeout_ms));
        Self::from_stream(config, stream).await
    }

    /// Create a server over an existing stream and send the greeting.
    pub async fn from_stream(config: ServerConfig, mut stream: ProtocolStream) -> StorageResult<Self> {
        stream
            .write_message(&ProtocolMessage::Greeting {
                name: PROTOCOL_NAME.to_string(),
                service: config.service.clone(),
                version: PROTOCOL_VERSION.to_string(),
            })
            .await?;
        info!(server = %config.name, process = config.process_index, "protocol server started");
        Ok(Self {
            config,
            stream,
            lock: None,
            handshake: false,
        })
    }

    /// True while the handshake lock is held.
    pub fn locked(&self) -> bool {
        self.lock.is_some()
    }

    fn trace(&self, command: &str) -> String {
        format!(
            "raised from {} (process {}) running command '{}'",
            self.config.name, self.config.process_index, command
        )
    }

    async fn send_error(&mut self, command: &str, err: &StorageError) -> StorageResult<()> {
        let stack = self.trace(command);
        self.stream
            .write_message(&ProtocolMessage::Error {
                code: err.code(),
                message: err.message().to_string(),
                stack,
            })
            .await
    }

    async fn handshake(&mut self) -> StorageResult<()> {
        self.handshake = true;
        if self.config.process_index != 0 {
            return Ok(());
        }
        if let Some(options) = self.config.lock.clone() {
            match ProcessLock::acquire(&options).await {
                Ok(lock) => self.lock = Some(lock),
                Err(e) => {
                    warn!(server = %self.config.name, error = %e, "handshake lock failed");
                    self.send_error(COMMAND_NOOP, &e).await?;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn dispatch(
        &mut self,
        command: &str,
        handler: Arc<dyn CommandHandler>,
        param: Option<Pack>,
    ) -> StorageResult<()> {
        let mut retries: VecDeque<u64> = self.config.retry_interval_ms.iter().copied().collect();
        loop {
            let mut session = ServerSession::new(&mut self.stream);
            let err = match handler.handle(param.clone(), &mut session).await {
                Ok(data) => {
                    return session.stream.write_message(&ProtocolMessage::Data(data)).await;
                }
                Err(e) => e,
            };
            if session.untouched() {
                if let Some(sleep_ms) = retries.pop_front() {
                    debug!(command, error = %err, sleep_ms, "retry command");
                    tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
                    continue;
                }
            }
            session.unwind().await?;
            debug!(command, error = %err, "command failed");
            return self.send_error(command, &err).await;
        }
    }

    /// Run the command loop until the client sends `exit`.
    pub async fn process(&mut self, handlers: &HandlerRegistry) -> StorageResult<()> {
        loop {
            let (command, param) = match self.stream.read_message().await? {
                ProtocolMessage::Command { command, param } => (command, param),
                other => {
                    let err = StorageError::Format(format!(
                        "expected command message but got {} message",
                        other.kind()
                    ));
                    self.send_error("", &err).await?;
                    return Err(err);
                }
            };
            debug!(server = %self.config.name, command = %command, "protocol command");

            match command.as_str() {
                COMMAND_EXIT => break,
                COMMAND_NOOP => {
                    if !self.handshake {
                        self.handshake().await?;
                    }
                    self.stream.write_message(&ProtocolMessage::Data(None)).await?;
                }
                id => match handlers.get(id) {
                    Some(handler) => self.dispatch(id, handler, param).await?,
                    None => {
                        let err = StorageError::Protocol(format!("invalid command '{}'", id));
                        self.send_error(id, &err).await?;
                        return Err(err);
                    }
                },
            }
        }
        info!(server = %self.config.name, "protocol server exit");
        Ok(())
    }
}
