//! Protocol client: validates the greeting and executes commands one at a time.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tidepool_io::{StorageError, StorageResult};
use tracing::{debug, warn};

use crate::message::{
    ProtocolCommand, ProtocolMessage, COMMAND_EXIT, COMMAND_NOOP, PROTOCOL_NAME, PROTOCOL_VERSION,
};
use crate::pack::Pack;
use crate::stream::{BoxedReader, BoxedWriter, ProtocolStream};

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Name used in logs, e.g. "remote-1".
    pub name: String,
    /// Service the server must announce.
    pub service: String,
    /// Longest wait for any single read, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "remote".to_string(),
            service: "remote".to_string(),
            timeout_ms: 1_800_000,
        }
    }
}

/// Content stream left unfinished by a dropped stream object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    None,
    /// Server is still sending chunks followed by a final message.
    DrainRead,
    /// Server is still waiting for chunks, a terminator and a close/abort message.
    AbortWrite,
}

/// Client end of a protocol connection.
#[derive(Debug)]
pub struct ProtocolClient {
    name: String,
    stream: ProtocolStream,
    pending: Pending,
    closed: bool,
}

impl ProtocolClient {
    /// Connect over a read/write pair: check the greeting, then send a noop.
    pub async fn connect(
        config: &ClientConfig,
        reader: BoxedReader,
        writer: BoxedWriter,
    ) -> StorageResult<Self> {
        let stream = ProtocolStream::new(reader, writer, Duration::from_millis(config.timeout_ms));
        Self::from_stream(config, stream).await
    }

    /// Connect over an existing stream.
    pub async fn from_stream(config: &ClientConfig, mut stream: ProtocolStream) -> StorageResult<Self> {
        match stream.read_message().await? {
            ProtocolMessage::Greeting {
                name,
                service,
                version,
            } => {
                for (key, expected, actual) in [
                    ("name", PROTOCOL_NAME, name.as_str()),
                    ("service", config.service.as_str(), service.as_str()),
                    ("version", PROTOCOL_VERSION, version.as_str()),
                ] {
                    if expected != actual {
                        return Err(StorageError::Protocol(format!(
                            "expected value '{}' for greeting key '{}' but got '{}'",
                            expected, key, actual
                        )));
                    }
                }
            }
            other => {
                return Err(StorageError::Protocol(format!(
                    "expected greeting but got {} message",
                    other.kind()
                )));
            }
        }

        let mut client = Self {
            name: config.name.clone(),
            stream,
            pending: Pending::None,
            closed: false,
        };
        client.noop().await?;
        debug!(client = %client.name, "protocol client connected");
        Ok(client)
    }

    /// Client name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send a noop and wait for the acknowledgement.
    pub async fn noop(&mut self) -> StorageResult<()> {
        self.execute(ProtocolCommand::new(COMMAND_NOOP)).await?;
        Ok(())
    }

    /// Send a command and wait for its result.
    pub async fn execute(&mut self, command: ProtocolCommand) -> StorageResult<Option<Pack>> {
        if self.closed {
            return Err(StorageError::Assert(format!(
                "protocol client '{}' is closed",
                self.name
            )));
        }
        self.settle().await?;
        debug!(client = %self.name, command = command.id(), "execute protocol command");
        self.stream.write_message(&command.into_message()).await?;
        self.read_response().await
    }

    /// Read one data message, re-raising a remote error with its original kind and message.
    pub async fn read_response(&mut self) -> StorageResult<Option<Pack>> {
        match self.stream.read_message().await? {
            ProtocolMessage::Data(pack) => Ok(pack),
            ProtocolMessage::Error {
                code,
                message,
                stack,
            } => {
                debug!(client = %self.name, code, stack = %stack, "remote error");
                Err(StorageError::from_code(code, message))
            }
            other => Err(StorageError::Protocol(format!(
                "expected data message but got {} message",
                other.kind()
            ))),
        }
    }

    /// Mark that the server is about to stream content to this client.
    pub fn begin_read(&mut self) {
        self.pending = Pending::DrainRead;
    }

    /// Next chunk of content streamed by the server; `None` at the end.
    pub async fn read_chunk(&mut self) -> StorageResult<Option<Vec<u8>>> {
        self.stream.read_chunk().await
    }

    /// Read the message that follows streamed content and leave the streaming state.
    pub async fn finish_read(&mut self) -> StorageResult<Option<Pack>> {
        self.pending = Pending::None;
        self.read_response().await
    }

    /// Mark that this client is about to stream content to the server.
    pub fn begin_write(&mut self) {
        self.pending = Pending::AbortWrite;
    }

    /// Send one chunk of content.
    pub async fn write_chunk(&mut self, data: &[u8]) -> StorageResult<()> {
        self.stream.write_chunk(data).await
    }

    /// Terminate streamed content, ask the server to commit, and read its result.
    pub async fn finish_write(&mut self) -> StorageResult<Option<Pack>> {
        self.pending = Pending::None;
        self.stream.write_chunk_end().await?;
        self.stream
            .write_message(&ProtocolMessage::Data(Some(Pack::new().bool(true))))
            .await?;
        self.read_response().await
    }

    async fn settle(&mut self) -> StorageResult<()> {
        match self.pending {
            Pending::None => return Ok(()),
            Pending::DrainRead => {
                debug!(client = %self.name, "drain abandoned read stream");
                while self.stream.read_chunk().await?.is_some() {}
                self.pending = Pending::None;
                if let Err(e) = self.read_response().await {
                    warn!(client = %self.name, error = %e, "abandoned read stream ended with error");
                }
            }
            Pending::AbortWrite => {
                debug!(client = %self.name, "abort abandoned write stream");
                self.pending = Pending::None;
                self.stream.write_chunk_end().await?;
                self.stream
                    .write_message(&ProtocolMessage::Data(Some(Pack::new().bool(false))))
                    .await?;
                if let Err(e) = self.read_response().await {
                    warn!(client = %self.name, error = %e, "abandoned write stream ended with error");
                }
            }
        }
        Ok(())
    }

    /// Settle any pending stream and send `exit`. No response is expected.
    pub async fn close(&mut self) -> StorageResult<()> {
        if self.closed {
            return Ok(());
        }
        self.settle().await?;
        self.closed = true;
        debug!(client = %self.name, "protocol client exit");
        self.stream
            .write_message(&ProtocolCommand::new(COMMAND_EXIT).into_message())
            .await
    }
}
