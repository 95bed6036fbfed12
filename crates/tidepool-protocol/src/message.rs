//! Protocol messages and their length-prefixed wire framing.

use serde::{Deserialize, Serialize};
use tidepool_io::{StorageError, StorageResult};

use crate::pack::Pack;

/// Name every Tidepool process announces in its greeting.
pub const PROTOCOL_NAME: &str = "tidepool";

/// Protocol version announced in the greeting; client and server must match exactly.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Built-in command that checks the connection (and takes the handshake lock).
pub const COMMAND_NOOP: &str = "noop";

/// Built-in command that ends the server loop.
pub const COMMAND_EXIT: &str = "exit";

/// Largest frame accepted from the wire.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// One unit exchanged between client and server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolMessage {
    /// First message sent by the server.
    Greeting {
        /// Always [`PROTOCOL_NAME`].
        name: String,
        /// Service the server provides.
        service: String,
        /// Always [`PROTOCOL_VERSION`].
        version: String,
    },
    /// Request from the client.
    Command {
        /// Command id.
        command: String,
        /// Parameters.
        param: Option<Pack>,
    },
    /// Successful result, or a data message within a streaming exchange.
    Data(Option<Pack>),
    /// Failure raised by a handler.
    Error {
        /// Stable error code.
        code: u16,
        /// Error message.
        message: String,
        /// Trace captured where the error was raised.
        stack: String,
    },
}

impl ProtocolMessage {
    /// Short name used in logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolMessage::Greeting { .. } => "greeting",
            ProtocolMessage::Command { .. } => "command",
            ProtocolMessage::Data(_) => "data",
            ProtocolMessage::Error { .. } => "error",
        }
    }

    /// Frame the message as a big-endian u32 length followed by the encoded payload.
    pub fn encode(&self) -> StorageResult<Vec<u8>> {
        let payload = bincode::serialize(self)
            .map_err(|e| StorageError::Format(format!("unable to encode {} message: {}", self.kind(), e)))?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(StorageError::Format(format!(
                "{} message of {} bytes exceeds maximum frame size {}",
                self.kind(),
                payload.len(),
                MAX_FRAME_SIZE
            )));
        }
        let mut frame = Vec::with_capacity(payload.len() + 4);
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decode a payload (without its length prefix).
    pub fn decode(payload: &[u8]) -> StorageResult<Self> {
        bincode::deserialize(payload)
            .map_err(|e| StorageError::Format(format!("unable to decode protocol message: {}", e)))
    }
}

/// A command about to be sent: id plus optional parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolCommand {
    id: String,
    param: Option<Pack>,
}

impl ProtocolCommand {
    /// Command without parameters.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            param: None,
        }
    }

    /// Attach parameters.
    pub fn param(mut self, param: Pack) -> Self {
        self.param = Some(param);
        self
    }

    /// Command id.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn into_message(self) -> ProtocolMessage {
        ProtocolMessage::Command {
            command: self.id,
            param: self.param,
        }
    }
}
