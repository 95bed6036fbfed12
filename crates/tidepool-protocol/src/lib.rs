#![warn(missing_docs)]

//! Tidepool protocol subsystem: request/response RPC between a client and a remote worker
//!
//! Wire: u32 BE length + bincode [`ProtocolMessage`]; file content rides the same pipe as chunk
//! frames between a command's first and final data messages.

pub mod client;
pub mod lock;
pub mod message;
pub mod pack;
pub mod server;
pub mod stream;

pub use client::{ClientConfig, ProtocolClient};
pub use lock::{LockOptions, LockType, ProcessLock};
pub use message::{ProtocolCommand, ProtocolMessage, COMMAND_EXIT, COMMAND_NOOP};
pub use pack::{Pack, PackReader, PackValue};
pub use server::{CommandHandler, HandlerRegistry, ProtocolServer, ServerConfig, ServerSession};
pub use stream::{stream_pair, BoxedReader, BoxedWriter, ProtocolStream};
