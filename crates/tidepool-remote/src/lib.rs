#![warn(missing_docs)]

//! Tidepool remote worker: a protocol server over stdin/stdout backed by a configured repository
//!
//! client RemoteStorage ⇄ (ssh) ⇄ stdin/stdout → ProtocolServer → storage handlers → Storage

pub mod cli;
pub mod config;

pub use cli::Cli;
pub use config::RemoteConfig;

use tidepool_protocol::{BoxedReader, BoxedWriter, HandlerRegistry, ProtocolServer};
use tidepool_storage::register_storage_handlers;
use tracing::info;

/// Build the repository storage and run the command loop until the client exits.
pub async fn serve(
    config: RemoteConfig,
    reader: BoxedReader,
    writer: BoxedWriter,
) -> anyhow::Result<()> {
    let storage = config.repo.build().await?;
    let mut handlers = HandlerRegistry::new();
    register_storage_handlers(&mut handlers, storage);

    info!(
        server = %config.server.name,
        process = config.server.process_index,
        commands = handlers.ids().len(),
        "remote worker ready"
    );
    let mut server = ProtocolServer::new(config.server, reader, writer).await?;
    server.process(&handlers).await?;
    Ok(())
}
