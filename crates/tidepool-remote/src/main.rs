use anyhow::Result;
use clap::Parser;
use tidepool_remote::{serve, Cli};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the protocol
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = cli.resolve()?;
    tracing::info!(
        repo = %config.repo.path,
        backend = config.repo.backend.kind(),
        "tidepool remote worker starting"
    );

    if let Err(e) = serve(config, Box::new(tokio::io::stdin()), Box::new(tokio::io::stdout())).await {
        tracing::error!("remote worker failed: {:#}", e);
        return Err(e);
    }
    tracing::info!("tidepool remote worker exit");
    Ok(())
}
