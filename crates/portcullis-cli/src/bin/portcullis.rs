use anyhow::Context;
use clap::Parser;
use portcullis_cli::{init_tracing, server_cli::ServerArgs};
use portcullis_types::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ServerArgs::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;
    init_tracing(&config.log_file).context("failed to initialise logging")?;

    portcullis_server::run(config).await?;
    Ok(())
}
