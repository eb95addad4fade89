mod cli;
mod config;
mod discuss;
mod entity;
mod error;
mod generator;
mod identity;
mod scheduler;
mod settings;
mod state;
mod store;
mod trigger;
mod utils;
mod worker;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = cli::Cli::parse();
    let config = config::Config::load(&cli.config)?;

    let app = cli::App::new(config).await?;
    let result = app.run(cli.command).await;
    app.shutdown().await;

    result
}
