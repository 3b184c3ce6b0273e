//! catalogsync CLI: runs the ingestion pipeline and exposes operator commands.
//!
//! Submits product records, publishes them to the search index, and reports
//! on the status store.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
