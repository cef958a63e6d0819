//! Dealflow CLI: resolve deal facts and drive the enrichment queue.
//!
//! Resolves company facts from stored provider snapshots, admits enrichment
//! requests through the queue, and runs the worker that services them.

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
