//! Prospector CLI: mining project and company discovery.
//!
//! Discovers project ids across partitions, assembles canonical project
//! records with their owning companies, and audits the identifier
//! registry against what the sources returned.

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
