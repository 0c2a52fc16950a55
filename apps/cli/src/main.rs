//! scanmark CLI: administrative and worker commands for scanned-paper
//! assessment.
//!
//! Loads the assessment layout and version map, ingests scanned bundles,
//! and hands out identify and marking tasks.

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
