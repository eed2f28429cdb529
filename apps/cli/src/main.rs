//! procwatch CLI — government-page change monitoring service.
//!
//! Ingests change webhooks, runs the staged LLM pipeline under a daily
//! budget, and posts actionable Slack cards.

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
