//! chatkb CLI: chatbot knowledge bases from text, files, pages and sitemaps.
//!
//! Stores knowledge entries per bot and assembles them into the context
//! block injected into the bot's system prompt.

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
