//! Leadflow CLI: daily lead acquisition from the company registry.
//!
//! Fetches companies registered on a given day, registers the new ones as
//! CRM leads, sends each a contact email, and keeps a durable ledger so no
//! company is ever registered twice.

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
