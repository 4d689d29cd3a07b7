//! Aspects CLI: dump published course structure and user models into
//! ClickHouse.
//!
//! Reads course content from the local content store and writes
//! course-overview and course-block rows, either on demand or in response
//! to lifecycle events.

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
