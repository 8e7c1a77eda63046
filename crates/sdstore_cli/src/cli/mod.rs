//! CLI module - command-line interface for sdstore

mod args;
mod diagnostics;
mod folder;
mod image;
mod note;
mod polling;
mod sd;
mod util;

use clap::Parser;

use args::{Cli, Commands};

/// Main entry point for the CLI.
pub async fn run_cli() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Sd { command } => sd::handle(command).await,
        Commands::Note { command } => note::handle(command).await,
        Commands::Folder { command } => folder::handle(command).await,
        Commands::Image { command } => image::handle(command).await,
        Commands::Polling { command } => polling::handle(command).await,
        Commands::Diagnostics { command } => diagnostics::handle(command).await,
    }
}
