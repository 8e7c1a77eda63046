//! `sdstore` — an ops tool for inspecting and administering SD Storage
//! Directories from the command line, wrapping [`sdstore_core::coordinator::Coordinator`]
//! the same way a desktop shell or mobile bridge would.

/// CLI module - command-line interface for sdstore
mod cli;

#[tokio::main]
async fn main() {
    cli::run_cli().await;
}
