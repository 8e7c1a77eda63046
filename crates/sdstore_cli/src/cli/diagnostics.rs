//! `sdstore diagnostics` — redacted diagnostics export for bug reports.

use super::args::DiagnosticsCommands;
use super::util::{build_coordinator, fail};

pub async fn handle(command: DiagnosticsCommands) {
    match command {
        DiagnosticsCommands::Export => export().await,
    }
}

async fn export() {
    let (coordinator, _config) = match build_coordinator().await {
        Ok(pair) => pair,
        Err(err) => fail(&err),
    };

    let package = coordinator.export_diagnostics().await;
    match serde_json::to_string_pretty(&package) {
        Ok(json) => println!("{json}"),
        Err(err) => fail(&err.into()),
    }
}
