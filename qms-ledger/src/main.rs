//! QMS audit ledger CLI entry point

use clap::Parser;
use qms_ledger::cli::{self, Cli};
use qms_ledger::logging;

/// Exit status when a command completed but found integrity violations
const EXIT_INTEGRITY_FAILURE: i32 = 2;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = logging::init() {
        eprintln!("Failed to initialize logging: {}", e);
    }

    match cli::run(cli).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(EXIT_INTEGRITY_FAILURE),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}
