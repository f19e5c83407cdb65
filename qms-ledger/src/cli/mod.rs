//! CLI module for qms-ledger
//!
//! Operational tooling: verify the chain, backfill legacy rows, print
//! statistics and inspection reports, and record events by hand.

pub mod backfill;
pub mod inspect;
pub mod record;
pub mod report;
pub mod verify;

use crate::config::LedgerConfig;
use crate::Ledger;
use clap::{Parser, Subcommand};

/// QMS audit ledger - hash-chained, append-only audit trail
#[derive(Parser, Debug)]
#[command(name = "qms-ledger")]
#[command(version, about, long_about = None)]
#[command(after_help = r#"ENVIRONMENT VARIABLES:
    QMS_LEDGER_DATABASE_URL         Database URL (default: sqlite:data/qms-ledger.db)
    QMS_LEDGER_LOG_LEVEL            Log level (default: info)
    QMS_LEDGER_APPEND_TIMEOUT_MS    Append critical section timeout (default: 5000)
    QMS_LEDGER_BUSY_TIMEOUT_MS      SQLite busy timeout (default: 5000)
    QMS_LEDGER_QUICK_VERIFY_SIZE    Entries checked by quick verify (default: 100)
    QMS_LEDGER_VERIFY_PAGE_SIZE     Rows read per verification page (default: 1000)
    QMS_LEDGER_BACKFILL_BATCH_SIZE  Rows chained per backfill batch (default: 500)
    QMS_LEDGER_WRITER_CAPACITY      Async writer queue capacity (default: 10000)
    QMS_LEDGER_WRITER_FALLBACK      Store unchained rows when chaining fails (default: true)
"#)]
pub struct Cli {
    /// Database URL
    #[arg(long, global = true, env = "QMS_LEDGER_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Verify the hash chain (quick by default)
    Verify(verify::VerifyArgs),
    /// Assign chain columns to entries recorded before chaining existed
    Backfill(backfill::BackfillArgs),
    /// Print the inspection report as JSON
    Report(report::ReportArgs),
    /// Print ledger statistics
    Stats(report::StatsArgs),
    /// Show the chain context of one entry
    Inspect(inspect::InspectArgs),
    /// Record one audit event
    Record(record::RecordArgs),
}

impl Cli {
    /// Resolve the ledger configuration (flags override the environment)
    pub fn config(&self) -> LedgerConfig {
        let mut config = LedgerConfig::from_env();
        if let Some(url) = &self.database_url {
            config.database_url = url.clone();
        }
        config
    }
}

/// Run the parsed command.
///
/// Returns `Ok(false)` when the command completed but found integrity
/// violations, so the caller can exit with a distinct status.
pub async fn run(cli: Cli) -> Result<bool, anyhow::Error> {
    let ledger = Ledger::open(cli.config()).await?;

    match &cli.command {
        Commands::Verify(args) => verify::execute(args, &ledger).await,
        Commands::Backfill(args) => backfill::execute(args, &ledger).await,
        Commands::Report(args) => report::execute_report(args, &ledger).await,
        Commands::Stats(args) => report::execute_stats(args, &ledger).await,
        Commands::Inspect(args) => inspect::execute(args, &ledger).await,
        Commands::Record(args) => record::execute(args, &ledger).await,
    }
}

/// Print a value as pretty JSON on stdout
pub(crate) fn print_json<T: serde::Serialize>(value: &T) -> Result<(), anyhow::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
