//! report / stats subcommands

use crate::Ledger;
use clap::Args;

/// Arguments for the report subcommand
#[derive(Args, Debug, Clone)]
pub struct ReportArgs {}

/// Arguments for the stats subcommand
#[derive(Args, Debug, Clone)]
pub struct StatsArgs {
    /// Print the statistics as JSON
    #[arg(long)]
    pub json: bool,
}

/// Execute the report command
pub async fn execute_report(_args: &ReportArgs, ledger: &Ledger) -> Result<bool, anyhow::Error> {
    let report = ledger.inspection_report().await?;
    super::print_json(&report)?;
    Ok(report.verification.valid)
}

/// Execute the stats command
pub async fn execute_stats(args: &StatsArgs, ledger: &Ledger) -> Result<bool, anyhow::Error> {
    let stats = ledger.stats().await?;

    if args.json {
        super::print_json(&stats)?;
        return Ok(true);
    }

    println!("Audit ledger statistics");
    println!("  Total entries    : {}", stats.total_records);
    println!("  Chained          : {}", stats.chained_records);
    println!("  Unchained        : {}", stats.unchained_records);
    println!("  Chain coverage   : {:.2}%", stats.chain_coverage_percent);
    if let Some(index) = stats.last_chain_index {
        println!("  Last chain index : {}", index);
    }
    if let (Some(oldest), Some(newest)) = (stats.oldest_entry_at, stats.newest_entry_at) {
        println!("  Period           : {} .. {}", oldest, newest);
    }
    for count in &stats.by_severity {
        println!("  {:<16} : {}", count.severity.to_string(), count.entry_count);
    }
    Ok(true)
}
