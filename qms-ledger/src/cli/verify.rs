//! verify subcommand
//!
//! Runs a quick, full or range verification and prints the report.

use crate::audit::verifier::{VerificationReport, VerifyMode};
use crate::Ledger;
use clap::Args;

/// Arguments for the verify subcommand
#[derive(Args, Debug, Clone)]
pub struct VerifyArgs {
    /// Verify every chained entry
    #[arg(long, conflicts_with_all = ["sample_size", "from", "to"])]
    pub full: bool,

    /// Number of most recent entries to verify
    #[arg(long)]
    pub sample_size: Option<u64>,

    /// First chain index of the range to verify
    #[arg(long, requires = "to", conflicts_with = "sample_size")]
    pub from: Option<i64>,

    /// Last chain index of the range to verify
    #[arg(long, requires = "from")]
    pub to: Option<i64>,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

impl VerifyArgs {
    /// Verification mode selected by the flags
    pub fn mode(&self, default_sample_size: u64) -> VerifyMode {
        if self.full {
            return VerifyMode::Full;
        }
        if let (Some(from), Some(to)) = (self.from, self.to) {
            return VerifyMode::Range { from, to };
        }
        VerifyMode::Quick {
            sample_size: self.sample_size.unwrap_or(default_sample_size),
        }
    }
}

/// Execute the verify command
pub async fn execute(args: &VerifyArgs, ledger: &Ledger) -> Result<bool, anyhow::Error> {
    let mode = args.mode(ledger.config.quick_verify_size);
    let report = ledger.verifier.verify(mode).await?;

    if args.json {
        super::print_json(&report)?;
    } else {
        print_report(&report);
    }
    Ok(report.valid)
}

fn print_report(report: &VerificationReport) {
    println!("Audit chain verification ({})", report.mode);
    println!("  Entries verified : {}", report.total_records);
    println!("  Valid            : {}", report.valid_records);
    println!("  Invalid          : {}", report.invalid_records);
    println!("  Unchained        : {}", report.unchained_records);
    if let (Some(first), Some(last)) = (report.first_chain_index, report.last_chain_index) {
        println!("  Chain range      : {}..={}", first, last);
    }
    println!("  Duration         : {} ms", report.duration_ms);
    println!(
        "  Result           : {}",
        if report.valid { "VALID" } else { "INVALID" }
    );

    for finding in &report.errors {
        let flags: Vec<String> = finding.errors.iter().map(|f| f.to_string()).collect();
        println!(
            "  #{} (id {}): {}",
            finding.chain_index,
            finding.record_id,
            flags.join(", ")
        );
    }
    if report.errors_truncated {
        println!(
            "  ... {} more invalid entries not listed",
            report.invalid_records - report.errors.len() as u64
        );
    }
}
