//! backfill subcommand

use crate::audit::backfill::BackfillOptions;
use crate::Ledger;
use clap::Args;

/// Arguments for the backfill subcommand
#[derive(Args, Debug, Clone)]
pub struct BackfillArgs {
    /// Rows chained per transaction
    #[arg(long)]
    pub batch_size: Option<u64>,

    /// Skip verification of the newly chained range
    #[arg(long, default_value_t = false)]
    pub skip_verify: bool,

    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,
}

/// Execute the backfill command
pub async fn execute(args: &BackfillArgs, ledger: &Ledger) -> Result<bool, anyhow::Error> {
    let mut options = BackfillOptions::from_config(&ledger.config);
    if let Some(batch_size) = args.batch_size {
        options.batch_size = batch_size.max(1);
    }
    options.verify = !args.skip_verify;

    let summary = ledger.backfiller(options).run().await?;
    let valid = summary
        .verification
        .as_ref()
        .map(|report| report.valid)
        .unwrap_or(true);

    if args.json {
        super::print_json(&summary)?;
        return Ok(valid);
    }

    if summary.processed == 0 {
        println!(
            "Nothing to backfill ({} entries already chained)",
            summary.previously_chained
        );
        return Ok(valid);
    }

    println!("Backfill completed");
    println!("  Rows chained     : {}", summary.processed);
    println!("  Batches          : {}", summary.batches);
    if let (Some(first), Some(last)) = (summary.first_assigned_index, summary.last_assigned_index)
    {
        println!("  Assigned range   : {}..={}", first, last);
    }
    if let Some(hash) = &summary.final_hash {
        println!("  Final hash       : {}", hash);
    }
    println!("  Duration         : {} ms", summary.duration_ms);
    match &summary.verification {
        Some(report) => println!(
            "  Verification     : {} ({} entries)",
            if report.valid { "VALID" } else { "INVALID" },
            report.total_records
        ),
        None => println!("  Verification     : skipped"),
    }

    Ok(valid)
}
