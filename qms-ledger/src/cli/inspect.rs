//! inspect subcommand

use crate::Ledger;
use clap::Args;

/// Arguments for the inspect subcommand
#[derive(Args, Debug, Clone)]
pub struct InspectArgs {
    /// Entry id
    #[arg(long)]
    pub id: i64,
}

/// Execute the inspect command
pub async fn execute(args: &InspectArgs, ledger: &Ledger) -> Result<bool, anyhow::Error> {
    let context = ledger.verifier.inspect_entry(args.id).await?;
    super::print_json(&context)?;

    Ok(context.flags.is_empty()
        && context.previous_link_valid.unwrap_or(true)
        && context.next_link_valid.unwrap_or(true))
}
