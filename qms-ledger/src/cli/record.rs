//! record subcommand

use crate::audit::types::{NewAuditEvent, Severity};
use crate::Ledger;
use anyhow::Context;
use clap::Args;

/// Arguments for the record subcommand
#[derive(Args, Debug, Clone)]
pub struct RecordArgs {
    /// Namespaced action (e.g. RISK_CREATE)
    #[arg(long)]
    pub action: String,

    /// Acting user id
    #[arg(long)]
    pub user_id: Option<i64>,

    /// Entity type
    #[arg(long)]
    pub entity: Option<String>,

    /// Entity id
    #[arg(long)]
    pub entity_id: Option<String>,

    /// Description
    #[arg(long)]
    pub description: Option<String>,

    /// Metadata as a JSON object
    #[arg(long)]
    pub metadata: Option<String>,

    /// Severity (INFO, WARNING, CRITICAL, SECURITY)
    #[arg(long)]
    pub severity: Option<String>,
}

impl RecordArgs {
    /// Build the event described by the flags
    pub fn to_event(&self) -> Result<NewAuditEvent, anyhow::Error> {
        let metadata = self
            .metadata
            .as_deref()
            .map(serde_json::from_str::<serde_json::Value>)
            .transpose()
            .context("--metadata is not valid JSON")?;
        let severity = self
            .severity
            .as_deref()
            .map(str::parse::<Severity>)
            .transpose()?;

        Ok(NewAuditEvent {
            user_id: self.user_id,
            action: self.action.clone(),
            entity: self.entity.clone(),
            entity_id: self.entity_id.clone(),
            description: self.description.clone(),
            metadata,
            severity,
            created_at: None,
        })
    }
}

/// Execute the record command
pub async fn execute(args: &RecordArgs, ledger: &Ledger) -> Result<bool, anyhow::Error> {
    let entry = ledger.record_event(args.to_event()?).await?;
    super::print_json(&entry)?;
    Ok(true)
}
