//! 台帳の統計と監査用インスペクションレポート

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::verifier::{ChainVerifier, VerificationReport};
use crate::common::error::LedgerResult;
use crate::db::audit_log::{ActionCount, AuditLogStorage, MonthlyActivity, SeverityCount};

/// レポートに含める月数
pub const REPORT_MONTHS: i64 = 12;

/// レポートに含める上位アクション数
pub const TOP_ACTIONS: i64 = 10;

/// 台帳統計
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerStats {
    /// 全行数
    pub total_records: i64,
    /// チェーン済み行数
    pub chained_records: i64,
    /// 未チェーン行数
    pub unchained_records: i64,
    /// チェーン化率（%）
    pub chain_coverage_percent: f64,
    /// 末尾のチェーン位置
    pub last_chain_index: Option<i64>,
    /// 最古の記録時刻
    pub oldest_entry_at: Option<DateTime<Utc>>,
    /// 最新の記録時刻
    pub newest_entry_at: Option<DateTime<Utc>>,
    /// 重要度別件数
    pub by_severity: Vec<SeverityCount>,
}

/// インスペクションレポート
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectionReport {
    /// 生成時刻
    pub generated_at: DateTime<Utc>,
    /// 統計
    pub stats: LedgerStats,
    /// 全件検証の結果
    pub verification: VerificationReport,
    /// チェーン済み行の重要度分布
    pub severity_distribution: Vec<SeverityCount>,
    /// 月次件数（直近12か月）
    pub monthly_activity: Vec<MonthlyActivity>,
    /// 上位アクション
    pub top_actions: Vec<ActionCount>,
    /// 結論
    pub conclusion: String,
}

/// 台帳統計を取得
pub async fn ledger_stats(storage: &AuditLogStorage) -> LedgerResult<LedgerStats> {
    let total = storage.count_all().await?;
    let chained = storage.count_chained().await?;
    let unchained = total - chained;
    let tail = storage.get_tail().await?;
    let span = storage.time_span().await?;

    let coverage = if total == 0 {
        100.0
    } else {
        // 小数点以下2桁
        (chained as f64 * 10_000.0 / total as f64).round() / 100.0
    };

    Ok(LedgerStats {
        total_records: total,
        chained_records: chained,
        unchained_records: unchained,
        chain_coverage_percent: coverage,
        last_chain_index: tail.map(|t| t.chain_index),
        oldest_entry_at: span.map(|(oldest, _)| oldest),
        newest_entry_at: span.map(|(_, newest)| newest),
        by_severity: storage.count_by_severity(false).await?,
    })
}

/// 全件検証を含むインスペクションレポートを生成
pub async fn inspection_report(
    storage: &AuditLogStorage,
    verifier: &ChainVerifier,
) -> LedgerResult<InspectionReport> {
    let stats = ledger_stats(storage).await?;
    let verification = verifier.full_verify().await?;
    let severity_distribution = storage.count_by_severity(true).await?;
    let monthly_activity = storage.monthly_activity(REPORT_MONTHS).await?;
    let top_actions = storage.top_actions(TOP_ACTIONS).await?;
    let conclusion = conclusion(&verification);

    Ok(InspectionReport {
        generated_at: Utc::now(),
        stats,
        verification,
        severity_distribution,
        monthly_activity,
        top_actions,
        conclusion,
    })
}

fn conclusion(report: &VerificationReport) -> String {
    let mut text = if report.valid {
        format!(
            "Integrity confirmed: {} chained entries verified, no violations found.",
            report.total_records
        )
    } else {
        format!(
            "Integrity violations found: {} of {} chained entries failed verification.",
            report.invalid_records, report.total_records
        )
    };
    if report.unchained_records > 0 {
        text.push_str(&format!(
            " {} entries are not yet chained; run backfill.",
            report.unchained_records
        ));
    }
    text
}
