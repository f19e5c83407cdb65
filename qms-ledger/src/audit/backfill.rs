//! チェーン導入前の行へのチェーン列の後付け
//!
//! 未チェーン行を `(created_at, id)` 順にバッチ単位で連結する。
//! 各バッチは独立したトランザクションで、台帳ロックを取ってから実際の末尾を
//! 読み直すため、バッチ間に割り込んだ通常の追記とも分岐しない。
//! 途中で失敗したバッチはロールバックされ、実行全体を中断する。

use std::path::PathBuf;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::audit::hash_chain::{compute_data_hash, next_link};
use crate::audit::types::LedgerTail;
use crate::audit::verifier::{ChainVerifier, VerificationReport};
use crate::common::error::{LedgerError, LedgerResult};
use crate::config::LedgerConfig;
use crate::db::audit_log::{self, AuditLogStorage};
use crate::lock::RunLock;

const LOCK_HOLDER: &str = "backfill";
const OVERRIDE_REASON: &str = "backfill: assign chain columns to legacy rows";

/// バックフィル設定
#[derive(Debug, Clone)]
pub struct BackfillOptions {
    /// 1トランザクションで連結する行数
    pub batch_size: u64,
    /// 完了後に新しく連結した範囲を検証するか
    pub verify: bool,
    /// 検証時の読み取りページサイズ
    pub verify_page_size: u64,
    /// 実行ロックファイルのパス（Noneの場合はデータベースURLから導出）
    pub lock_path: Option<PathBuf>,
}

impl Default for BackfillOptions {
    fn default() -> Self {
        Self::from_config(&LedgerConfig::default())
    }
}

impl BackfillOptions {
    /// 台帳設定から作成
    pub fn from_config(config: &LedgerConfig) -> Self {
        Self {
            batch_size: config.backfill_batch_size,
            verify: true,
            verify_page_size: config.verify_page_size,
            lock_path: None,
        }
    }
}

/// バックフィル結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillSummary {
    /// 連結した行数
    pub processed: u64,
    /// コミットしたバッチ数
    pub batches: u64,
    /// 開始時点のチェーン済み行数
    pub previously_chained: i64,
    /// 開始時点の未チェーン行数
    pub unchained_before: i64,
    /// 割り当てた最初のチェーン位置
    pub first_assigned_index: Option<i64>,
    /// 割り当てた最後のチェーン位置
    pub last_assigned_index: Option<i64>,
    /// 最後に割り当てたcurrentHash
    pub final_hash: Option<String>,
    /// 所要時間（ミリ秒）
    pub duration_ms: u64,
    /// 新しく連結した範囲の検証結果
    pub verification: Option<VerificationReport>,
}

struct BatchOutcome {
    rows: u64,
    first_index: i64,
    tail: LedgerTail,
}

/// バックフィル実行器
pub struct Backfiller {
    storage: AuditLogStorage,
    database: String,
    options: BackfillOptions,
}

impl Backfiller {
    /// 新しいBackfillerを作成
    pub fn new(
        storage: AuditLogStorage,
        database_url: impl Into<String>,
        options: BackfillOptions,
    ) -> Self {
        Self {
            storage,
            database: database_url.into(),
            options,
        }
    }

    /// バックフィルを実行する
    ///
    /// 未チェーン行が無ければ何もしない（再実行は常に空振り）。
    pub async fn run(&self) -> LedgerResult<BackfillSummary> {
        let _lock = match &self.options.lock_path {
            Some(path) => RunLock::acquire_at(path.clone(), &self.database)?,
            None => RunLock::acquire(&self.database)?,
        };

        let started = Instant::now();
        let unchained_before = self.storage.count_unchained().await?;
        let previously_chained = self.storage.count_chained().await?;

        let mut summary = BackfillSummary {
            processed: 0,
            batches: 0,
            previously_chained,
            unchained_before,
            first_assigned_index: None,
            last_assigned_index: None,
            final_hash: None,
            duration_ms: 0,
            verification: None,
        };

        if unchained_before == 0 {
            info!(chained = previously_chained, "No unchained audit entries; nothing to backfill");
            summary.duration_ms = started.elapsed().as_millis() as u64;
            return Ok(summary);
        }

        info!(
            unchained = unchained_before,
            chained = previously_chained,
            batch_size = self.options.batch_size,
            "Starting audit chain backfill"
        );

        let mut last_tail: Option<LedgerTail> = None;
        loop {
            let batch = summary.batches + 1;
            let outcome = match self.run_batch(last_tail.as_ref()).await {
                Ok(Some(outcome)) => outcome,
                Ok(None) => break,
                Err(e) => {
                    error!(
                        batch,
                        committed = summary.processed,
                        "Backfill batch failed and was rolled back; aborting: {}",
                        e
                    );
                    return Err(LedgerError::BackfillBatch {
                        batch,
                        committed: summary.processed,
                        reason: e.to_string(),
                    });
                }
            };

            summary.batches = batch;
            summary.processed += outcome.rows;
            summary
                .first_assigned_index
                .get_or_insert(outcome.first_index);
            summary.last_assigned_index = Some(outcome.tail.chain_index);
            summary.final_hash = Some(outcome.tail.current_hash.clone());
            last_tail = Some(outcome.tail);

            let elapsed = started.elapsed().as_secs_f64();
            let percent = summary.processed as f64 * 100.0 / unchained_before.max(1) as f64;
            info!(
                batch,
                processed = summary.processed,
                total = unchained_before,
                chain_index = summary.last_assigned_index,
                "Backfill progress {:.1}% ({:.0} rows/s)",
                percent.min(100.0),
                if elapsed > 0.0 {
                    summary.processed as f64 / elapsed
                } else {
                    0.0
                }
            );
        }

        if self.options.verify {
            if let (Some(from), Some(to)) =
                (summary.first_assigned_index, summary.last_assigned_index)
            {
                let verifier =
                    ChainVerifier::new(self.storage.clone(), self.options.verify_page_size);
                let report = verifier.verify_range(from, to).await?;
                if !report.valid {
                    warn!(
                        invalid = report.invalid_records,
                        "Verification of backfilled range found violations"
                    );
                }
                summary.verification = Some(report);
            }
        }

        summary.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            processed = summary.processed,
            batches = summary.batches,
            first = summary.first_assigned_index,
            last = summary.last_assigned_index,
            final_hash = summary.final_hash.as_deref().unwrap_or_default(),
            duration_ms = summary.duration_ms,
            "Audit chain backfill completed"
        );

        Ok(summary)
    }

    /// 1バッチを連結してコミットする（未チェーン行が無ければNone）
    async fn run_batch(&self, expected_tail: Option<&LedgerTail>) -> LedgerResult<Option<BatchOutcome>> {
        let mut tx = self
            .storage
            .pool()
            .begin()
            .await
            .map_err(|e| LedgerError::database("Failed to begin transaction", e))?;

        audit_log::lock_ledger(&mut tx, LOCK_HOLDER).await?;
        let mut tail = audit_log::read_tail(&mut tx).await?;
        if let Some(expected) = expected_tail {
            if expected != &tail {
                warn!(
                    expected = expected.chain_index,
                    actual = tail.chain_index,
                    "Ledger tail moved between backfill batches; continuing from the committed tail"
                );
            }
        }

        let limit = i64::try_from(self.options.batch_size.max(1)).unwrap_or(i64::MAX);
        let rows = audit_log::next_unchained_batch(&mut tx, limit).await?;
        if rows.is_empty() {
            return Ok(None);
        }

        audit_log::set_mutation_override(&mut tx, OVERRIDE_REASON).await?;

        let first_index = tail.chain_index + 1;
        for row in &rows {
            let link = next_link(&tail, compute_data_hash(&row.fields()));
            let updated = audit_log::assign_chain(&mut tx, row.id, &link).await?;
            if updated != 1 {
                return Err(LedgerError::Internal(format!(
                    "audit entry {} was chained concurrently",
                    row.id
                )));
            }
            tail = LedgerTail::from(&link);
        }

        audit_log::clear_mutation_override(&mut tx).await?;
        tx.commit()
            .await
            .map_err(|e| LedgerError::database("Failed to commit backfill batch", e))?;

        Ok(Some(BatchOutcome {
            rows: rows.len() as u64,
            first_index,
            tail,
        }))
    }
}
