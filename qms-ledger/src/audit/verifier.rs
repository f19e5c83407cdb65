//! チェーン検証
//!
//! チェーン位置の昇順にエントリを読み、各エントリについて
//!
//! 1. 業務フィールドから再計算したdataHashが保存値と一致するか
//! 2. 保存値から再計算したchainHashがcurrentHashと一致するか
//! 3. チェーン位置が直前エントリの+1か
//! 4. prevHashが直前エントリのcurrentHashと一致するか
//!
//! を確認する。検証は読み取りのみで、台帳を変更しない。

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audit::hash_chain::{compute_chain_hash, compute_data_hash, GENESIS_HASH};
use crate::audit::types::AuditLogEntry;
use crate::common::error::{LedgerError, LedgerResult};
use crate::db::audit_log::AuditLogStorage;

/// レポートに含めるエントリ別エラーの上限
pub const MAX_REPORTED_ERRORS: usize = 100;

/// 検証で検出される違反
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainFlag {
    /// 業務フィールドが保存済みdataHashと一致しない
    DataTampered,
    /// currentHashが保存値から再計算した値と一致しない
    HashMismatch,
    /// チェーン位置が連続していない（削除・並べ替え）
    ChainIndexGap,
    /// prevHashが直前エントリのcurrentHashと一致しない
    LinkBroken,
}

impl std::fmt::Display for ChainFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::DataTampered => "DATA_TAMPERED",
            Self::HashMismatch => "HASH_MISMATCH",
            Self::ChainIndexGap => "CHAIN_INDEX_GAP",
            Self::LinkBroken => "LINK_BROKEN",
        };
        f.write_str(name)
    }
}

/// エントリ単位の検証結果（違反があるもののみ）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryFindings {
    /// チェーン位置
    pub chain_index: i64,
    /// 行ID
    pub record_id: i64,
    /// 検出された違反
    pub errors: Vec<ChainFlag>,
}

/// 検証モード
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum VerifyMode {
    /// 末尾から指定件数
    Quick {
        /// 検証件数
        #[serde(rename = "sampleSize")]
        sample_size: u64,
    },
    /// 全件
    Full,
    /// チェーン位置の範囲（両端を含む）
    Range {
        /// 開始位置
        from: i64,
        /// 終了位置
        to: i64,
    },
}

impl std::fmt::Display for VerifyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Quick { sample_size } => write!(f, "quick (last {})", sample_size),
            Self::Full => write!(f, "full"),
            Self::Range { from, to } => write!(f, "range {}..={}", from, to),
        }
    }
}

/// 検証レポート
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    /// 違反が1件もなければtrue
    pub valid: bool,
    /// 検証モード
    pub mode: VerifyMode,
    /// 検証したエントリ数
    pub total_records: u64,
    /// 違反のないエントリ数
    pub valid_records: u64,
    /// 違反のあるエントリ数
    pub invalid_records: u64,
    /// 未チェーン行数（検証対象外）
    pub unchained_records: i64,
    /// 最初に検証したチェーン位置
    pub first_chain_index: Option<i64>,
    /// 最後に検証したチェーン位置
    pub last_chain_index: Option<i64>,
    /// エントリ別の違反（最大`MAX_REPORTED_ERRORS`件）
    pub errors: Vec<EntryFindings>,
    /// 違反一覧を切り詰めたか
    pub errors_truncated: bool,
    /// 検証時刻
    pub verified_at: DateTime<Utc>,
    /// 所要時間（ミリ秒）
    pub duration_ms: u64,
}

/// 1件のエントリを直前エントリ（無ければジェネシス）に対して検査する
///
/// `previous` は直前に検査したエントリの保存済み `(chain_index, current_hash)`。
/// チェーン列を持たないエントリは検査対象外で、空のVecを返す。
pub fn entry_flags(entry: &AuditLogEntry, previous: Option<(i64, &str)>) -> Vec<ChainFlag> {
    let Some(chain_index) = entry.chain_index else {
        return Vec::new();
    };

    let mut flags = Vec::new();
    let stored_data_hash = entry.data_hash.as_deref().unwrap_or_default();
    let stored_prev_hash = entry.prev_hash.as_deref().unwrap_or_default();

    if compute_data_hash(&entry.fields()) != stored_data_hash {
        flags.push(ChainFlag::DataTampered);
    }

    let recomputed = compute_chain_hash(chain_index, stored_prev_hash, stored_data_hash);
    if entry.current_hash.as_deref() != Some(recomputed.as_str()) {
        flags.push(ChainFlag::HashMismatch);
    }

    let (expected_index, expected_prev_hash) = match previous {
        Some((prev_index, prev_hash)) => (prev_index + 1, prev_hash),
        None => (1, GENESIS_HASH),
    };
    if chain_index != expected_index {
        flags.push(ChainFlag::ChainIndexGap);
    }
    if stored_prev_hash != expected_prev_hash {
        flags.push(ChainFlag::LinkBroken);
    }

    flags
}

/// 逐次検査器
///
/// エントリをチェーン位置の昇順に渡すと、違反の集計を行う。
/// 違反のあったエントリの後も、そのエントリの保存値から連結検査を続ける。
#[derive(Debug)]
pub struct ChainChecker {
    previous: Option<(i64, String)>,
    total: u64,
    invalid: u64,
    first_chain_index: Option<i64>,
    last_chain_index: Option<i64>,
    errors: Vec<EntryFindings>,
    errors_truncated: bool,
}

impl ChainChecker {
    /// アンカー（検査範囲の直前のエントリ）を指定して作成
    pub fn new(anchor: Option<&AuditLogEntry>) -> Self {
        let previous = anchor.and_then(|a| {
            a.chain_index
                .map(|index| (index, a.current_hash.clone().unwrap_or_default()))
        });
        Self {
            previous,
            total: 0,
            invalid: 0,
            first_chain_index: None,
            last_chain_index: None,
            errors: Vec::new(),
            errors_truncated: false,
        }
    }

    /// 1件検査して違反を返す
    pub fn check(&mut self, entry: &AuditLogEntry) -> Vec<ChainFlag> {
        let Some(chain_index) = entry.chain_index else {
            return Vec::new();
        };

        let flags = entry_flags(
            entry,
            self.previous
                .as_ref()
                .map(|(index, hash)| (*index, hash.as_str())),
        );

        self.total += 1;
        self.first_chain_index.get_or_insert(chain_index);
        self.last_chain_index = Some(chain_index);

        if !flags.is_empty() {
            self.invalid += 1;
            if self.errors.len() < MAX_REPORTED_ERRORS {
                self.errors.push(EntryFindings {
                    chain_index,
                    record_id: entry.id,
                    errors: flags.clone(),
                });
            } else {
                self.errors_truncated = true;
            }
        }

        self.previous = Some((
            chain_index,
            entry.current_hash.clone().unwrap_or_default(),
        ));
        flags
    }

    /// 検査済み件数
    pub fn total(&self) -> u64 {
        self.total
    }

    /// レポートを生成
    pub fn finish(
        self,
        mode: VerifyMode,
        unchained_records: i64,
        started: Instant,
    ) -> VerificationReport {
        VerificationReport {
            valid: self.invalid == 0,
            mode,
            total_records: self.total,
            valid_records: self.total - self.invalid,
            invalid_records: self.invalid,
            unchained_records,
            first_chain_index: self.first_chain_index,
            last_chain_index: self.last_chain_index,
            errors: self.errors,
            errors_truncated: self.errors_truncated,
            verified_at: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// 1エントリのチェーン上の文脈
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainContext {
    /// 対象エントリ
    pub entry: AuditLogEntry,
    /// チェーン済みか
    pub chained: bool,
    /// 直前のエントリ
    pub previous: Option<AuditLogEntry>,
    /// 直後のエントリ
    pub next: Option<AuditLogEntry>,
    /// 直前エントリとの連結が正しいか（未チェーンはNone）
    pub previous_link_valid: Option<bool>,
    /// 直後エントリとの連結が正しいか（直後が無ければNone）
    pub next_link_valid: Option<bool>,
    /// 対象エントリ自身の違反
    pub flags: Vec<ChainFlag>,
}

/// DB上の台帳の検証
#[derive(Clone)]
pub struct ChainVerifier {
    storage: AuditLogStorage,
    page_size: i64,
}

impl ChainVerifier {
    /// 新しいChainVerifierを作成
    pub fn new(storage: AuditLogStorage, page_size: u64) -> Self {
        Self {
            storage,
            page_size: page_size.clamp(1, i64::MAX as u64) as i64,
        }
    }

    /// 末尾から指定件数を検証
    pub async fn quick_verify(&self, sample_size: u64) -> LedgerResult<VerificationReport> {
        self.verify(VerifyMode::Quick { sample_size }).await
    }

    /// 全件を検証
    pub async fn full_verify(&self) -> LedgerResult<VerificationReport> {
        self.verify(VerifyMode::Full).await
    }

    /// チェーン位置の範囲を検証
    pub async fn verify_range(&self, from: i64, to: i64) -> LedgerResult<VerificationReport> {
        self.verify(VerifyMode::Range { from, to }).await
    }

    /// 指定モードで検証
    pub async fn verify(&self, mode: VerifyMode) -> LedgerResult<VerificationReport> {
        let started = Instant::now();
        let unchained = self.storage.count_unchained().await?;

        let (from, to) = match mode {
            VerifyMode::Full => (1, i64::MAX),
            VerifyMode::Quick { sample_size } => match self.storage.get_tail().await? {
                None => (1, 0),
                Some(tail) => {
                    let sample = i64::try_from(sample_size.max(1)).unwrap_or(i64::MAX);
                    ((tail.chain_index - sample + 1).max(1), tail.chain_index)
                }
            },
            VerifyMode::Range { from, to } => {
                if from < 1 || from > to {
                    return Err(LedgerError::Validation(format!(
                        "invalid chain index range {}..={}",
                        from, to
                    )));
                }
                (from, to)
            }
        };

        let anchor = if from > 1 {
            self.storage.latest_before(from).await?
        } else {
            None
        };
        let mut checker = ChainChecker::new(anchor.as_ref());

        let mut after = from - 1;
        while after < to {
            let page = self
                .storage
                .chained_page(after, to, self.page_size)
                .await?;
            let Some(last) = page.last().and_then(|e| e.chain_index) else {
                break;
            };
            for entry in &page {
                checker.check(entry);
            }
            if (page.len() as i64) < self.page_size {
                break;
            }
            after = last;
        }

        let report = checker.finish(mode, unchained, started);

        if report.valid {
            info!(
                mode = %report.mode,
                total = report.total_records,
                unchained = report.unchained_records,
                duration_ms = report.duration_ms,
                "Audit chain verified"
            );
        } else {
            warn!(
                mode = %report.mode,
                total = report.total_records,
                invalid = report.invalid_records,
                duration_ms = report.duration_ms,
                "Audit chain integrity violations detected"
            );
        }

        Ok(report)
    }

    /// 1エントリのチェーン上の文脈を取得
    pub async fn inspect_entry(&self, id: i64) -> LedgerResult<ChainContext> {
        let entry = self
            .storage
            .get_by_id(id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("audit entry {}", id)))?;

        let Some(chain_index) = entry.chain_index else {
            return Ok(ChainContext {
                entry,
                chained: false,
                previous: None,
                next: None,
                previous_link_valid: None,
                next_link_valid: None,
                flags: Vec::new(),
            });
        };

        let previous = self.storage.latest_before(chain_index).await?;
        let next = self.storage.earliest_after(chain_index).await?;

        let previous_ref = previous.as_ref().and_then(|p| {
            p.chain_index
                .map(|index| (index, p.current_hash.as_deref().unwrap_or_default()))
        });
        let flags = entry_flags(&entry, previous_ref);
        let previous_link_valid = Some(
            !flags.contains(&ChainFlag::LinkBroken) && !flags.contains(&ChainFlag::ChainIndexGap),
        );

        let next_link_valid = next.as_ref().map(|n| {
            n.chain_index == Some(chain_index + 1)
                && n.prev_hash.is_some()
                && n.prev_hash == entry.current_hash
        });

        Ok(ChainContext {
            entry,
            chained: true,
            previous,
            next,
            previous_link_valid,
            next_link_valid,
            flags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::appender::ChainAppender;
    use crate::audit::types::NewAuditEvent;
    use crate::db::test_utils::{tamper, test_db_pool};
    use std::time::Duration;

    async fn ledger_with(count: usize, page_size: u64) -> (ChainAppender, ChainVerifier) {
        let storage = AuditLogStorage::new(test_db_pool().await);
        let appender = ChainAppender::new(storage.clone(), Duration::from_secs(5));
        for i in 0..count {
            appender
                .append(
                    NewAuditEvent::new("RISK_UPDATE")
                        .user(1)
                        .entity("risk_register", "1")
                        .description(format!("update {}", i)),
                )
                .await
                .unwrap();
        }
        (appender, ChainVerifier::new(storage, page_size))
    }

    #[tokio::test]
    async fn test_empty_ledger_is_valid() {
        let (_, verifier) = ledger_with(0, 1000).await;
        let report = verifier.full_verify().await.unwrap();
        assert!(report.valid);
        assert_eq!(report.total_records, 0);
        assert!(report.first_chain_index.is_none());

        let quick = verifier.quick_verify(100).await.unwrap();
        assert!(quick.valid);
        assert_eq!(quick.total_records, 0);
    }

    #[tokio::test]
    async fn test_full_verify_across_pages() {
        let (_, verifier) = ledger_with(7, 3).await;
        let report = verifier.full_verify().await.unwrap();
        assert!(report.valid);
        assert_eq!(report.total_records, 7);
        assert_eq!(report.valid_records, 7);
        assert_eq!(report.first_chain_index, Some(1));
        assert_eq!(report.last_chain_index, Some(7));
    }

    #[tokio::test]
    async fn test_quick_verify_uses_anchor() {
        let (_, verifier) = ledger_with(10, 1000).await;
        let report = verifier.quick_verify(3).await.unwrap();
        assert!(report.valid);
        assert_eq!(report.total_records, 3);
        assert_eq!(report.first_chain_index, Some(8));
        assert_eq!(report.last_chain_index, Some(10));
    }

    #[tokio::test]
    async fn test_tampered_description_flags_only_that_entry() {
        let (appender, verifier) = ledger_with(3, 1000).await;
        tamper(
            appender.storage().pool(),
            "UPDATE audit_log_entries SET description = 'rewritten' WHERE chain_index = 2",
        )
        .await;

        let report = verifier.full_verify().await.unwrap();
        assert!(!report.valid);
        assert_eq!(report.invalid_records, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].chain_index, 2);
        assert_eq!(report.errors[0].errors, vec![ChainFlag::DataTampered]);
    }

    #[tokio::test]
    async fn test_rewritten_hashes_break_the_next_link() {
        let (appender, verifier) = ledger_with(3, 1000).await;
        tamper(
            appender.storage().pool(),
            "UPDATE audit_log_entries SET current_hash = 'rewritten' WHERE chain_index = 2",
        )
        .await;

        let report = verifier.full_verify().await.unwrap();
        let flagged: Vec<_> = report
            .errors
            .iter()
            .map(|e| (e.chain_index, e.errors.clone()))
            .collect();
        assert_eq!(
            flagged,
            vec![
                (2, vec![ChainFlag::HashMismatch]),
                (3, vec![ChainFlag::LinkBroken]),
            ]
        );
    }

    #[tokio::test]
    async fn test_deleted_entry_is_a_gap() {
        let (appender, verifier) = ledger_with(4, 1000).await;
        tamper(
            appender.storage().pool(),
            "DELETE FROM audit_log_entries WHERE chain_index = 2",
        )
        .await;

        let report = verifier.full_verify().await.unwrap();
        assert_eq!(report.total_records, 3);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].chain_index, 3);
        assert_eq!(
            report.errors[0].errors,
            vec![ChainFlag::ChainIndexGap, ChainFlag::LinkBroken]
        );
    }

    #[tokio::test]
    async fn test_deleted_first_entry_is_detected() {
        let (appender, verifier) = ledger_with(2, 1000).await;
        tamper(
            appender.storage().pool(),
            "DELETE FROM audit_log_entries WHERE chain_index = 1",
        )
        .await;

        let report = verifier.full_verify().await.unwrap();
        assert!(!report.valid);
        assert_eq!(report.errors[0].chain_index, 2);
        assert!(report.errors[0].errors.contains(&ChainFlag::ChainIndexGap));
    }

    #[tokio::test]
    async fn test_range_validation() {
        let (_, verifier) = ledger_with(2, 1000).await;
        assert!(matches!(
            verifier.verify_range(3, 1).await.unwrap_err(),
            LedgerError::Validation(_)
        ));
        assert!(verifier.verify_range(0, 1).await.is_err());

        let report = verifier.verify_range(2, 2).await.unwrap();
        assert!(report.valid);
        assert_eq!(report.total_records, 1);
    }

    #[tokio::test]
    async fn test_errors_are_capped() {
        let (appender, verifier) = ledger_with(MAX_REPORTED_ERRORS + 5, 1000).await;
        tamper(
            appender.storage().pool(),
            "UPDATE audit_log_entries SET description = 'x'",
        )
        .await;

        let report = verifier.full_verify().await.unwrap();
        assert_eq!(report.invalid_records, (MAX_REPORTED_ERRORS + 5) as u64);
        assert_eq!(report.errors.len(), MAX_REPORTED_ERRORS);
        assert!(report.errors_truncated);
    }

    #[tokio::test]
    async fn test_report_serializes_camel_case() {
        let (_, verifier) = ledger_with(1, 1000).await;
        let report = verifier.quick_verify(10).await.unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["valid"], true);
        assert_eq!(json["totalRecords"], 1);
        assert_eq!(json["mode"]["type"], "quick");
        assert_eq!(json["mode"]["sampleSize"], 10);
        assert!(json.get("errorsTruncated").is_some());
        assert!(json.get("verifiedAt").is_some());
    }

    #[tokio::test]
    async fn test_inspect_entry_context() {
        let (appender, verifier) = ledger_with(3, 1000).await;
        let middle = appender.storage().get_by_chain_index(2).await.unwrap().unwrap();

        let context = verifier.inspect_entry(middle.id).await.unwrap();
        assert!(context.chained);
        assert_eq!(context.previous.unwrap().chain_index, Some(1));
        assert_eq!(context.next.unwrap().chain_index, Some(3));
        assert_eq!(context.previous_link_valid, Some(true));
        assert_eq!(context.next_link_valid, Some(true));
        assert!(context.flags.is_empty());

        let last = appender.storage().get_by_chain_index(3).await.unwrap().unwrap();
        let context = verifier.inspect_entry(last.id).await.unwrap();
        assert!(context.next.is_none());
        assert_eq!(context.next_link_valid, None);

        assert!(matches!(
            verifier.inspect_entry(9999).await.unwrap_err(),
            LedgerError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_verify_does_not_mutate() {
        let (appender, verifier) = ledger_with(3, 1000).await;
        let before = appender.storage().get_tail().await.unwrap();
        verifier.full_verify().await.unwrap();
        verifier.quick_verify(2).await.unwrap();
        assert_eq!(appender.storage().get_tail().await.unwrap(), before);
        assert_eq!(appender.storage().count_all().await.unwrap(), 3);
    }
}
