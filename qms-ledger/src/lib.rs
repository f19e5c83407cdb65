//! QMS audit ledger
//!
//! 品質マネジメントシステムの監査イベントを、ハッシュチェーンで連結した
//! 追記専用台帳として記録・検証する。

#![warn(missing_docs)]

/// 共通型定義
pub mod common;

/// 設定管理（環境変数ヘルパー）
pub mod config;

/// ロギング初期化ユーティリティ
pub mod logging;

/// データベースアクセス
pub mod db;

/// 監査台帳
pub mod audit;

/// バックフィル実行の排他制御
pub mod lock;

/// CLIインターフェース
pub mod cli;

use audit::appender::ChainAppender;
use audit::backfill::{BackfillOptions, BackfillSummary, Backfiller};
use audit::report::{InspectionReport, LedgerStats};
use audit::types::{AuditLogEntry, NewAuditEvent};
use audit::verifier::{ChainVerifier, VerificationReport, VerifyMode};
use audit::writer::{AuditLogWriter, AuditLogWriterConfig};
use common::error::LedgerResult;
use config::LedgerConfig;
use db::audit_log::AuditLogStorage;

/// 台帳の状態（業務側・運用ツールの入口）
#[derive(Clone)]
pub struct Ledger {
    /// 設定
    pub config: LedgerConfig,
    /// 監査台帳ストレージ
    pub storage: AuditLogStorage,
    /// チェーン追記
    pub appender: ChainAppender,
    /// チェーン検証
    pub verifier: ChainVerifier,
}

impl Ledger {
    /// データベースを開いてマイグレーションを適用する
    pub async fn open(config: LedgerConfig) -> LedgerResult<Self> {
        let pool =
            db::migrations::initialize_database(&config.database_url, config.busy_timeout).await?;
        Ok(Self::from_pool(pool, config))
    }

    /// 既存の接続プールから作成（マイグレーション済みであること）
    pub fn from_pool(pool: sqlx::SqlitePool, config: LedgerConfig) -> Self {
        let storage = AuditLogStorage::new(pool);
        let appender = ChainAppender::new(storage.clone(), config.append_timeout);
        let verifier = ChainVerifier::new(storage.clone(), config.verify_page_size);
        Self {
            config,
            storage,
            appender,
            verifier,
        }
    }

    /// 監査イベントを記録する
    pub async fn record_event(&self, event: NewAuditEvent) -> LedgerResult<AuditLogEntry> {
        self.appender.append(event).await
    }

    /// チェーンを検証する（`sample_size`省略時は設定値）
    pub async fn verify_chain(
        &self,
        full: bool,
        sample_size: Option<u64>,
    ) -> LedgerResult<VerificationReport> {
        let mode = if full {
            VerifyMode::Full
        } else {
            VerifyMode::Quick {
                sample_size: sample_size.unwrap_or(self.config.quick_verify_size),
            }
        };
        self.verifier.verify(mode).await
    }

    /// 設定値でバックフィルを実行する
    pub async fn run_backfill(&self) -> LedgerResult<BackfillSummary> {
        self.backfiller(BackfillOptions::from_config(&self.config))
            .run()
            .await
    }

    /// 指定設定のバックフィル実行器
    pub fn backfiller(&self, options: BackfillOptions) -> Backfiller {
        Backfiller::new(self.storage.clone(), self.config.database_url.clone(), options)
    }

    /// 非同期ライターを起動する
    pub fn writer(&self, config: AuditLogWriterConfig) -> AuditLogWriter {
        AuditLogWriter::new(self.appender.clone(), config)
    }

    /// 台帳統計
    pub async fn stats(&self) -> LedgerResult<LedgerStats> {
        audit::report::ledger_stats(&self.storage).await
    }

    /// インスペクションレポート
    pub async fn inspection_report(&self) -> LedgerResult<InspectionReport> {
        audit::report::inspection_report(&self.storage, &self.verifier).await
    }
}
