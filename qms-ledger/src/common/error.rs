//! エラー型定義
//!
//! 統一エラー型（thiserror使用）
//!
//! 追記失敗・バックフィル失敗は呼び出し元へ同期的に返す。
//! チェーン破損は例外ではなく検証レポートの結果として扱うため、ここには含まれない。

use thiserror::Error;

use crate::lock::LockError;

/// Ledger error type
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Database error (constraint violation, connection loss, ...)
    #[error("Database error: {0}")]
    Database(String),

    /// Invalid input event
    #[error("Validation error: {0}")]
    Validation(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The append critical section did not finish in time
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// A backfill batch was rolled back and the run aborted
    #[error("Backfill batch {batch} failed after {committed} committed rows: {reason}")]
    BackfillBatch {
        /// 失敗したバッチ番号（1始まり）
        batch: u64,
        /// 失敗前にコミット済みの行数
        committed: u64,
        /// 失敗理由
        reason: String,
    },

    /// Exclusive run lock could not be taken
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    /// sqlx エラーを文脈付きで変換する
    pub fn database(context: &str, err: sqlx::Error) -> Self {
        Self::Database(format!("{}: {}", context, err))
    }

    /// ログ・メトリクス用の短い分類名
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Database(_) => "database",
            Self::Validation(_) => "validation",
            Self::Serialization(_) => "serialization",
            Self::Timeout(_) => "timeout",
            Self::NotFound(_) => "not_found",
            Self::BackfillBatch { .. } => "backfill_batch",
            Self::Lock(_) => "lock",
            Self::Internal(_) => "internal",
        }
    }
}

/// Result type alias (ledger)
pub type LedgerResult<T> = Result<T, LedgerError>;
