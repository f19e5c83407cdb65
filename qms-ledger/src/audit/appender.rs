//! チェーン追記
//!
//! 1件の記録要求を「台帳ロック → 末尾読み取り → 連結 → 挿入 → コミット」の
//! 単一トランザクションで確定させる。同一プロセス内はMutexで、
//! プロセス間は台帳ロック行への書き込み（SQLiteの書き込みロック）で直列化する。
//! タイムアウトは台帳ロック獲得までの待ちにのみ適用する。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Sqlite, Transaction};
use tokio::sync::Mutex;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::audit::hash_chain::{compute_data_hash, next_link};
use crate::audit::types::{AuditLogEntry, NewAuditEvent, PreparedEvent};
use crate::common::error::{LedgerError, LedgerResult};
use crate::db::audit_log::{self, AuditLogStorage};

/// 監査イベントの記録先
///
/// 業務側はこのトレイト越しに記録する。本番はDB上の`ChainAppender`、
/// テストはインメモリの`MemoryLedger`を差し込める。
#[async_trait]
pub trait AuditRecorder: Send + Sync {
    /// イベントを記録し、チェーン連結済みのエントリを返す
    async fn record_event(&self, event: NewAuditEvent) -> LedgerResult<AuditLogEntry>;
}

/// DBに対するチェーン追記
#[derive(Clone)]
pub struct ChainAppender {
    storage: AuditLogStorage,
    tail_guard: Arc<Mutex<()>>,
    append_timeout: Duration,
    holder: String,
}

impl ChainAppender {
    /// 新しいChainAppenderを作成
    pub fn new(storage: AuditLogStorage, append_timeout: Duration) -> Self {
        Self {
            storage,
            tail_guard: Arc::new(Mutex::new(())),
            append_timeout,
            holder: format!("appender:{}", std::process::id()),
        }
    }

    /// ストレージへの参照
    pub fn storage(&self) -> &AuditLogStorage {
        &self.storage
    }

    /// イベントを検証・正規化してチェーン末尾に追記する
    ///
    /// タイムアウトは末尾の獲得待ち（プロセス内ガードと台帳ロック）にのみ適用する。
    /// 台帳ロック獲得後の末尾読み取り・挿入・コミットは中断しないため、
    /// `Timeout` が返った場合は何もコミットされておらず、チェーン位置も消費されない。
    pub async fn append(&self, event: NewAuditEvent) -> LedgerResult<AuditLogEntry> {
        let prepared = event.prepare(Utc::now())?;
        let data_hash = compute_data_hash(&prepared.fields());
        let deadline = Instant::now() + self.append_timeout;

        let _guard = timeout_at(deadline, self.tail_guard.lock())
            .await
            .map_err(|_| self.lock_timeout(&prepared))?;

        let mut tx = self
            .storage
            .pool()
            .begin()
            .await
            .map_err(|e| LedgerError::database("Failed to begin transaction", e))?;

        // 打ち切られた場合はtxのDropでロールバックされる
        timeout_at(deadline, audit_log::lock_ledger(&mut tx, &self.holder))
            .await
            .map_err(|_| self.lock_timeout(&prepared))??;

        self.write_locked(tx, &prepared, data_hash).await
    }

    fn lock_timeout(&self, prepared: &PreparedEvent) -> LedgerError {
        warn!(
            action = %prepared.action,
            timeout_ms = self.append_timeout.as_millis() as u64,
            "Timed out waiting for the ledger lock; nothing was written"
        );
        LedgerError::Timeout(format!(
            "ledger lock not acquired within {} ms",
            self.append_timeout.as_millis()
        ))
    }

    async fn write_locked(
        &self,
        mut tx: Transaction<'static, Sqlite>,
        prepared: &PreparedEvent,
        data_hash: String,
    ) -> LedgerResult<AuditLogEntry> {
        let tail = audit_log::read_tail(&mut tx).await?;
        let link = next_link(&tail, data_hash);
        let id = audit_log::insert_entry(&mut tx, prepared, Some(&link)).await?;

        tx.commit()
            .await
            .map_err(|e| LedgerError::database("Failed to commit audit entry", e))?;

        debug!(
            id,
            chain_index = link.chain_index,
            action = %prepared.action,
            "Appended audit entry"
        );

        Ok(AuditLogEntry::from_parts(id, prepared.clone(), Some(link)))
    }
}

#[async_trait]
impl AuditRecorder for ChainAppender {
    async fn record_event(&self, event: NewAuditEvent) -> LedgerResult<AuditLogEntry> {
        self.append(event).await
    }
}
