//! インメモリ台帳
//!
//! ストレージに触れない業務側のユニットテスト用。ハッシュ計算と検証は
//! DB版と同じ関数を使う。

use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;

use crate::audit::appender::AuditRecorder;
use crate::audit::hash_chain::{compute_data_hash, next_link};
use crate::audit::types::{AuditLogEntry, LedgerTail, NewAuditEvent};
use crate::audit::verifier::{ChainChecker, VerificationReport, VerifyMode};
use crate::common::error::{LedgerError, LedgerResult};

/// インメモリの`AuditRecorder`
#[derive(Debug, Default)]
pub struct MemoryLedger {
    entries: Mutex<Vec<AuditLogEntry>>,
}

impl MemoryLedger {
    /// 空の台帳を作成
    pub fn new() -> Self {
        Self::default()
    }

    /// 既存のエントリ列から作成（検証器のテスト用）
    pub fn with_entries(entries: Vec<AuditLogEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
        }
    }

    /// 記録済みエントリのスナップショット
    pub fn entries(&self) -> Vec<AuditLogEntry> {
        self.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// 記録件数
    pub fn len(&self) -> usize {
        self.lock().map(|e| e.len()).unwrap_or_default()
    }

    /// 空か
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 全件を検証する
    pub fn verify(&self) -> LedgerResult<VerificationReport> {
        let started = Instant::now();
        let entries = self.lock()?;

        let mut chained: Vec<&AuditLogEntry> =
            entries.iter().filter(|e| e.is_chained()).collect();
        chained.sort_by_key(|e| e.chain_index);
        let unchained = (entries.len() - chained.len()) as i64;

        let mut checker = ChainChecker::new(None);
        for entry in chained {
            checker.check(entry);
        }
        Ok(checker.finish(VerifyMode::Full, unchained, started))
    }

    fn lock(&self) -> LedgerResult<std::sync::MutexGuard<'_, Vec<AuditLogEntry>>> {
        self.entries
            .lock()
            .map_err(|_| LedgerError::Internal("memory ledger lock poisoned".to_string()))
    }
}

#[async_trait]
impl AuditRecorder for MemoryLedger {
    async fn record_event(&self, event: NewAuditEvent) -> LedgerResult<AuditLogEntry> {
        let prepared = event.prepare(Utc::now())?;
        let data_hash = compute_data_hash(&prepared.fields());

        let mut entries = self.lock()?;
        let tail = entries
            .iter()
            .filter_map(|e| match (e.chain_index, &e.current_hash) {
                (Some(index), Some(hash)) => Some(LedgerTail {
                    chain_index: index,
                    current_hash: hash.clone(),
                }),
                _ => None,
            })
            .max_by_key(|t| t.chain_index)
            .unwrap_or_else(LedgerTail::genesis);

        let link = next_link(&tail, data_hash);
        let id = entries.iter().map(|e| e.id).max().unwrap_or(0) + 1;
        let entry = AuditLogEntry::from_parts(id, prepared, Some(link));
        entries.push(entry.clone());
        Ok(entry)
    }
}
