//! バックフィル実行の排他制御（シングル実行制約）
//!
//! 同一データベースに対するバックフィルの重複起動を防止するファイルロック機構。
//!
//! # 機能
//!
//! - クロスプラットフォームファイルロック（fs2）
//! - ロックファイルにJSON形式でPID・開始時刻・対象データベースを記録
//! - 残留ロックの自動検出と解除（PID検証）
//! - 異常終了時もDropで解除

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// ロックファイルに保存される実行情報
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockInfo {
    /// 実行プロセスのPID
    pub pid: u32,
    /// 実行開始時刻（UTC）
    pub started_at: DateTime<Utc>,
    /// 対象データベース
    pub database: String,
}

/// ロック操作に関するエラー型
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// 同一データベースで既にバックフィルが実行中
    #[error("Backfill already running for {database} (PID: {pid}, started: {started_at})")]
    AlreadyRunning {
        /// 対象データベース
        database: String,
        /// 既存プロセスのPID
        pid: u32,
        /// 開始時刻
        started_at: DateTime<Utc>,
    },

    /// ロック取得に失敗
    #[error("Failed to acquire backfill lock: {0}")]
    AcquireFailed(#[source] std::io::Error),

    /// ロック解除に失敗
    #[error("Failed to release backfill lock: {0}")]
    ReleaseFailed(#[source] std::io::Error),

    /// ロックファイルが破損
    #[error("Lock file corrupted: {0}")]
    Corrupted(String),

    /// ロックディレクトリの作成に失敗
    #[error("Failed to create lock directory: {0}")]
    DirectoryCreationFailed(#[source] std::io::Error),
}

/// ロックディレクトリのパスを取得
///
/// OS標準の一時ディレクトリ配下の `qms-ledger` ディレクトリ。
pub fn lock_dir() -> PathBuf {
    std::env::temp_dir().join("qms-ledger")
}

/// データベースURLに対応するバックフィルロックのパス
///
/// URLのSHA-256先頭16桁をファイル名に使う（例: `/tmp/qms-ledger/backfill_3f2a....lock`）。
pub fn lock_path(database_url: &str) -> PathBuf {
    let digest = format!("{:x}", Sha256::digest(database_url.as_bytes()));
    lock_dir().join(format!("backfill_{}.lock", &digest[..16]))
}

/// 指定PIDのプロセスが存在するか確認
pub fn is_process_running(pid: u32) -> bool {
    use sysinfo::{Pid, ProcessesToUpdate, System};

    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system.process(Pid::from_u32(pid)).is_some()
}

/// ロックファイルからロック情報を読み取る
///
/// - `Ok(None)`: ロックファイルが存在しない
/// - `Err(LockError::Corrupted)`: 読み取れない、またはJSONが不正
pub fn read_lock_info(path: &Path) -> Result<Option<LockInfo>, LockError> {
    if !path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| LockError::Corrupted(format!("Failed to read lock file: {}", e)))?;

    let info: LockInfo = serde_json::from_str(&content)
        .map_err(|e| LockError::Corrupted(format!("Invalid JSON in lock file: {}", e)))?;

    Ok(Some(info))
}

/// バックフィル実行ロック
///
/// RAIIパターンでロック解除を保証する。
/// スコープを抜けるか、明示的に`release()`を呼び出すとロックが解除される。
pub struct RunLock {
    lock_file: Option<File>,
    lock_path: PathBuf,
    info: LockInfo,
}

impl std::fmt::Debug for RunLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLock")
            .field("lock_path", &self.lock_path)
            .field("info", &self.info)
            .finish()
    }
}

impl RunLock {
    /// データベースURLから導出したパスでロックを取得する
    pub fn acquire(database_url: &str) -> Result<Self, LockError> {
        Self::acquire_at(lock_path(database_url), database_url)
    }

    /// 指定パスでロックを取得する
    ///
    /// ロックファイルが存在し、記録されたPIDのプロセスが存在しない場合は
    /// 残留ロックとして削除し、新しいロックを取得する。
    pub fn acquire_at(path: PathBuf, database: &str) -> Result<Self, LockError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(LockError::DirectoryCreationFailed)?;
        }

        if let Some(existing) = read_lock_info(&path)? {
            if is_process_running(existing.pid) {
                return Err(LockError::AlreadyRunning {
                    database: existing.database,
                    pid: existing.pid,
                    started_at: existing.started_at,
                });
            }
            warn!(
                "Stale backfill lock detected (PID {} not running), cleaning up",
                existing.pid
            );
            std::fs::remove_file(&path).map_err(LockError::AcquireFailed)?;
        }

        let mut file = File::create(&path).map_err(LockError::AcquireFailed)?;

        file.try_lock_exclusive().map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock {
                LockError::AcquireFailed(std::io::Error::new(
                    std::io::ErrorKind::WouldBlock,
                    "Lock is held by another process",
                ))
            } else {
                LockError::AcquireFailed(e)
            }
        })?;

        let info = LockInfo {
            pid: std::process::id(),
            started_at: Utc::now(),
            database: database.to_string(),
        };

        let json = serde_json::to_string_pretty(&info)
            .map_err(|e| LockError::AcquireFailed(std::io::Error::other(e)))?;
        file.write_all(json.as_bytes())
            .map_err(LockError::AcquireFailed)?;
        file.flush().map_err(LockError::AcquireFailed)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&path, permissions).map_err(LockError::AcquireFailed)?;
        }

        debug!(
            "Backfill lock acquired at {} (PID: {})",
            path.display(),
            info.pid
        );

        Ok(Self {
            lock_file: Some(file),
            lock_path: path,
            info,
        })
    }

    /// ロック情報への参照を取得
    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    /// ロックファイルのパス
    pub fn path(&self) -> &Path {
        &self.lock_path
    }

    /// ロックを明示的に解除する
    pub fn release(mut self) -> Result<(), LockError> {
        self.release_internal()
    }

    fn release_internal(&mut self) -> Result<(), LockError> {
        if let Some(file) = self.lock_file.take() {
            file.unlock().map_err(LockError::ReleaseFailed)?;
            drop(file);

            if self.lock_path.exists() {
                std::fs::remove_file(&self.lock_path).map_err(LockError::ReleaseFailed)?;
            }

            debug!("Backfill lock released at {}", self.lock_path.display());
        }
        Ok(())
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = self.release_internal() {
            // panicしない - エラーはログのみ
            tracing::error!("Failed to release backfill lock on drop: {}", e);
        }
    }
}
