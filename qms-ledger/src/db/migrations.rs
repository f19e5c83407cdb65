//! データベース初期化とマイグレーション実行

use crate::common::error::{LedgerError, LedgerResult};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// 接続プールの最大接続数
pub const DEFAULT_MAX_CONNECTIONS: u32 = 8;

/// SQLiteデータベース接続プールを作成してマイグレーションを実行
///
/// # Arguments
/// * `database_url` - データベースURL（例: "sqlite:data/qms-ledger.db"）
/// * `busy_timeout` - 書き込みロック待ちの上限
///
/// ファイルDBの場合は親ディレクトリとDBファイルを作成し、WALモードで開く。
pub async fn initialize_database(
    database_url: &str,
    busy_timeout: Duration,
) -> LedgerResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| LedgerError::database("Invalid database URL", e))?
        .create_if_missing(true)
        .busy_timeout(busy_timeout);

    let in_memory = is_in_memory(database_url);
    let options = if in_memory {
        options
    } else {
        ensure_parent_dir(options.get_filename())?;
        options.journal_mode(SqliteJournalMode::Wal)
    };

    // インメモリDBは接続ごとに別DBになるため1接続に制限する
    let max_connections = if in_memory { 1 } else { DEFAULT_MAX_CONNECTIONS };

    tracing::debug!(database_url, max_connections, "Opening ledger database");

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .map_err(|e| LedgerError::database("Failed to connect to database", e))?;

    run_migrations(&pool).await?;

    Ok(pool)
}

/// マイグレーションを実行（sqlx::migrate!マクロを使用）
pub async fn run_migrations(pool: &SqlitePool) -> LedgerResult<()> {
    tracing::debug!("Running database migrations");

    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| LedgerError::Database(format!("Failed to run migrations: {}", e)))?;

    tracing::debug!("Database migrations completed successfully");
    Ok(())
}

fn is_in_memory(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

fn ensure_parent_dir(path: &Path) -> LedgerResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| {
                LedgerError::Database(format!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
    }
    Ok(())
}
