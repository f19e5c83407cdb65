//! Configuration management via environment variables
//!
//! Provides helper functions for reading `QMS_LEDGER_*` environment variables
//! and the ledger settings built on top of them.

use std::time::Duration;

/// デフォルトのデータベースURL
pub const DEFAULT_DATABASE_URL: &str = "sqlite:data/qms-ledger.db";

/// Get an environment variable, treating an empty value as unset
///
/// # Example
/// ```
/// use qms_ledger::config::get_env;
///
/// let url = get_env("QMS_LEDGER_DATABASE_URL");
/// ```
pub fn get_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Get an environment variable with a default value
pub fn get_env_or(name: &str, default: &str) -> String {
    get_env(name).unwrap_or_else(|| default.to_string())
}

/// Get an environment variable, parsing to a specific type
///
/// Returns `default` if the variable is unset or parsing fails.
pub fn get_env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match get_env(name) {
        Some(value) => value.parse().unwrap_or_else(|_| {
            tracing::warn!(
                "Environment variable '{}' has invalid value '{}', using default",
                name,
                value
            );
            default
        }),
        None => default,
    }
}

/// 真偽値の環境変数を取得（`true/1/yes/on` で有効）
pub fn get_env_flag(name: &str, default: bool) -> bool {
    get_env(name)
        .map(|value| {
            matches!(
                value.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

/// 台帳設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    /// データベースURL
    pub database_url: String,
    /// 追記クリティカルセクションの上限時間
    pub append_timeout: Duration,
    /// SQLiteのbusy_timeout（書き込みロック待ち）
    pub busy_timeout: Duration,
    /// クイック検証の既定件数
    pub quick_verify_size: u64,
    /// 検証時の読み取りページサイズ
    pub verify_page_size: u64,
    /// バックフィルのバッチサイズ
    pub backfill_batch_size: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            append_timeout: Duration::from_millis(5_000),
            busy_timeout: Duration::from_millis(5_000),
            quick_verify_size: 100,
            verify_page_size: 1_000,
            backfill_batch_size: 500,
        }
    }
}

impl LedgerConfig {
    /// Load ledger configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: get_env_or("QMS_LEDGER_DATABASE_URL", &defaults.database_url),
            append_timeout: Duration::from_millis(get_env_parse(
                "QMS_LEDGER_APPEND_TIMEOUT_MS",
                5_000u64,
            )),
            busy_timeout: Duration::from_millis(get_env_parse(
                "QMS_LEDGER_BUSY_TIMEOUT_MS",
                5_000u64,
            )),
            quick_verify_size: get_env_parse(
                "QMS_LEDGER_QUICK_VERIFY_SIZE",
                defaults.quick_verify_size,
            )
            .max(1),
            verify_page_size: get_env_parse(
                "QMS_LEDGER_VERIFY_PAGE_SIZE",
                defaults.verify_page_size,
            )
            .max(1),
            backfill_batch_size: get_env_parse(
                "QMS_LEDGER_BACKFILL_BATCH_SIZE",
                defaults.backfill_batch_size,
            )
            .max(1),
        }
    }
}
