//! ロギング初期化ユーティリティ
//!
//! `QMS_LEDGER_LOG_LEVEL` または `RUST_LOG` から
//! フィルタを構築し、tracing-subscriber の fmt レイヤーを一度だけ登録する。

use crate::config::get_env;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 既定のログレベル
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// 環境変数からフィルタ文字列を決定する
pub fn filter_directive() -> String {
    get_env("QMS_LEDGER_LOG_LEVEL")
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string())
}

/// グローバルsubscriberを初期化する
///
/// 二重初期化はエラーとして返す（テストや組み込み利用時に呼び出し側で無視できる）。
pub fn init() -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_new(filter_directive())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .try_init()
}
