//! ハッシュチェーン付き監査台帳
//!
//! 業務操作の監査イベントを追記専用で記録し、各エントリを直前のエントリと
//! ハッシュで連結して改ざんを検出可能にする。

/// 監査台帳の型定義
pub mod types;

/// 業務フィールドの正規化
pub mod canonical;

/// SHA-256ハッシュチェーン
pub mod hash_chain;

/// チェーン追記
pub mod appender;

/// 非同期ライター
pub mod writer;

/// チェーン検証
pub mod verifier;

/// チェーン導入前データのバックフィル
pub mod backfill;

/// 統計・インスペクションレポート
pub mod report;

/// インメモリ台帳
pub mod memory;
