//! SHA-256ハッシュチェーン
//!
//! 各エントリは業務フィールドのdataHashと、直前エントリのcurrentHashを
//! 連結したchainHashを持つ。途中の1件を書き換えると、そのエントリの
//! dataHashと以降のprevHash連結が一致しなくなる。

use sha2::{Digest, Sha256};

use crate::audit::canonical::canonicalize;
use crate::audit::types::{ChainLink, EventFields, LedgerTail};

/// 先頭エントリのprev_hash（ゼロハッシュ）
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// バイト列のSHA-256（小文字16進64桁）
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// 業務フィールドのハッシュ
pub fn compute_data_hash(fields: &EventFields<'_>) -> String {
    sha256_hex(canonicalize(fields).as_bytes())
}

/// チェーンハッシュ
///
/// `SHA-256(decimal(chain_index) || prev_hash || data_hash)`（区切り文字なし）
pub fn compute_chain_hash(chain_index: i64, prev_hash: &str, data_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(chain_index.to_string().as_bytes());
    hasher.update(prev_hash.as_bytes());
    hasher.update(data_hash.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// 末尾に続く連結情報を作る
pub fn next_link(tail: &LedgerTail, data_hash: String) -> ChainLink {
    let chain_index = tail.chain_index + 1;
    let current_hash = compute_chain_hash(chain_index, &tail.current_hash, &data_hash);
    ChainLink {
        chain_index,
        prev_hash: tail.current_hash.clone(),
        current_hash,
        data_hash,
    }
}
