//! 業務フィールドの正規化シリアライズ
//!
//! dataHashの入力となるバイト列を決定的に生成する。
//!
//! - 対象キーは `action, createdAt, description, entity, entityId, metadata, userId` の7つ
//! - 欠損値は `null`（キー自体は常に出力）
//! - オブジェクトのキーは再帰的に辞書順へ並べ替える（入力順・ストレージ順に依存しない）
//! - 区切り文字に空白を入れない
//! - 時刻はUTCマイクロ秒精度のRFC 3339（例: `2026-02-10T12:00:00.000000Z`）

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::audit::types::EventFields;

/// 正規化形式の時刻表現
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// 業務フィールドを正規化JSON文字列に変換する
pub fn canonicalize(fields: &EventFields<'_>) -> String {
    let value = json!({
        "action": fields.action,
        "createdAt": format_timestamp(&fields.created_at),
        "description": fields.description,
        "entity": fields.entity,
        "entityId": fields.entity_id,
        "metadata": fields.metadata,
        "userId": fields.user_id,
    });

    let mut out = String::with_capacity(256);
    write_canonical(&mut out, &value);
    out
}

/// 任意のJSON値を正規化形式で書き出す
pub fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::from(key.as_str()).to_string());
                out.push(':');
                write_canonical(out, &map[key]);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
