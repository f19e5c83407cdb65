//! 監査台帳の型定義

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audit::hash_chain::GENESIS_HASH;
use crate::common::error::{LedgerError, LedgerResult};

/// 重要度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// 通常操作
    Info,
    /// 注意が必要な操作
    Warning,
    /// 製品品質に影響する操作
    Critical,
    /// アクセス権・セッション関連
    Security,
}

impl Severity {
    /// DB・レポート用の文字列表現
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
            Self::Security => "SECURITY",
        }
    }

    /// アクション名から重要度を決定する（未登録のアクションはINFO）
    pub fn for_action(action: &str) -> Self {
        match action {
            "DOCUMENT_APPROVE"
            | "DOCUMENT_MAKE_EFFECTIVE"
            | "NC_CREATE"
            | "NC_DISPOSITION"
            | "CAPA_CLOSE"
            | "PRODUCT_QC_PASS"
            | "PRODUCT_QC_FAIL"
            | "SUPPLIER_APPROVE"
            | "SUPPLIER_SUSPEND"
            | "EQUIPMENT_OVERDUE"
            | "MANAGEMENT_REVIEW_CLOSE" => Self::Critical,
            "DOCUMENT_REJECT" | "NC_REOPEN" | "PRODUCTION_ENTRY_REJECT" | "RISK_ASSESS" => {
                Self::Warning
            }
            "USER_ROLE_CHANGE" | "ROLE_ABILITY_GRANT" | "ROLE_ABILITY_REVOKE"
            | "SESSION_FORCE_OFF" | "ROLE_CREATE" | "ROLE_DELETE" => Self::Security,
            _ => Self::Info,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INFO" => Ok(Self::Info),
            "WARNING" => Ok(Self::Warning),
            "CRITICAL" => Ok(Self::Critical),
            "SECURITY" => Ok(Self::Security),
            other => Err(LedgerError::Validation(format!(
                "Unknown severity: {}",
                other
            ))),
        }
    }
}

/// 記録要求（業務コントローラーから渡されるイベント）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewAuditEvent {
    /// 操作ユーザー（システムイベントはNone）
    pub user_id: Option<i64>,
    /// 名前空間付きアクション（例: `RISK_CREATE`）
    pub action: String,
    /// 対象エンティティ種別
    pub entity: Option<String>,
    /// 対象エンティティID
    pub entity_id: Option<String>,
    /// 説明
    pub description: Option<String>,
    /// 構造化属性
    pub metadata: Option<Value>,
    /// 重要度（省略時はアクションから決定）
    pub severity: Option<Severity>,
    /// 発生時刻（省略時は記録時刻）
    pub created_at: Option<DateTime<Utc>>,
}

impl NewAuditEvent {
    /// アクションのみ指定したイベントを作成
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            ..Default::default()
        }
    }

    /// 操作ユーザーを設定
    pub fn user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// 対象エンティティを設定
    pub fn entity(mut self, entity: impl Into<String>, entity_id: impl ToString) -> Self {
        self.entity = Some(entity.into());
        self.entity_id = Some(entity_id.to_string());
        self
    }

    /// 説明を設定
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// 構造化属性を設定
    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// 重要度を明示指定
    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    /// 発生時刻を明示指定
    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// 検証・正規化して永続化可能な形にする
    ///
    /// - actionは空白のみ不可
    /// - metadataはJSONオブジェクトのみ。空オブジェクトはNoneに正規化
    /// - created_atはマイクロ秒に切り捨て（保存形式とハッシュ形式を一致させる）
    pub fn prepare(self, now: DateTime<Utc>) -> LedgerResult<PreparedEvent> {
        let action = self.action.trim().to_string();
        if action.is_empty() {
            return Err(LedgerError::Validation(
                "audit event requires a non-empty action".to_string(),
            ));
        }

        let metadata = match self.metadata {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) if map.is_empty() => None,
            Some(Value::Object(map)) => Some(Value::Object(map)),
            Some(other) => {
                return Err(LedgerError::Validation(format!(
                    "metadata must be a JSON object, got {}",
                    json_type_name(&other)
                )))
            }
        };

        let severity = self
            .severity
            .unwrap_or_else(|| Severity::for_action(&action));

        Ok(PreparedEvent {
            user_id: self.user_id,
            action,
            entity: self.entity,
            entity_id: self.entity_id,
            description: self.description,
            metadata,
            severity,
            created_at: self.created_at.unwrap_or(now).trunc_subsecs(6),
        })
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// 正規化済みイベント（チェーン列を除く全業務フィールド）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedEvent {
    /// 操作ユーザー
    pub user_id: Option<i64>,
    /// アクション
    pub action: String,
    /// 対象エンティティ種別
    pub entity: Option<String>,
    /// 対象エンティティID
    pub entity_id: Option<String>,
    /// 説明
    pub description: Option<String>,
    /// 構造化属性（空でないオブジェクトのみ）
    pub metadata: Option<Value>,
    /// 重要度
    pub severity: Severity,
    /// 発生時刻（マイクロ秒精度）
    pub created_at: DateTime<Utc>,
}

impl PreparedEvent {
    /// 正規化形式の対象フィールドへの参照
    pub fn fields(&self) -> EventFields<'_> {
        EventFields {
            user_id: self.user_id,
            action: &self.action,
            entity: self.entity.as_deref(),
            entity_id: self.entity_id.as_deref(),
            description: self.description.as_deref(),
            metadata: self.metadata.as_ref(),
            created_at: self.created_at,
        }
    }
}

/// dataHashの対象となる業務フィールドのビュー
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventFields<'a> {
    /// 操作ユーザー
    pub user_id: Option<i64>,
    /// アクション
    pub action: &'a str,
    /// 対象エンティティ種別
    pub entity: Option<&'a str>,
    /// 対象エンティティID
    pub entity_id: Option<&'a str>,
    /// 説明
    pub description: Option<&'a str>,
    /// 構造化属性
    pub metadata: Option<&'a Value>,
    /// 発生時刻
    pub created_at: DateTime<Utc>,
}

/// チェーン連結情報
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLink {
    /// 1始まりのチェーン位置
    pub chain_index: i64,
    /// 直前エントリのcurrent_hash（先頭はGENESIS_HASH）
    pub prev_hash: String,
    /// SHA-256(chain_index || prev_hash || data_hash)
    pub current_hash: String,
    /// 業務フィールドのハッシュ
    pub data_hash: String,
}

/// チェーン末尾
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTail {
    /// 末尾のチェーン位置（空台帳は0）
    pub chain_index: i64,
    /// 末尾のcurrent_hash（空台帳はGENESIS_HASH）
    pub current_hash: String,
}

impl LedgerTail {
    /// 空台帳の末尾
    pub fn genesis() -> Self {
        Self {
            chain_index: 0,
            current_hash: GENESIS_HASH.to_string(),
        }
    }
}

impl From<&ChainLink> for LedgerTail {
    fn from(link: &ChainLink) -> Self {
        Self {
            chain_index: link.chain_index,
            current_hash: link.current_hash.clone(),
        }
    }
}

/// 監査台帳エントリ（1行）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    /// ストレージキー（チェーン上の意味は持たない）
    pub id: i64,
    /// チェーン位置（チェーン導入前の行はNone）
    pub chain_index: Option<i64>,
    /// 操作ユーザー
    pub user_id: Option<i64>,
    /// アクション
    pub action: String,
    /// 対象エンティティ種別
    pub entity: Option<String>,
    /// 対象エンティティID
    pub entity_id: Option<String>,
    /// 説明
    pub description: Option<String>,
    /// 構造化属性
    pub metadata: Option<Value>,
    /// 重要度
    pub severity: Severity,
    /// 発生時刻
    pub created_at: DateTime<Utc>,
    /// 業務フィールドのハッシュ
    pub data_hash: Option<String>,
    /// 直前エントリのハッシュ
    pub prev_hash: Option<String>,
    /// このエントリのチェーンハッシュ
    pub current_hash: Option<String>,
}

impl AuditLogEntry {
    /// 挿入結果からエントリを組み立てる
    pub fn from_parts(id: i64, event: PreparedEvent, link: Option<ChainLink>) -> Self {
        let (chain_index, prev_hash, current_hash, data_hash) = match link {
            Some(link) => (
                Some(link.chain_index),
                Some(link.prev_hash),
                Some(link.current_hash),
                Some(link.data_hash),
            ),
            None => (None, None, None, None),
        };
        Self {
            id,
            chain_index,
            user_id: event.user_id,
            action: event.action,
            entity: event.entity,
            entity_id: event.entity_id,
            description: event.description,
            metadata: event.metadata,
            severity: event.severity,
            created_at: event.created_at,
            data_hash,
            prev_hash,
            current_hash,
        }
    }

    /// 正規化形式の対象フィールドへの参照
    pub fn fields(&self) -> EventFields<'_> {
        EventFields {
            user_id: self.user_id,
            action: &self.action,
            entity: self.entity.as_deref(),
            entity_id: self.entity_id.as_deref(),
            description: self.description.as_deref(),
            metadata: self.metadata.as_ref(),
            created_at: self.created_at,
        }
    }

    /// チェーン済みか
    pub fn is_chained(&self) -> bool {
        self.chain_index.is_some()
    }
}

/// 監査台帳の検索フィルタ（読み取り専用の利用者向け）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditLogFilter {
    /// 操作ユーザー
    pub user_id: Option<i64>,
    /// アクション
    pub action: Option<String>,
    /// 対象エンティティ種別
    pub entity: Option<String>,
    /// 対象エンティティID
    pub entity_id: Option<String>,
    /// 重要度
    pub severity: Option<Severity>,
    /// 開始日時
    pub time_from: Option<DateTime<Utc>>,
    /// 終了日時
    pub time_to: Option<DateTime<Utc>>,
    /// ページ番号（1始まり）
    pub page: Option<i64>,
    /// ページあたり件数
    pub per_page: Option<i64>,
}
