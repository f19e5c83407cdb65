//! 監査台帳ストレージ
//!
//! プール単位の読み取りと、チェーン書き込みトランザクション内で使う
//! 接続単位の操作（台帳ロック・末尾読み取り・挿入・チェーン割り当て）を提供する。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::warn;

use crate::audit::canonical::format_timestamp;
use crate::audit::types::{
    AuditLogEntry, AuditLogFilter, ChainLink, LedgerTail, PreparedEvent, Severity,
};
use crate::common::error::{LedgerError, LedgerResult};

const ENTRY_COLUMNS: &str = "id, user_id, action, entity, entity_id, description, metadata, \
     severity, created_at, chain_index, prev_hash, current_hash, data_hash";

/// 監査台帳のDB操作
#[derive(Clone)]
pub struct AuditLogStorage {
    pool: SqlitePool,
}

/// sqlx::FromRow用の行構造体
#[derive(Debug, sqlx::FromRow)]
struct AuditLogRow {
    id: i64,
    user_id: Option<i64>,
    action: String,
    entity: Option<String>,
    entity_id: Option<String>,
    description: Option<String>,
    metadata: Option<String>,
    severity: String,
    created_at: String,
    chain_index: Option<i64>,
    prev_hash: Option<String>,
    current_hash: Option<String>,
    data_hash: Option<String>,
}

impl TryFrom<AuditLogRow> for AuditLogEntry {
    type Error = LedgerError;

    fn try_from(row: AuditLogRow) -> Result<Self, Self::Error> {
        // 読めない値は検証でDATA_TAMPEREDとして現れるよう、エラーにせず代替値にする
        let created_at = match DateTime::parse_from_rfc3339(&row.created_at) {
            Ok(dt) => dt.with_timezone(&Utc),
            Err(e) => {
                warn!(id = row.id, error = %e, "Unparseable created_at in audit entry");
                DateTime::<Utc>::MIN_UTC
            }
        };

        let metadata = match row.metadata {
            None => None,
            Some(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(id = row.id, error = %e, "Unparseable metadata in audit entry");
                    Some(Value::String(raw))
                }
            },
        };

        Ok(AuditLogEntry {
            id: row.id,
            chain_index: row.chain_index,
            user_id: row.user_id,
            action: row.action,
            entity: row.entity,
            entity_id: row.entity_id,
            description: row.description,
            metadata,
            severity: row.severity.parse()?,
            created_at,
            data_hash: row.data_hash,
            prev_hash: row.prev_hash,
            current_hash: row.current_hash,
        })
    }
}

fn rows_to_entries(rows: Vec<AuditLogRow>) -> LedgerResult<Vec<AuditLogEntry>> {
    rows.into_iter()
        .map(AuditLogEntry::try_from)
        .collect::<Result<Vec<_>, _>>()
}

/// 月次件数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyActivity {
    /// 月（YYYY-MM）
    pub month: String,
    /// エントリ数
    pub entry_count: i64,
}

/// 重要度別件数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeverityCount {
    /// 重要度
    pub severity: Severity,
    /// エントリ数
    pub entry_count: i64,
}

/// アクション別件数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionCount {
    /// アクション
    pub action: String,
    /// エントリ数
    pub entry_count: i64,
}

/// 台帳ロック行を更新して書き込みロックを取得する
///
/// チェーン書き込みトランザクションの最初の文として呼ぶこと。
/// SQLiteの書き込みロックはコミットまたはロールバックまで保持される。
pub async fn lock_ledger(conn: &mut SqliteConnection, holder: &str) -> LedgerResult<()> {
    let result = sqlx::query(
        "UPDATE audit_ledger_lock SET holder = ?, acquired_at = ? WHERE id = 1",
    )
    .bind(holder)
    .bind(format_timestamp(&Utc::now()))
    .execute(&mut *conn)
    .await
    .map_err(|e| LedgerError::database("Failed to acquire ledger lock", e))?;

    if result.rows_affected() != 1 {
        return Err(LedgerError::Internal(
            "audit_ledger_lock row is missing".to_string(),
        ));
    }
    Ok(())
}

/// チェーン末尾を読み取る（空台帳はジェネシス）
pub async fn read_tail(conn: &mut SqliteConnection) -> LedgerResult<LedgerTail> {
    let row = sqlx::query_as::<_, (i64, Option<String>)>(
        "SELECT chain_index, current_hash FROM audit_log_entries \
         WHERE chain_index IS NOT NULL ORDER BY chain_index DESC LIMIT 1",
    )
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| LedgerError::database("Failed to read ledger tail", e))?;

    match row {
        None => Ok(LedgerTail::genesis()),
        Some((chain_index, Some(current_hash))) => Ok(LedgerTail {
            chain_index,
            current_hash,
        }),
        Some((chain_index, None)) => Err(LedgerError::Internal(format!(
            "ledger tail at chain index {} has no current_hash",
            chain_index
        ))),
    }
}

/// エントリを挿入して行IDを返す（linkがNoneならチェーン列はNULL）
pub async fn insert_entry(
    conn: &mut SqliteConnection,
    event: &PreparedEvent,
    link: Option<&ChainLink>,
) -> LedgerResult<i64> {
    let metadata = event
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    let result = sqlx::query(
        r#"INSERT INTO audit_log_entries (
            user_id, action, entity, entity_id, description, metadata,
            severity, created_at, chain_index, prev_hash, current_hash, data_hash
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(event.user_id)
    .bind(&event.action)
    .bind(&event.entity)
    .bind(&event.entity_id)
    .bind(&event.description)
    .bind(metadata)
    .bind(event.severity.as_str())
    .bind(format_timestamp(&event.created_at))
    .bind(link.map(|l| l.chain_index))
    .bind(link.map(|l| l.prev_hash.as_str()))
    .bind(link.map(|l| l.current_hash.as_str()))
    .bind(link.map(|l| l.data_hash.as_str()))
    .execute(&mut *conn)
    .await
    .map_err(|e| LedgerError::database("Failed to insert audit entry", e))?;

    Ok(result.last_insert_rowid())
}

/// 未チェーン行を (created_at, id) 順に取得する
pub async fn next_unchained_batch(
    conn: &mut SqliteConnection,
    limit: i64,
) -> LedgerResult<Vec<AuditLogEntry>> {
    let sql = format!(
        "SELECT {} FROM audit_log_entries WHERE chain_index IS NULL \
         ORDER BY created_at ASC, id ASC LIMIT ?",
        ENTRY_COLUMNS
    );
    let rows = sqlx::query_as::<_, AuditLogRow>(&sql)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| LedgerError::database("Failed to read unchained entries", e))?;
    rows_to_entries(rows)
}

/// 未チェーン行にチェーン列を設定する（影響行数を返す）
///
/// 追記専用トリガーがあるため、`set_mutation_override` の後で呼ぶこと。
pub async fn assign_chain(
    conn: &mut SqliteConnection,
    id: i64,
    link: &ChainLink,
) -> LedgerResult<u64> {
    let result = sqlx::query(
        "UPDATE audit_log_entries \
         SET chain_index = ?, prev_hash = ?, current_hash = ?, data_hash = ? \
         WHERE id = ? AND chain_index IS NULL",
    )
    .bind(link.chain_index)
    .bind(&link.prev_hash)
    .bind(&link.current_hash)
    .bind(&link.data_hash)
    .bind(id)
    .execute(&mut *conn)
    .await
    .map_err(|e| LedgerError::database("Failed to assign chain columns", e))?;

    Ok(result.rows_affected())
}

/// 追記専用トリガーをこのトランザクション内で一時的に解除する
pub async fn set_mutation_override(conn: &mut SqliteConnection, reason: &str) -> LedgerResult<()> {
    sqlx::query("INSERT OR REPLACE INTO audit_mutation_override (id, reason) VALUES (1, ?)")
        .bind(reason)
        .execute(&mut *conn)
        .await
        .map_err(|e| LedgerError::database("Failed to enable mutation override", e))?;
    Ok(())
}

/// 追記専用トリガーを再び有効化する
pub async fn clear_mutation_override(conn: &mut SqliteConnection) -> LedgerResult<()> {
    sqlx::query("DELETE FROM audit_mutation_override")
        .execute(&mut *conn)
        .await
        .map_err(|e| LedgerError::database("Failed to disable mutation override", e))?;
    Ok(())
}

impl AuditLogStorage {
    /// 新しいAuditLogStorageを作成
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 接続プール
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// チェーン列なしで一括挿入する（チェーン導入前データ・フォールバック用）
    pub async fn insert_unchained(&self, events: &[PreparedEvent]) -> LedgerResult<Vec<i64>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| LedgerError::database("Failed to begin transaction", e))?;

        let mut ids = Vec::with_capacity(events.len());
        for event in events {
            ids.push(insert_entry(&mut tx, event, None).await?);
        }

        tx.commit()
            .await
            .map_err(|e| LedgerError::database("Failed to commit transaction", e))?;

        Ok(ids)
    }

    /// IDでエントリを取得
    pub async fn get_by_id(&self, id: i64) -> LedgerResult<Option<AuditLogEntry>> {
        let sql = format!("SELECT {} FROM audit_log_entries WHERE id = ?", ENTRY_COLUMNS);
        let row = sqlx::query_as::<_, AuditLogRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| LedgerError::database("Failed to get audit entry by id", e))?;

        row.map(AuditLogEntry::try_from).transpose()
    }

    /// チェーン位置でエントリを取得
    pub async fn get_by_chain_index(&self, chain_index: i64) -> LedgerResult<Option<AuditLogEntry>> {
        let sql = format!(
            "SELECT {} FROM audit_log_entries WHERE chain_index = ?",
            ENTRY_COLUMNS
        );
        let row = sqlx::query_as::<_, AuditLogRow>(&sql)
            .bind(chain_index)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| LedgerError::database("Failed to get audit entry by chain index", e))?;

        row.map(AuditLogEntry::try_from).transpose()
    }

    /// チェーン末尾（空台帳はNone）
    pub async fn get_tail(&self) -> LedgerResult<Option<LedgerTail>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| LedgerError::database("Failed to acquire connection", e))?;
        let tail = read_tail(&mut conn).await?;
        Ok((tail.chain_index > 0).then_some(tail))
    }

    /// 最小のチェーン位置
    pub async fn first_chain_index(&self) -> LedgerResult<Option<i64>> {
        sqlx::query_scalar::<_, Option<i64>>("SELECT MIN(chain_index) FROM audit_log_entries")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| LedgerError::database("Failed to get first chain index", e))
    }

    /// `after < chain_index <= upto` のチェーン済みエントリを昇順に最大limit件取得
    pub async fn chained_page(
        &self,
        after: i64,
        upto: i64,
        limit: i64,
    ) -> LedgerResult<Vec<AuditLogEntry>> {
        let sql = format!(
            "SELECT {} FROM audit_log_entries \
             WHERE chain_index > ? AND chain_index <= ? \
             ORDER BY chain_index ASC LIMIT ?",
            ENTRY_COLUMNS
        );
        let rows = sqlx::query_as::<_, AuditLogRow>(&sql)
            .bind(after)
            .bind(upto)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| LedgerError::database("Failed to read chained entries", e))?;
        rows_to_entries(rows)
    }

    /// 指定位置より前で最も近いチェーン済みエントリ
    pub async fn latest_before(&self, chain_index: i64) -> LedgerResult<Option<AuditLogEntry>> {
        let sql = format!(
            "SELECT {} FROM audit_log_entries WHERE chain_index < ? \
             ORDER BY chain_index DESC LIMIT 1",
            ENTRY_COLUMNS
        );
        let row = sqlx::query_as::<_, AuditLogRow>(&sql)
            .bind(chain_index)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| LedgerError::database("Failed to read preceding entry", e))?;

        row.map(AuditLogEntry::try_from).transpose()
    }

    /// 指定位置より後で最も近いチェーン済みエントリ
    pub async fn earliest_after(&self, chain_index: i64) -> LedgerResult<Option<AuditLogEntry>> {
        let sql = format!(
            "SELECT {} FROM audit_log_entries WHERE chain_index > ? \
             ORDER BY chain_index ASC LIMIT 1",
            ENTRY_COLUMNS
        );
        let row = sqlx::query_as::<_, AuditLogRow>(&sql)
            .bind(chain_index)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| LedgerError::database("Failed to read following entry", e))?;

        row.map(AuditLogEntry::try_from).transpose()
    }

    /// 全件数
    pub async fn count_all(&self) -> LedgerResult<i64> {
        self.count_where("1 = 1").await
    }

    /// チェーン済み件数
    pub async fn count_chained(&self) -> LedgerResult<i64> {
        self.count_where("chain_index IS NOT NULL").await
    }

    /// 未チェーン件数
    pub async fn count_unchained(&self) -> LedgerResult<i64> {
        self.count_where("chain_index IS NULL").await
    }

    async fn count_where(&self, condition: &str) -> LedgerResult<i64> {
        let sql = format!("SELECT COUNT(*) FROM audit_log_entries WHERE {}", condition);
        sqlx::query_scalar::<_, i64>(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| LedgerError::database("Failed to count audit entries", e))
    }

    /// フィルタ条件に基づいてエントリを検索（新しい順）
    pub async fn query(&self, filter: &AuditLogFilter) -> LedgerResult<Vec<AuditLogEntry>> {
        let (where_clause, bind_values) = build_where_clause(filter);
        let page = filter.page.unwrap_or(1).max(1);
        let per_page = filter.per_page.unwrap_or(50).max(1);
        let offset = (page - 1) * per_page;

        let sql = format!(
            "SELECT {} FROM audit_log_entries {} ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
            ENTRY_COLUMNS, where_clause
        );

        let mut query = sqlx::query_as::<_, AuditLogRow>(&sql);
        for val in &bind_values {
            query = match val {
                BindValue::Int(v) => query.bind(*v),
                BindValue::Text(v) => query.bind(v.as_str()),
            };
        }
        query = query.bind(per_page).bind(offset);

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| LedgerError::database("Failed to query audit entries", e))?;
        rows_to_entries(rows)
    }

    /// フィルタ条件に基づいて件数を取得
    pub async fn count(&self, filter: &AuditLogFilter) -> LedgerResult<i64> {
        let (where_clause, bind_values) = build_where_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM audit_log_entries {}", where_clause);

        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for val in &bind_values {
            query = match val {
                BindValue::Int(v) => query.bind(*v),
                BindValue::Text(v) => query.bind(v.as_str()),
            };
        }

        query
            .fetch_one(&self.pool)
            .await
            .map_err(|e| LedgerError::database("Failed to count audit entries", e))
    }

    /// 重要度別件数（`chained_only` ならチェーン済み行のみ）
    pub async fn count_by_severity(&self, chained_only: bool) -> LedgerResult<Vec<SeverityCount>> {
        let sql = format!(
            "SELECT severity, COUNT(*) FROM audit_log_entries {} GROUP BY severity ORDER BY severity",
            if chained_only {
                "WHERE chain_index IS NOT NULL"
            } else {
                ""
            }
        );
        let rows = sqlx::query_as::<_, (String, i64)>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| LedgerError::database("Failed to count by severity", e))?;

        rows.into_iter()
            .map(|(severity, entry_count)| {
                Ok(SeverityCount {
                    severity: severity.parse()?,
                    entry_count,
                })
            })
            .collect()
    }

    /// 件数上位のアクション
    pub async fn top_actions(&self, limit: i64) -> LedgerResult<Vec<ActionCount>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT action, COUNT(*) AS cnt FROM audit_log_entries \
             GROUP BY action ORDER BY cnt DESC, action ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LedgerError::database("Failed to count by action", e))?;

        Ok(rows
            .into_iter()
            .map(|(action, entry_count)| ActionCount {
                action,
                entry_count,
            })
            .collect())
    }

    /// 直近N か月の月次件数（新しい月から）
    pub async fn monthly_activity(&self, months: i64) -> LedgerResult<Vec<MonthlyActivity>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"SELECT substr(created_at, 1, 7) AS month, COUNT(*)
            FROM audit_log_entries
            WHERE created_at >= DATE('now', 'start of month', '-' || ? || ' months')
            GROUP BY month
            ORDER BY month DESC"#,
        )
        .bind(months.max(1) - 1)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LedgerError::database("Failed to get monthly activity", e))?;

        Ok(rows
            .into_iter()
            .map(|(month, entry_count)| MonthlyActivity { month, entry_count })
            .collect())
    }

    /// 最古・最新の記録時刻
    pub async fn time_span(&self) -> LedgerResult<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let row = sqlx::query_as::<_, (Option<String>, Option<String>)>(
            "SELECT MIN(created_at), MAX(created_at) FROM audit_log_entries",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| LedgerError::database("Failed to get time span", e))?;

        let parse = |raw: &str| {
            DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| LedgerError::Database(format!("Failed to parse created_at: {}", e)))
        };

        match row {
            (Some(min), Some(max)) => Ok(Some((parse(&min)?, parse(&max)?))),
            _ => Ok(None),
        }
    }
}

enum BindValue {
    Int(i64),
    Text(String),
}

fn build_where_clause(filter: &AuditLogFilter) -> (String, Vec<BindValue>) {
    let mut conditions: Vec<&str> = Vec::new();
    let mut bind_values: Vec<BindValue> = Vec::new();

    if let Some(user_id) = filter.user_id {
        conditions.push("user_id = ?");
        bind_values.push(BindValue::Int(user_id));
    }

    if let Some(ref action) = filter.action {
        conditions.push("action = ?");
        bind_values.push(BindValue::Text(action.clone()));
    }

    if let Some(ref entity) = filter.entity {
        conditions.push("entity = ?");
        bind_values.push(BindValue::Text(entity.clone()));
    }

    if let Some(ref entity_id) = filter.entity_id {
        conditions.push("entity_id = ?");
        bind_values.push(BindValue::Text(entity_id.clone()));
    }

    if let Some(severity) = filter.severity {
        conditions.push("severity = ?");
        bind_values.push(BindValue::Text(severity.as_str().to_string()));
    }

    if let Some(ref time_from) = filter.time_from {
        conditions.push("created_at >= ?");
        bind_values.push(BindValue::Text(format_timestamp(time_from)));
    }

    if let Some(ref time_to) = filter.time_to {
        conditions.push("created_at <= ?");
        bind_values.push(BindValue::Text(format_timestamp(time_to)));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    (where_clause, bind_values)
}
