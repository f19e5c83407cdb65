//! Shared helpers for ledger integration tests

#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use qms_ledger::audit::types::{NewAuditEvent, PreparedEvent};
use qms_ledger::config::LedgerConfig;
use qms_ledger::Ledger;
use sqlx::SqlitePool;
use tempfile::TempDir;

/// A ledger backed by a file database inside a temporary directory
pub struct TestLedger {
    pub ledger: Ledger,
    pub database_url: String,
    _dir: TempDir,
}

impl std::ops::Deref for TestLedger {
    type Target = Ledger;

    fn deref(&self) -> &Ledger {
        &self.ledger
    }
}

/// Open a fresh file-backed ledger (WAL, pooled connections)
pub async fn file_ledger() -> TestLedger {
    let dir = tempfile::tempdir().expect("create temp dir");
    let database_url = format!("sqlite:{}", dir.path().join("ledger.db").display());
    let config = LedgerConfig {
        database_url: database_url.clone(),
        ..Default::default()
    };
    let ledger = Ledger::open(config).await.expect("open ledger");
    TestLedger {
        ledger,
        database_url,
        _dir: dir,
    }
}

/// Run a raw statement against the ledger, bypassing the append-only triggers
pub async fn tamper(pool: &SqlitePool, sql: &str) {
    sqlx::query("INSERT OR REPLACE INTO audit_mutation_override (id, reason) VALUES (1, 'test')")
        .execute(pool)
        .await
        .expect("enable override");
    sqlx::query(sql).execute(pool).await.expect("tamper");
    sqlx::query("DELETE FROM audit_mutation_override")
        .execute(pool)
        .await
        .expect("disable override");
}

/// Fixed base time for deterministic legacy rows
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap()
}

/// A legacy (pre-chaining) event recorded `minutes` after the base time
pub fn legacy_event(action: &str, minutes: i64) -> PreparedEvent {
    NewAuditEvent::new(action)
        .user(1)
        .entity("document", minutes)
        .at(base_time() + Duration::minutes(minutes))
        .prepare(Utc::now())
        .expect("prepare legacy event")
}
