//! Backfill of entries recorded before chaining was introduced

use crate::support::{base_time, file_ledger, legacy_event};
use qms_ledger::audit::backfill::BackfillOptions;
use qms_ledger::audit::types::NewAuditEvent;
use qms_ledger::audit::verifier::VerifyMode;
use qms_ledger::common::error::LedgerError;

#[tokio::test]
async fn backfill_chains_legacy_rows_then_new_events_continue() {
    let ledger = file_ledger().await;
    let legacy: Vec<_> = (0..25)
        .rev()
        .map(|minute| legacy_event("DOCUMENT_UPDATE", minute))
        .collect();
    ledger.storage.insert_unchained(&legacy).await.unwrap();

    let before = ledger.verifier.verify(VerifyMode::Full).await.unwrap();
    assert!(before.valid);
    assert_eq!(before.total_records, 0);
    assert_eq!(before.unchained_records, 25);

    let options = BackfillOptions {
        batch_size: 10,
        lock_path: Some(ledger_lock_path(&ledger.database_url)),
        ..BackfillOptions::from_config(&ledger.config)
    };
    let summary = ledger.backfiller(options.clone()).run().await.unwrap();
    assert_eq!(summary.processed, 25);
    assert_eq!(summary.batches, 3);
    assert_eq!(summary.first_assigned_index, Some(1));
    assert_eq!(summary.last_assigned_index, Some(25));
    assert!(summary.verification.as_ref().unwrap().valid);

    // created_at順に番号が振られる
    let first = ledger.storage.get_by_chain_index(1).await.unwrap().unwrap();
    let last = ledger.storage.get_by_chain_index(25).await.unwrap().unwrap();
    assert!(first.created_at < last.created_at);

    // 2回目は何もしない
    let rerun = ledger.backfiller(options).run().await.unwrap();
    assert_eq!(rerun.processed, 0);
    assert_eq!(rerun.previously_chained, 25);

    let next = ledger
        .record_event(NewAuditEvent::new("DOCUMENT_APPROVE").entity("document", 99))
        .await
        .unwrap();
    assert_eq!(next.chain_index, Some(26));
    assert_eq!(next.prev_hash, last.current_hash);

    let report = ledger.verifier.verify(VerifyMode::Full).await.unwrap();
    assert!(report.valid);
    assert_eq!(report.total_records, 26);
    assert_eq!(report.unchained_records, 0);
}

#[tokio::test]
async fn run_backfill_uses_configured_defaults() {
    let ledger = file_ledger().await;
    let legacy: Vec<_> = (0..3).map(|m| legacy_event("NC_CREATE", m)).collect();
    ledger.storage.insert_unchained(&legacy).await.unwrap();

    let summary = ledger.run_backfill().await.unwrap();
    assert_eq!(summary.processed, 3);
    assert_eq!(summary.batches, 1);
}

#[tokio::test]
async fn concurrent_backfill_is_rejected() {
    let ledger = file_ledger().await;
    ledger
        .storage
        .insert_unchained(&[legacy_event("CAPA_CREATE", 0)])
        .await
        .unwrap();

    let lock_path = ledger_lock_path(&ledger.database_url);
    let _held = qms_ledger::lock::RunLock::acquire_at(lock_path.clone(), &ledger.database_url)
        .unwrap();

    let options = BackfillOptions {
        lock_path: Some(lock_path),
        ..BackfillOptions::from_config(&ledger.config)
    };
    let err = ledger.backfiller(options).run().await.unwrap_err();
    assert!(matches!(err, LedgerError::Lock(_)));
    assert_eq!(ledger.storage.count_unchained().await.unwrap(), 1);
}

fn ledger_lock_path(database_url: &str) -> std::path::PathBuf {
    let name = database_url.replace(['/', ':', '\\'], "_");
    std::env::temp_dir().join(format!("qms-ledger-test-{}.lock", name))
}

#[tokio::test]
async fn backfilled_float_metadata_verifies() {
    let ledger = file_ledger().await;
    let legacy: Vec<_> = [994.1414234139935, 1.0715660391465826e-75]
        .iter()
        .enumerate()
        .map(|(i, reading)| {
            NewAuditEvent::new("EQUIPMENT_CALIBRATE")
                .entity("equipment", i)
                .metadata(serde_json::json!({"reading": reading}))
                .at(base_time() + chrono::Duration::minutes(i as i64))
                .prepare(chrono::Utc::now())
                .unwrap()
        })
        .collect();
    ledger.storage.insert_unchained(&legacy).await.unwrap();

    let summary = ledger.run_backfill().await.unwrap();
    assert_eq!(summary.processed, 2);
    assert!(summary.verification.unwrap().valid);
}
