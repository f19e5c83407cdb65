//! Tampering with stored rows is reported by verification, never repaired

use crate::support::{file_ledger, tamper, TestLedger};
use qms_ledger::audit::types::NewAuditEvent;
use qms_ledger::audit::verifier::{ChainFlag, VerifyMode};

async fn ledger_with(count: i64) -> TestLedger {
    let ledger = file_ledger().await;
    for i in 1..=count {
        ledger
            .record_event(
                NewAuditEvent::new("DOCUMENT_UPDATE")
                    .user(3)
                    .entity("document", i)
                    .description(format!("revision {i}")),
            )
            .await
            .unwrap();
    }
    ledger
}

#[tokio::test]
async fn edited_metadata_is_reported_as_data_tampered() {
    let ledger = ledger_with(5).await;
    tamper(
        ledger.storage.pool(),
        r#"UPDATE audit_log_entries SET metadata = '{"approved":true}' WHERE chain_index = 3"#,
    )
    .await;

    let report = ledger.verifier.verify(VerifyMode::Full).await.unwrap();
    assert!(!report.valid);
    assert_eq!(report.invalid_records, 1);
    assert_eq!(report.errors[0].chain_index, 3);
    assert_eq!(report.errors[0].errors, vec![ChainFlag::DataTampered]);
}

#[tokio::test]
async fn deleted_entry_breaks_the_following_link() {
    let ledger = ledger_with(5).await;
    tamper(
        ledger.storage.pool(),
        "DELETE FROM audit_log_entries WHERE chain_index = 3",
    )
    .await;

    let report = ledger.verifier.verify(VerifyMode::Full).await.unwrap();
    assert!(!report.valid);
    assert_eq!(report.total_records, 4);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].chain_index, 4);
    assert!(report.errors[0].errors.contains(&ChainFlag::ChainIndexGap));
    assert!(report.errors[0].errors.contains(&ChainFlag::LinkBroken));
}

#[tokio::test]
async fn swapped_content_is_detected_on_both_entries() {
    let ledger = ledger_with(4).await;
    // 2番と3番の説明を入れ替える
    tamper(
        ledger.storage.pool(),
        "UPDATE audit_log_entries SET description = CASE chain_index \
             WHEN 2 THEN 'revision 3' WHEN 3 THEN 'revision 2' END \
         WHERE chain_index IN (2, 3)",
    )
    .await;

    let report = ledger.verifier.verify(VerifyMode::Full).await.unwrap();
    assert!(!report.valid);
    let flagged: Vec<i64> = report.errors.iter().map(|e| e.chain_index).collect();
    assert_eq!(flagged, vec![2, 3]);
}

#[tokio::test]
async fn recomputed_forgery_is_caught_by_the_next_link() {
    let ledger = ledger_with(3).await;
    let original = ledger.storage.get_by_chain_index(2).await.unwrap().unwrap();

    // 内容を書き換え、data_hashとcurrent_hashも再計算したように見せかける
    let mut forged = original.clone();
    forged.description = Some("forged".to_string());
    let data_hash = qms_ledger::audit::hash_chain::compute_data_hash(&forged.fields());
    let current_hash = qms_ledger::audit::hash_chain::compute_chain_hash(
        2,
        original.prev_hash.as_deref().unwrap(),
        &data_hash,
    );
    tamper(
        ledger.storage.pool(),
        &format!(
            "UPDATE audit_log_entries SET description = 'forged', data_hash = '{data_hash}', \
             current_hash = '{current_hash}' WHERE chain_index = 2"
        ),
    )
    .await;

    let report = ledger.verifier.verify(VerifyMode::Full).await.unwrap();
    assert!(!report.valid);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].chain_index, 3);
    assert_eq!(report.errors[0].errors, vec![ChainFlag::LinkBroken]);
}

#[tokio::test]
async fn range_verification_anchors_on_the_preceding_entry() {
    let ledger = ledger_with(6).await;
    tamper(
        ledger.storage.pool(),
        "UPDATE audit_log_entries SET description = 'edited' WHERE chain_index = 2",
    )
    .await;

    // 範囲外の改ざんは範囲検証に影響しない
    let clean = ledger
        .verifier
        .verify(VerifyMode::Range { from: 4, to: 6 })
        .await
        .unwrap();
    assert!(clean.valid);
    assert_eq!(clean.total_records, 3);

    let dirty = ledger
        .verifier
        .verify(VerifyMode::Range { from: 1, to: 3 })
        .await
        .unwrap();
    assert!(!dirty.valid);
    assert_eq!(dirty.errors[0].chain_index, 2);
}

#[tokio::test]
async fn verification_does_not_modify_the_ledger() {
    let ledger = ledger_with(3).await;
    tamper(
        ledger.storage.pool(),
        "UPDATE audit_log_entries SET description = 'edited' WHERE chain_index = 1",
    )
    .await;
    let before = ledger.storage.get_by_chain_index(1).await.unwrap().unwrap();

    ledger.verifier.verify(VerifyMode::Full).await.unwrap();
    ledger.verifier.inspect_entry(before.id).await.unwrap();

    let after = ledger.storage.get_by_chain_index(1).await.unwrap().unwrap();
    assert_eq!(before, after);
    assert_eq!(ledger.storage.count_all().await.unwrap(), 3);
}

#[tokio::test]
async fn inspect_entry_reports_link_state() {
    let ledger = ledger_with(3).await;
    tamper(
        ledger.storage.pool(),
        "UPDATE audit_log_entries SET current_hash = 'rewritten' WHERE chain_index = 2",
    )
    .await;
    let middle = ledger.storage.get_by_chain_index(2).await.unwrap().unwrap();

    let context = ledger.verifier.inspect_entry(middle.id).await.unwrap();
    assert!(context.chained);
    assert_eq!(context.flags, vec![ChainFlag::HashMismatch]);
    assert_eq!(context.previous_link_valid, Some(true));
    assert_eq!(context.next_link_valid, Some(false));
}
