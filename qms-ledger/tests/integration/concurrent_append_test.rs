//! Concurrent writers must never fork the chain

use crate::support::file_ledger;
use qms_ledger::audit::appender::ChainAppender;
use qms_ledger::audit::types::NewAuditEvent;
use qms_ledger::audit::verifier::VerifyMode;
use qms_ledger::common::error::LedgerError;
use std::collections::HashSet;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hundred_concurrent_appends_form_one_linear_chain() {
    let ledger = file_ledger().await;
    // 別のappenderはプロセス内ガードを共有しない（別プロセス相当）
    let other = ChainAppender::new(ledger.storage.clone(), Duration::from_secs(30));

    let mut handles = Vec::new();
    for i in 0..100 {
        let appender = if i % 2 == 0 {
            ledger.appender.clone()
        } else {
            other.clone()
        };
        handles.push(tokio::spawn(async move {
            appender
                .append(
                    NewAuditEvent::new("PRODUCTION_ENTRY_CREATE")
                        .user(i % 7)
                        .entity("production_entry", i),
                )
                .await
        }));
    }

    let mut indices = HashSet::new();
    for handle in handles {
        let entry = handle.await.unwrap().unwrap();
        assert!(indices.insert(entry.chain_index.unwrap()));
    }
    assert_eq!(indices, (1..=100).collect::<HashSet<i64>>());

    let report = ledger.verifier.verify(VerifyMode::Full).await.unwrap();
    assert!(report.valid, "errors: {:?}", report.errors);
    assert_eq!(report.total_records, 100);
    assert_eq!(report.last_chain_index, Some(100));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn writer_queue_and_direct_appends_share_the_chain() {
    let ledger = file_ledger().await;
    let writer = ledger.writer(Default::default());

    for i in 0..20 {
        writer.send(NewAuditEvent::new("DOCUMENT_VIEW").entity("document", i));
        ledger
            .record_event(NewAuditEvent::new("DOCUMENT_UPDATE").entity("document", i))
            .await
            .unwrap();
    }
    writer.flush().await.unwrap();

    assert_eq!(ledger.storage.count_chained().await.unwrap(), 40);
    let report = ledger.verifier.verify(VerifyMode::Full).await.unwrap();
    assert!(report.valid);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timed_out_appends_never_commit() {
    let ledger = file_ledger().await;
    let appenders: Vec<ChainAppender> = [100u64, 250, 500, 1_000, 2_000]
        .iter()
        .map(|micros| ChainAppender::new(ledger.storage.clone(), Duration::from_micros(*micros)))
        .collect();

    let mut handles = Vec::new();
    for i in 0..300usize {
        let appender = appenders[i % appenders.len()].clone();
        handles.push(tokio::spawn(async move {
            appender
                .append(NewAuditEvent::new("PRODUCTION_ENTRY_CREATE").entity("production_entry", i))
                .await
        }));
    }

    let mut committed = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(entry) => committed.push(entry),
            Err(LedgerError::Timeout(_)) => {}
            Err(e) => panic!("unexpected append error: {e}"),
        }
    }

    // タイムアウトした追記は1行も残さない
    assert_eq!(
        ledger.storage.count_all().await.unwrap(),
        committed.len() as i64
    );
    for entry in &committed {
        let stored = ledger.storage.get_by_id(entry.id).await.unwrap().unwrap();
        assert_eq!(&stored, entry);
    }

    let report = ledger.verifier.verify(VerifyMode::Full).await.unwrap();
    assert!(report.valid, "errors: {:?}", report.errors);
    assert_eq!(report.total_records, committed.len() as u64);
}
