//! Ledger integration tests
//!
//! Drive the currency and honor ledgers end to end: through the queue into
//! either the recording fake or the SQLite store.

use ledger_common::{CurrencyType, LevelMapping, Outcome, SubjectId, TransactionError};
use ledgerd::gateway::FakeGateway;
use ledgerd::progression::NoPresence;
use ledgerd::store::SqliteGateway;
use ledgerd::{CurrencyLedger, HonorLedger, ProgressionService, QueueSettings};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

fn fast_settings(batch_limit: usize) -> QueueSettings {
    QueueSettings {
        drain_interval: Duration::from_millis(5),
        batch_limit,
        slow_batch_warning: Duration::from_secs(5),
    }
}

// ============================================================================
// SQLite store
// ============================================================================

#[tokio::test]
async fn test_ledgers_persist_to_sqlite() {
    let store = Arc::new(SqliteGateway::open_in_memory().unwrap());
    let currency = CurrencyLedger::new(store.clone(), fast_settings(10), Handle::current());
    let honor = HonorLedger::new(store.clone(), fast_settings(10), Handle::current());
    let subject = SubjectId::random();

    let deposits: Vec<_> = (0..12)
        .map(|i| currency.submit_with_receipt(subject, 10, format!("daily-{}", i), CurrencyType::Coins))
        .collect();
    let earned = honor.submit_with_receipt(subject, 150, "arena win");

    currency.flush().await;
    honor.flush().await;

    for receipt in deposits {
        assert_eq!(receipt.outcome().await, Ok(()));
    }
    assert_eq!(earned.outcome().await, Ok(()));
    assert_eq!(store.balance(&subject, CurrencyType::Coins).unwrap(), 120);
    assert_eq!(store.honor(&subject).unwrap(), 150);
    assert_eq!(currency.stats().batches, 2);
}

#[tokio::test]
async fn test_overdraw_reports_persistence_failure() {
    let store = Arc::new(SqliteGateway::open_in_memory().unwrap());
    let currency = CurrencyLedger::new(store.clone(), fast_settings(10), Handle::current());
    let subject = SubjectId::random();

    let spend = currency.submit_with_receipt(subject, -50, "shop", CurrencyType::Tokens);
    currency.flush().await;

    let outcome = spend.outcome().await;
    assert_eq!(outcome, Err(TransactionError::Persistence));
    assert_eq!(store.balance(&subject, CurrencyType::Tokens).unwrap(), 0);
}

#[tokio::test]
async fn test_honor_feeds_progression() {
    let store = Arc::new(SqliteGateway::open_in_memory().unwrap());
    let honor = HonorLedger::new(store.clone(), fast_settings(10), Handle::current());
    let progression = ProgressionService::new(Arc::new(NoPresence));
    progression
        .reload_mappings(&[
            LevelMapping::new(1, 0),
            LevelMapping::new(2, 100),
            LevelMapping::new(3, 300),
        ])
        .unwrap();
    let subject = SubjectId::random();

    honor.submit(subject, 100, "quest", None);
    honor.submit(subject, 50, "quest", None);
    honor.flush().await;

    let view = progression.view(store.honor(&subject).unwrap());
    assert_eq!(view.level, 2);
    assert_eq!(view.xp, 50);
    assert_eq!(view.next_level, Some(LevelMapping::new(3, 300)));
}

// ============================================================================
// Delivery guarantees
// ============================================================================

#[tokio::test]
async fn test_exactly_one_callback_per_transaction() {
    let gateway = FakeGateway::new();
    let failing = SubjectId::random();
    gateway.fail_for(failing);
    let ledger = HonorLedger::new(Arc::new(gateway.clone()), fast_settings(4), Handle::current());

    let fired = Arc::new(AtomicUsize::new(0));
    for i in 0..30i64 {
        let fired = Arc::clone(&fired);
        let subject = if i % 5 == 0 { failing } else { SubjectId::random() };
        // Every third one is the reserved zero amount
        let amount = if i % 3 == 0 { 0 } else { i };
        ledger.submit(
            subject,
            amount,
            format!("tx-{}", i),
            Some(Box::new(move |_: Outcome| {
                fired.fetch_add(1, Ordering::SeqCst);
            })),
        );
    }

    ledger.flush().await;
    // Extra cycles on an empty table must not re-deliver anything
    ledger.flush().await;
    assert!(ledger.queue().drain_once().is_none());

    assert_eq!(fired.load(Ordering::SeqCst), 30);
    assert_eq!(gateway.call_count(), 20);
    let stats = ledger.stats();
    assert_eq!(stats.succeeded + stats.failed, 30);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submits_during_reload_lose_nothing() {
    let gateway = FakeGateway::new();
    let ledger = Arc::new(CurrencyLedger::new(
        Arc::new(gateway.clone()),
        fast_settings(10),
        Handle::current(),
    ));
    let progression = Arc::new(ProgressionService::new(Arc::new(NoPresence)));
    ledger.start().unwrap();

    let reloader = {
        let progression = Arc::clone(&progression);
        tokio::task::spawn_blocking(move || {
            for round in 0..50u64 {
                let entries = [
                    LevelMapping::new(1, 0),
                    LevelMapping::new(2, 100 + round),
                    LevelMapping::new(3, 300 + round),
                ];
                progression.reload_mappings(&entries).unwrap();
            }
        })
    };

    let submitters: Vec<_> = (0..4)
        .map(|worker| {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move {
                let receipts: Vec<_> = (0..50)
                    .map(|i| {
                        ledger.submit_with_receipt(
                            SubjectId::random(),
                            1,
                            format!("w{}-{}", worker, i),
                            CurrencyType::Credits,
                        )
                    })
                    .collect();
                for receipt in receipts {
                    let outcome = tokio::time::timeout(Duration::from_secs(10), receipt.outcome())
                        .await
                        .expect("outcome timed out");
                    assert_eq!(outcome, Ok(()));
                }
            })
        })
        .collect();

    for submitter in submitters {
        submitter.await.unwrap();
    }
    reloader.await.unwrap();
    ledger.stop();

    let sources: HashSet<String> = gateway.calls().into_iter().map(|c| c.source).collect();
    assert_eq!(gateway.call_count(), 200);
    assert_eq!(sources.len(), 200);
    assert_eq!(progression.max_level(), 3);
}
