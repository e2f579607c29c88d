//! Postgres ledger tests.
//!
//! Opt-in: set `TEST_DATABASE_URL` to a scratch database, otherwise every test
//! returns early. Accounts are fresh per test, so runs can share a database.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use sqlx::postgres::PgPoolOptions;

use creditledger_core::AccountId;
use creditledger_infra::ledger_store::{LedgerStore, PostgresLedgerStore};
use creditledger_infra::payments::{
    CheckoutCompletion, InMemoryPaymentProvider, PostgresPaymentSessionStore, ProviderStatus, ReconcileConfig,
    ReconciliationJob, SessionId, SessionStatus,
};
use creditledger_infra::{CacheAuditor, LedgerConfig, LedgerEngine};
use creditledger_ledger::{EntryType, GrantRequest, IdempotencyKey, SpendRequest};

async fn store() -> Option<PostgresLedgerStore> {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set; skipping");
        return None;
    };
    let pool = PgPoolOptions::new()
        .max_connections(16)
        .connect(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");
    let store = PostgresLedgerStore::with_options(pool, LedgerConfig::default().pg_options());
    store.ensure_schema().await.expect("failed to apply schema");
    Some(store)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exact_admission_under_contention() {
    let Some(store) = store().await else { return };
    let engine = Arc::new(LedgerEngine::new(store));
    let account = AccountId::new();
    engine
        .grant(GrantRequest::new(account, 10, EntryType::Purchase, "pack"))
        .await
        .unwrap();

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.spend(SpendRequest::new(account, 5, "offer")).await })
        })
        .collect();

    let mut succeeded = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().success {
            succeeded += 1;
        }
    }

    assert_eq!(succeeded, 2);
    assert_eq!(engine.get_balance(account).await.unwrap(), 0);
    assert_eq!(engine.cached_balance(account).await.unwrap().value, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_key_from_many_tasks_writes_one_entry() {
    let Some(store) = store().await else { return };
    let engine = Arc::new(LedgerEngine::new(store));
    let account = AccountId::new();
    engine
        .grant(GrantRequest::new(account, 50, EntryType::Purchase, "pack"))
        .await
        .unwrap();
    let key = IdempotencyKey::new(format!("send_offer:{account}:req-1")).unwrap();

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let engine = engine.clone();
            let key = key.clone();
            tokio::spawn(async move {
                engine
                    .spend(SpendRequest::new(account, 5, "offer").with_idempotency_key(key))
                    .await
            })
        })
        .collect();
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.new_balance, 45);
    }

    let page = engine.entries(account, Default::default()).await.unwrap();
    assert_eq!(page.total, 2);
}

#[tokio::test]
async fn entries_are_append_only() {
    let Some(store) = store().await else { return };
    let engine = LedgerEngine::new(store);
    let account = AccountId::new();
    engine
        .grant(GrantRequest::new(account, 30, EntryType::AdminGrant, "welcome"))
        .await
        .unwrap();

    let update = sqlx::query("UPDATE ledger_entries SET amount = 1000 WHERE account_id = $1")
        .bind(account.as_uuid())
        .execute(engine.store().pool())
        .await;
    assert!(update.is_err());
    let delete = sqlx::query("DELETE FROM ledger_entries WHERE account_id = $1")
        .bind(account.as_uuid())
        .execute(engine.store().pool())
        .await;
    assert!(delete.is_err());

    assert_eq!(engine.get_balance(account).await.unwrap(), 30);
}

#[tokio::test]
async fn drifted_cache_is_found_and_repaired() {
    let Some(store) = store().await else { return };
    let engine = Arc::new(LedgerEngine::new(store));
    let account = AccountId::new();
    engine
        .grant(GrantRequest::new(account, 12, EntryType::Grant, "promo"))
        .await
        .unwrap();

    sqlx::query("UPDATE balance_cache SET cached_value = 99 WHERE account_id = $1")
        .bind(account.as_uuid())
        .execute(engine.store().pool())
        .await
        .unwrap();

    let report = CacheAuditor::new(engine.clone()).audit(true).await.unwrap();
    assert!(report.drifted.iter().any(|d| d.account_id == account && d.cached == 99 && d.ledger == 12));
    assert_eq!(engine.store().cached_balance(account).await.unwrap().unwrap().cached_value, 12);
}

#[tokio::test]
async fn reconciliation_credits_paid_sessions_once() {
    let Some(store) = store().await else { return };
    let pool = store.pool().clone();
    let engine = Arc::new(LedgerEngine::new(store));
    let checkout = Arc::new(CheckoutCompletion::new(
        engine.clone(),
        Arc::new(PostgresPaymentSessionStore::new(pool)),
    ));
    let provider = Arc::new(InMemoryPaymentProvider::new());
    let job = ReconciliationJob::new(
        checkout.clone(),
        provider.clone(),
        ReconcileConfig {
            batch_limit: 1000,
            ..Default::default()
        },
    );

    let account = AccountId::new();
    let sid = SessionId::new(format!("cs_{}", AccountId::new())).unwrap();
    checkout
        .open(sid.clone(), account, 100, Utc::now() - ChronoDuration::hours(2))
        .await
        .unwrap();
    provider.set_status(sid.clone(), ProviderStatus::Paid);

    job.run_once(Utc::now()).await.unwrap();
    let webhook = checkout.complete(&sid, Utc::now()).await.unwrap();

    assert!(webhook.idempotent);
    assert_eq!(engine.get_balance(account).await.unwrap(), 100);
    let session = checkout.sessions().get(&sid).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
}
