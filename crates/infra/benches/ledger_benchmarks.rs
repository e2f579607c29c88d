use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use creditledger_core::AccountId;
use creditledger_infra::ledger_store::InMemoryLedgerStore;
use creditledger_infra::LedgerEngine;
use creditledger_ledger::{EntryType, GrantRequest, IdempotencyKey, SpendRequest};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

fn funded_engine(rt: &tokio::runtime::Runtime, credits: i64) -> (LedgerEngine<InMemoryLedgerStore>, AccountId) {
    let engine = LedgerEngine::new(InMemoryLedgerStore::new());
    let account = AccountId::new();
    rt.block_on(engine.grant(GrantRequest::new(account, credits, EntryType::Purchase, "bench")))
        .unwrap();
    (engine, account)
}

fn bench_spend_latency(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("spend_latency");

    // Benchmark: unkeyed spend on an account with a growing ledger
    group.bench_function("spend_unkeyed", |b| {
        let (engine, account) = funded_engine(&rt, i64::MAX / 2);
        b.iter(|| {
            rt.block_on(engine.spend(SpendRequest::new(account, black_box(1), "bench")))
                .unwrap()
        });
    });

    // Benchmark: keyed spend, fresh key each time (pre-check misses)
    group.bench_function("spend_keyed_fresh", |b| {
        let (engine, account) = funded_engine(&rt, i64::MAX / 2);
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            let key = IdempotencyKey::new(format!("bench:{n}")).unwrap();
            rt.block_on(engine.spend(SpendRequest::new(account, 1, "bench").with_idempotency_key(key)))
                .unwrap()
        });
    });

    // Benchmark: keyed spend replay (pre-check hits, no lock taken)
    group.bench_function("spend_keyed_replay", |b| {
        let (engine, account) = funded_engine(&rt, 1_000);
        let key = IdempotencyKey::new("bench:replay").unwrap();
        let request = SpendRequest::new(account, 1, "bench").with_idempotency_key(key);
        rt.block_on(engine.spend(request.clone())).unwrap();
        b.iter(|| rt.block_on(engine.spend(black_box(request.clone()))).unwrap());
    });

    // Benchmark: refused spend (balance check fails, nothing written)
    group.bench_function("spend_insufficient", |b| {
        let (engine, account) = funded_engine(&rt, 1);
        b.iter(|| {
            rt.block_on(engine.spend(SpendRequest::new(account, black_box(5), "bench")))
                .unwrap()
        });
    });

    group.finish();
}

fn bench_balance_reads(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("balance_reads");

    for entries in [10, 100, 1000].iter() {
        let (engine, account) = funded_engine(&rt, *entries as i64);
        for _ in 1..*entries {
            rt.block_on(engine.grant(GrantRequest::new(account, 1, EntryType::Grant, "bench")))
                .unwrap();
        }

        group.throughput(Throughput::Elements(*entries as u64));
        group.bench_with_input(BenchmarkId::new("ledger_sum", entries), entries, |b, _| {
            b.iter(|| rt.block_on(engine.get_balance(black_box(account))).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("cache", entries), entries, |b, _| {
            b.iter(|| rt.block_on(engine.cached_balance(black_box(account))).unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_spend_latency, bench_balance_reads);
criterion_main!(benches);
