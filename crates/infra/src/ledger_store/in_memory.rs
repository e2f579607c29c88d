use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::OwnedMutexGuard;

use creditledger_core::{AccountId, EntryId};
use creditledger_ledger::{ledger_balance, BalanceCache, IdempotencyKey, LedgerEntry, NewLedgerEntry};

use super::query::{EntryPage, Pagination};
use super::r#trait::{LedgerStore, LedgerStoreError, LedgerUnit};

#[derive(Debug, Default)]
struct Committed {
    /// Commit order.
    entries: Vec<LedgerEntry>,
    by_key: HashMap<IdempotencyKey, usize>,
    cache: HashMap<AccountId, BalanceCache>,
}

#[derive(Debug, Default)]
struct Shared {
    committed: RwLock<Committed>,
    /// Keys staged by units that have not committed yet.
    in_flight_keys: Mutex<HashSet<IdempotencyKey>>,
    account_locks: Mutex<HashMap<AccountId, Arc<tokio::sync::Mutex<()>>>>,
    failing_commits: AtomicU32,
    commit_delay_ms: AtomicU64,
}

fn poisoned() -> LedgerStoreError {
    LedgerStoreError::Backend("lock poisoned".to_string())
}

/// In-memory ledger store.
///
/// Intended for tests/dev. Behaves like the Postgres store where it matters:
/// per-account exclusive units, all-or-nothing commits, and unique
/// idempotency keys. A key staged by an open unit on another account makes a
/// concurrent insert fail as transient, mirroring a writer blocked on a
/// uniqueness check.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedgerStore {
    shared: Arc<Shared>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail with a transient error.
    pub fn fail_next_commits(&self, count: u32) {
        self.shared.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Hold every commit for `delay` before its writes land.
    pub fn delay_commits(&self, delay: Duration) {
        self.shared
            .commit_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Overwrite a cache row outside any unit, as an out-of-band writer would.
    pub fn overwrite_cache(&self, account_id: AccountId, cached_value: i64) -> Result<(), LedgerStoreError> {
        let mut committed = self.shared.committed.write().map_err(|_| poisoned())?;
        committed.cache.insert(
            account_id,
            BalanceCache {
                account_id,
                cached_value,
                last_synced_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Remove a cache row, as if the cache table had been truncated.
    pub fn drop_cache(&self, account_id: AccountId) -> Result<(), LedgerStoreError> {
        let mut committed = self.shared.committed.write().map_err(|_| poisoned())?;
        committed.cache.remove(&account_id);
        Ok(())
    }

    /// Number of committed entries across all accounts.
    pub fn entry_count(&self) -> usize {
        self.shared
            .committed
            .read()
            .map(|c| c.entries.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn begin(&self, account_id: AccountId) -> Result<Box<dyn LedgerUnit>, LedgerStoreError> {
        let lock = {
            let mut locks = self.shared.account_locks.lock().map_err(|_| poisoned())?;
            locks.entry(account_id).or_default().clone()
        };
        let guard = lock.lock_owned().await;

        Ok(Box::new(InMemoryUnit {
            shared: self.shared.clone(),
            account_id,
            _guard: guard,
            staged: Vec::new(),
            staged_keys: Vec::new(),
            staged_cache: None,
            committed: false,
        }))
    }

    async fn find_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<LedgerEntry>, LedgerStoreError> {
        let committed = self.shared.committed.read().map_err(|_| poisoned())?;
        Ok(committed
            .by_key
            .get(key)
            .and_then(|idx| committed.entries.get(*idx))
            .cloned())
    }

    async fn sum_balance(&self, account_id: AccountId) -> Result<i64, LedgerStoreError> {
        let committed = self.shared.committed.read().map_err(|_| poisoned())?;
        Ok(ledger_balance(
            committed.entries.iter().filter(|e| e.account_id == account_id),
        ))
    }

    async fn cached_balance(
        &self,
        account_id: AccountId,
    ) -> Result<Option<BalanceCache>, LedgerStoreError> {
        let committed = self.shared.committed.read().map_err(|_| poisoned())?;
        Ok(committed.cache.get(&account_id).cloned())
    }

    async fn list_entries(
        &self,
        account_id: AccountId,
        pagination: Pagination,
    ) -> Result<EntryPage, LedgerStoreError> {
        let committed = self.shared.committed.read().map_err(|_| poisoned())?;
        let mut entries: Vec<LedgerEntry> = committed
            .entries
            .iter()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.entry_id.cmp(&b.entry_id))
        });

        let total = entries.len() as u64;
        let page = entries
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect();
        Ok(EntryPage::new(page, total, pagination))
    }

    async fn known_accounts(&self) -> Result<Vec<AccountId>, LedgerStoreError> {
        let committed = self.shared.committed.read().map_err(|_| poisoned())?;
        let accounts: BTreeSet<AccountId> = committed
            .entries
            .iter()
            .map(|e| e.account_id)
            .chain(committed.cache.keys().copied())
            .collect();
        Ok(accounts.into_iter().collect())
    }
}

struct InMemoryUnit {
    shared: Arc<Shared>,
    account_id: AccountId,
    _guard: OwnedMutexGuard<()>,
    staged: Vec<LedgerEntry>,
    staged_keys: Vec<IdempotencyKey>,
    staged_cache: Option<BalanceCache>,
    committed: bool,
}

impl InMemoryUnit {
    fn release_keys(&mut self) {
        if self.staged_keys.is_empty() {
            return;
        }
        if let Ok(mut in_flight) = self.shared.in_flight_keys.lock() {
            for key in self.staged_keys.drain(..) {
                in_flight.remove(&key);
            }
        }
    }

    fn stage_cache(&mut self, cached_value: i64) -> BalanceCache {
        let row = BalanceCache {
            account_id: self.account_id,
            cached_value: cached_value.max(0),
            last_synced_at: Utc::now(),
        };
        self.staged_cache = Some(row.clone());
        row
    }
}

#[async_trait]
impl LedgerUnit for InMemoryUnit {
    fn account_id(&self) -> AccountId {
        self.account_id
    }

    async fn locked_balance(&mut self) -> Result<i64, LedgerStoreError> {
        let committed = self.shared.committed.read().map_err(|_| poisoned())?;
        let stored = ledger_balance(
            committed
                .entries
                .iter()
                .filter(|e| e.account_id == self.account_id),
        );
        Ok(stored + ledger_balance(&self.staged))
    }

    async fn insert_entry(&mut self, entry: NewLedgerEntry) -> Result<LedgerEntry, LedgerStoreError> {
        if entry.account_id != self.account_id {
            return Err(LedgerStoreError::InvalidAppend(format!(
                "entry for account {} staged in unit for account {}",
                entry.account_id, self.account_id
            )));
        }
        if entry.amount == 0 {
            return Err(LedgerStoreError::InvalidAppend(
                "entry amount must not be zero".to_string(),
            ));
        }

        if let Some(key) = &entry.idempotency_key {
            let committed = self.shared.committed.read().map_err(|_| poisoned())?;
            let mut in_flight = self.shared.in_flight_keys.lock().map_err(|_| poisoned())?;
            if committed.by_key.contains_key(key) || self.staged_keys.contains(key) {
                return Err(LedgerStoreError::DuplicateIdempotencyKey(key.to_string()));
            }
            if !in_flight.insert(key.clone()) {
                return Err(LedgerStoreError::Transient(format!(
                    "idempotency key {key} is being written by a concurrent unit"
                )));
            }
            self.staged_keys.push(key.clone());
        }

        let stored = entry.into_entry(EntryId::new(), Utc::now());
        self.staged.push(stored.clone());
        Ok(stored)
    }

    async fn apply_cache_delta(
        &mut self,
        delta: i64,
        balance_after: i64,
    ) -> Result<i64, LedgerStoreError> {
        let current = match &self.staged_cache {
            Some(row) => Some(row.cached_value),
            None => {
                let committed = self.shared.committed.read().map_err(|_| poisoned())?;
                committed.cache.get(&self.account_id).map(|row| row.cached_value)
            }
        };
        let next = match current {
            Some(value) => value + delta,
            None => balance_after,
        };
        Ok(self.stage_cache(next).cached_value)
    }

    async fn set_cache(&mut self, value: i64) -> Result<BalanceCache, LedgerStoreError> {
        Ok(self.stage_cache(value))
    }

    async fn commit(&mut self) -> Result<(), LedgerStoreError> {
        if self.committed {
            return Err(LedgerStoreError::InvalidAppend(
                "unit already committed".to_string(),
            ));
        }

        let injected = self
            .shared
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(LedgerStoreError::Transient(
                "injected commit failure".to_string(),
            ));
        }

        let delay_ms = self.shared.commit_delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        {
            let mut committed = self.shared.committed.write().map_err(|_| poisoned())?;
            for entry in self.staged.drain(..) {
                if let Some(key) = &entry.idempotency_key {
                    let idx = committed.entries.len();
                    committed.by_key.insert(key.clone(), idx);
                }
                committed.entries.push(entry);
            }
            if let Some(row) = self.staged_cache.take() {
                committed.cache.insert(row.account_id, row);
            }
        }

        self.committed = true;
        self.release_keys();
        Ok(())
    }
}

impl Drop for InMemoryUnit {
    fn drop(&mut self) {
        self.release_keys();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use creditledger_ledger::EntryType;

    fn credit(account_id: AccountId, amount: i64, key: Option<&str>) -> NewLedgerEntry {
        NewLedgerEntry {
            account_id,
            amount,
            entry_type: EntryType::AdminGrant,
            reason: "test".to_string(),
            related_id: None,
            idempotency_key: key.map(|k| IdempotencyKey::new(k).unwrap()),
        }
    }

    #[tokio::test]
    async fn dropped_unit_leaves_no_trace() {
        let store = InMemoryLedgerStore::new();
        let account = AccountId::new();
        {
            let mut unit = store.begin(account).await.unwrap();
            unit.insert_entry(credit(account, 10, Some("k1"))).await.unwrap();
            unit.apply_cache_delta(10, 10).await.unwrap();
            assert_eq!(unit.locked_balance().await.unwrap(), 10);
        }
        assert_eq!(store.sum_balance(account).await.unwrap(), 0);
        assert!(store.cached_balance(account).await.unwrap().is_none());

        // key was released with the unit
        let mut unit = store.begin(account).await.unwrap();
        unit.insert_entry(credit(account, 10, Some("k1"))).await.unwrap();
        unit.commit().await.unwrap();
        assert_eq!(store.sum_balance(account).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn committed_key_rejects_second_insert() {
        let store = InMemoryLedgerStore::new();
        let a = AccountId::new();
        let b = AccountId::new();

        let mut unit = store.begin(a).await.unwrap();
        unit.insert_entry(credit(a, 5, Some("dup"))).await.unwrap();
        unit.commit().await.unwrap();

        let mut unit = store.begin(b).await.unwrap();
        let err = unit.insert_entry(credit(b, 5, Some("dup"))).await.unwrap_err();
        assert!(matches!(err, LedgerStoreError::DuplicateIdempotencyKey(_)));
    }

    #[tokio::test]
    async fn in_flight_key_is_transient_for_other_units() {
        let store = InMemoryLedgerStore::new();
        let a = AccountId::new();
        let b = AccountId::new();

        let mut first = store.begin(a).await.unwrap();
        first.insert_entry(credit(a, 5, Some("race"))).await.unwrap();

        let mut second = store.begin(b).await.unwrap();
        let err = second.insert_entry(credit(b, 5, Some("race"))).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn foreign_account_entry_is_rejected() {
        let store = InMemoryLedgerStore::new();
        let mut unit = store.begin(AccountId::new()).await.unwrap();
        let err = unit.insert_entry(credit(AccountId::new(), 5, None)).await.unwrap_err();
        assert!(matches!(err, LedgerStoreError::InvalidAppend(_)));
    }

    #[tokio::test]
    async fn cache_row_is_seeded_then_moved_and_floored() {
        let store = InMemoryLedgerStore::new();
        let account = AccountId::new();

        let mut unit = store.begin(account).await.unwrap();
        assert_eq!(unit.apply_cache_delta(5, 42).await.unwrap(), 42);
        unit.commit().await.unwrap();

        let mut unit = store.begin(account).await.unwrap();
        assert_eq!(unit.apply_cache_delta(-100, 0).await.unwrap(), 0);
        unit.commit().await.unwrap();
        assert_eq!(store.cached_balance(account).await.unwrap().unwrap().cached_value, 0);
    }

    #[tokio::test]
    async fn injected_commit_failure_discards_writes() {
        let store = InMemoryLedgerStore::new();
        let account = AccountId::new();
        store.fail_next_commits(1);

        let mut unit = store.begin(account).await.unwrap();
        unit.insert_entry(credit(account, 9, Some("x"))).await.unwrap();
        assert!(unit.commit().await.unwrap_err().is_transient());
        drop(unit);

        assert_eq!(store.entry_count(), 0);
        let mut unit = store.begin(account).await.unwrap();
        unit.insert_entry(credit(account, 9, Some("x"))).await.unwrap();
        unit.commit().await.unwrap();
        assert_eq!(store.entry_count(), 1);
    }

    #[tokio::test]
    async fn entries_are_paged_oldest_first() {
        let store = InMemoryLedgerStore::new();
        let account = AccountId::new();
        for amount in 1..=5 {
            let mut unit = store.begin(account).await.unwrap();
            unit.insert_entry(credit(account, amount, None)).await.unwrap();
            unit.commit().await.unwrap();
        }

        let page = store.list_entries(account, Pagination::new(Some(2), Some(1))).await.unwrap();
        assert_eq!(page.total, 5);
        assert!(page.has_more);
        assert_eq!(page.entries.iter().map(|e| e.amount).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(store.known_accounts().await.unwrap(), vec![account]);
    }
}
