use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use creditledger_core::AccountId;
use creditledger_ledger::{BalanceCache, IdempotencyKey, LedgerEntry, NewLedgerEntry};

use super::query::{EntryPage, Pagination};

/// Ledger store operation error.
///
/// These are infrastructure errors. Business outcomes (insufficient balance,
/// idempotent replay) never surface here.
///
/// ## Error Categories
///
/// - **Transient**: serialization failure, deadlock, lock/statement timeout.
///   Safe to retry the whole unit.
/// - **DuplicateIdempotencyKey**: the key uniqueness constraint fired; another
///   caller already committed an entry with this key.
/// - **InvalidAppend**: the entry does not belong to the unit's account, or
///   similar caller misuse.
/// - **Corrupt**: a stored row could not be decoded.
/// - **Backend**: anything else from the storage engine.
#[derive(Debug, Error)]
pub enum LedgerStoreError {
    #[error("transient conflict: {0}")]
    Transient(String),

    #[error("idempotency key already recorded: {0}")]
    DuplicateIdempotencyKey(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("corrupt ledger row: {0}")]
    Corrupt(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl LedgerStoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerStoreError::Transient(_))
    }
}

/// Append-only store of ledger entries plus the derived balance cache.
///
/// ## Design Principles
///
/// - **Append-only**: entries are inserted, never updated or deleted.
/// - **Account-scoped locking**: every mutation happens inside a [`LedgerUnit`]
///   that holds an exclusive, transaction-scoped lock on one account.
/// - **All or nothing**: a unit's writes become visible together on `commit`;
///   dropping a unit without committing discards them.
/// - **Unique keys**: an idempotency key appears on at most one entry; a second
///   insert fails with [`LedgerStoreError::DuplicateIdempotencyKey`].
///
/// Only the ledger engine mutates through this trait.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Open an atomic unit holding the exclusive lock for `account_id`.
    ///
    /// Blocks while another unit holds the same account. Units for different
    /// accounts never wait on each other.
    async fn begin(&self, account_id: AccountId) -> Result<Box<dyn LedgerUnit>, LedgerStoreError>;

    /// Committed entry carrying `key`, if any.
    async fn find_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<LedgerEntry>, LedgerStoreError>;

    /// Authoritative balance: the sum of all committed entries of the account.
    async fn sum_balance(&self, account_id: AccountId) -> Result<i64, LedgerStoreError>;

    /// Current cache row, if one exists.
    async fn cached_balance(
        &self,
        account_id: AccountId,
    ) -> Result<Option<BalanceCache>, LedgerStoreError>;

    /// Entries of the account ordered by `created_at` (then entry id).
    async fn list_entries(
        &self,
        account_id: AccountId,
        pagination: Pagination,
    ) -> Result<EntryPage, LedgerStoreError>;

    /// Every account that has at least one entry or a cache row.
    async fn known_accounts(&self) -> Result<Vec<AccountId>, LedgerStoreError>;
}

/// One atomic unit of work on a single account.
///
/// Holds the account lock for its whole lifetime. Nothing written through a
/// unit is visible to others until [`LedgerUnit::commit`] succeeds.
#[async_trait]
pub trait LedgerUnit: Send {
    fn account_id(&self) -> AccountId;

    /// True balance as seen under the lock, including this unit's own writes.
    async fn locked_balance(&mut self) -> Result<i64, LedgerStoreError>;

    /// Stage a new entry. The entry must belong to this unit's account.
    async fn insert_entry(&mut self, entry: NewLedgerEntry) -> Result<LedgerEntry, LedgerStoreError>;

    /// Move the cache row by `delta`, floored at zero.
    ///
    /// When the account has no cache row yet it is created from
    /// `balance_after`, the true balance once this unit commits.
    async fn apply_cache_delta(
        &mut self,
        delta: i64,
        balance_after: i64,
    ) -> Result<i64, LedgerStoreError>;

    /// Overwrite the cache row with `value` (floored at zero).
    async fn set_cache(&mut self, value: i64) -> Result<BalanceCache, LedgerStoreError>;

    /// Make every staged write visible at once and release the lock.
    async fn commit(&mut self) -> Result<(), LedgerStoreError>;
}

#[async_trait]
impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    async fn begin(&self, account_id: AccountId) -> Result<Box<dyn LedgerUnit>, LedgerStoreError> {
        (**self).begin(account_id).await
    }

    async fn find_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<LedgerEntry>, LedgerStoreError> {
        (**self).find_by_idempotency_key(key).await
    }

    async fn sum_balance(&self, account_id: AccountId) -> Result<i64, LedgerStoreError> {
        (**self).sum_balance(account_id).await
    }

    async fn cached_balance(
        &self,
        account_id: AccountId,
    ) -> Result<Option<BalanceCache>, LedgerStoreError> {
        (**self).cached_balance(account_id).await
    }

    async fn list_entries(
        &self,
        account_id: AccountId,
        pagination: Pagination,
    ) -> Result<EntryPage, LedgerStoreError> {
        (**self).list_entries(account_id, pagination).await
    }

    async fn known_accounts(&self) -> Result<Vec<AccountId>, LedgerStoreError> {
        (**self).known_accounts().await
    }
}
