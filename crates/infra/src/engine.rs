//! Ledger engine: the only mutation surface over the ledger store.
//!
//! `spend` and `grant` follow the same shape:
//!
//! 1. validate input (no lock taken),
//! 2. short-circuit on an already-recorded idempotency key,
//! 3. inside one unit: lock the account, read the true balance, check, append
//!    the entry, move the cache by the same delta, all under the attempt
//!    deadline,
//! 4. commit outside the deadline,
//! 5. retry the whole unit on transient conflicts.
//!
//! A uniqueness violation on the key at step 3 means a concurrent caller with
//! the same key won the race; it is reported as an idempotent replay.

use tracing::{debug, info, instrument, warn};

use creditledger_core::AccountId;
use creditledger_ledger::{
    BalanceCache, GrantOutcome, GrantRequest, IdempotencyKey, LedgerEntry, SpendOutcome,
    SpendRequest,
};

use crate::concurrency::ConcurrencyController;
use crate::error::{LedgerError, LedgerResult};
use crate::ledger_store::{EntryPage, LedgerStore, LedgerStoreError, LedgerUnit, Pagination};

/// Result of the pre-commit phase of one attempt.
enum Staged<T> {
    /// Writes are staged; the unit still has to commit.
    Ready(Box<dyn LedgerUnit>, T),
    /// Decided without writing (insufficient balance, replay).
    Settled(T),
}

impl<T> Staged<T> {
    async fn commit(self) -> LedgerResult<T> {
        match self {
            Staged::Ready(mut unit, value) => {
                unit.commit().await?;
                Ok(value)
            }
            Staged::Settled(value) => Ok(value),
        }
    }
}

/// Balance as served by the fast read path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedBalance {
    pub value: i64,
    /// False when no cache row existed and the ledger was summed instead.
    pub from_cache: bool,
}

pub struct LedgerEngine<S> {
    store: S,
    controller: ConcurrencyController,
}

impl<S: LedgerStore> LedgerEngine<S> {
    pub fn new(store: S) -> Self {
        Self::with_controller(store, ConcurrencyController::default())
    }

    pub fn with_controller(store: S, controller: ConcurrencyController) -> Self {
        Self { store, controller }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn controller(&self) -> &ConcurrencyController {
        &self.controller
    }

    /// Debit `request.cost` credits if, and only if, the balance covers it.
    ///
    /// Insufficient balance is `Ok` with `success = false` and the unchanged
    /// balance. A repeated key is `Ok` with `idempotent = true` and the
    /// current balance.
    #[instrument(
        skip(self, request),
        fields(
            account_id = %request.account_id,
            cost = request.cost,
            entry_type = %request.entry_type,
            key = request.idempotency_key.as_ref().map(IdempotencyKey::as_str)
        ),
        err
    )]
    pub async fn spend(&self, request: SpendRequest) -> LedgerResult<SpendOutcome> {
        request.validate()?;

        if let Some(key) = &request.idempotency_key {
            if let Some(existing) = self.store.find_by_idempotency_key(key).await? {
                let balance = self.replayed_balance(request.account_id, key, &existing).await?;
                debug!(balance, "spend replayed");
                return Ok(SpendOutcome::replayed(balance));
            }
        }

        let outcome = self
            .controller
            .run("spend", |attempt| self.spend_once(&request, attempt))
            .await?;

        if outcome.success && !outcome.idempotent {
            info!(new_balance = outcome.new_balance, "spend committed");
        }
        Ok(outcome)
    }

    async fn spend_once(&self, request: &SpendRequest, attempt: u32) -> LedgerResult<SpendOutcome> {
        self.controller
            .within_deadline("spend", self.stage_spend(request, attempt))
            .await?
            .commit()
            .await
    }

    async fn stage_spend(&self, request: &SpendRequest, attempt: u32) -> LedgerResult<Staged<SpendOutcome>> {
        let mut unit = self.store.begin(request.account_id).await?;
        let balance = unit.locked_balance().await?;
        debug!(attempt, balance, "account locked");

        if balance < request.cost {
            drop(unit);
            // A same-key caller may have drained the balance we are about to refuse.
            if let Some(key) = &request.idempotency_key {
                if let Some(existing) = self.store.find_by_idempotency_key(key).await? {
                    let balance = self.replayed_balance(request.account_id, key, &existing).await?;
                    warn!(key = key.as_str(), "idempotency race lost, reporting replay");
                    return Ok(Staged::Settled(SpendOutcome::replayed(balance)));
                }
            }
            debug!(balance, cost = request.cost, "insufficient balance");
            return Ok(Staged::Settled(SpendOutcome::insufficient(balance)));
        }

        match unit.insert_entry(request.to_entry()).await {
            Ok(_) => {}
            Err(LedgerStoreError::DuplicateIdempotencyKey(_)) => {
                drop(unit);
                let balance = self.replay_after_race(request.account_id, request.idempotency_key.as_ref()).await?;
                return Ok(Staged::Settled(SpendOutcome::replayed(balance)));
            }
            Err(e) => return Err(e.into()),
        }

        let new_balance = balance - request.cost;
        unit.apply_cache_delta(-request.cost, new_balance).await?;
        Ok(Staged::Ready(unit, SpendOutcome::applied(new_balance)))
    }

    /// Append a signed credit entry.
    ///
    /// Positive amounts need no sufficiency check. A negative correction is
    /// refused with [`LedgerError::WouldGoNegative`] if it would leave the
    /// balance below zero.
    #[instrument(
        skip(self, request),
        fields(
            account_id = %request.account_id,
            amount = request.amount,
            entry_type = %request.entry_type,
            key = request.idempotency_key.as_ref().map(IdempotencyKey::as_str)
        ),
        err
    )]
    pub async fn grant(&self, request: GrantRequest) -> LedgerResult<GrantOutcome> {
        request.validate()?;

        if let Some(key) = &request.idempotency_key {
            if let Some(existing) = self.store.find_by_idempotency_key(key).await? {
                let balance = self.replayed_balance(request.account_id, key, &existing).await?;
                debug!(balance, "grant replayed");
                return Ok(GrantOutcome::replayed(balance));
            }
        }

        let outcome = self
            .controller
            .run("grant", |attempt| self.grant_once(&request, attempt))
            .await?;

        if !outcome.idempotent {
            info!(new_balance = outcome.new_balance, "grant committed");
        }
        Ok(outcome)
    }

    async fn grant_once(&self, request: &GrantRequest, attempt: u32) -> LedgerResult<GrantOutcome> {
        self.controller
            .within_deadline("grant", self.stage_grant(request, attempt))
            .await?
            .commit()
            .await
    }

    async fn stage_grant(&self, request: &GrantRequest, attempt: u32) -> LedgerResult<Staged<GrantOutcome>> {
        let mut unit = self.store.begin(request.account_id).await?;
        let balance = unit.locked_balance().await?;
        debug!(attempt, balance, "account locked");

        let new_balance = balance.checked_add(request.amount).ok_or_else(|| {
            LedgerError::Validation(format!(
                "grant of {} would overflow balance {balance}",
                request.amount
            ))
        })?;
        if new_balance < 0 {
            return Err(LedgerError::WouldGoNegative {
                account_id: request.account_id,
                balance,
                amount: request.amount,
            });
        }

        match unit.insert_entry(request.to_entry()).await {
            Ok(_) => {}
            Err(LedgerStoreError::DuplicateIdempotencyKey(_)) => {
                drop(unit);
                let balance = self.replay_after_race(request.account_id, request.idempotency_key.as_ref()).await?;
                return Ok(Staged::Settled(GrantOutcome::replayed(balance)));
            }
            Err(e) => return Err(e.into()),
        }

        unit.apply_cache_delta(request.amount, new_balance).await?;
        Ok(Staged::Ready(unit, GrantOutcome::applied(new_balance)))
    }

    /// Authoritative balance: the ledger sum, never the cache.
    pub async fn get_balance(&self, account_id: AccountId) -> LedgerResult<i64> {
        Ok(self.store.sum_balance(account_id).await?)
    }

    /// Fast read: the cache row when present, otherwise the ledger sum.
    pub async fn cached_balance(&self, account_id: AccountId) -> LedgerResult<CachedBalance> {
        match self.store.cached_balance(account_id).await? {
            Some(row) => Ok(CachedBalance {
                value: row.cached_value,
                from_cache: true,
            }),
            None => Ok(CachedBalance {
                value: self.store.sum_balance(account_id).await?,
                from_cache: false,
            }),
        }
    }

    /// Recompute the cache from the ledger under the account lock.
    ///
    /// The ledger always wins. Returns the true balance.
    #[instrument(skip(self), fields(account_id = %account_id), err)]
    pub async fn sync_cache(&self, account_id: AccountId) -> LedgerResult<i64> {
        let row = self
            .controller
            .run("sync_cache", |_| self.sync_once(account_id))
            .await?;
        Ok(row.cached_value)
    }

    async fn sync_once(&self, account_id: AccountId) -> LedgerResult<BalanceCache> {
        let previous = self.store.cached_balance(account_id).await?;
        let (balance, row) = self
            .controller
            .within_deadline("sync_cache", async {
                let mut unit = self.store.begin(account_id).await?;
                let balance = unit.locked_balance().await?;
                if balance < 0 {
                    warn!(balance, "ledger sum is negative, cache floored at zero");
                }
                let row = unit.set_cache(balance).await?;
                Ok::<_, LedgerError>(Staged::Ready(unit, (balance, row)))
            })
            .await?
            .commit()
            .await?;

        if let Some(prev) = previous.filter(|p| p.cached_value != row.cached_value) {
            warn!(
                cached = prev.cached_value,
                ledger = balance,
                "cache drift repaired"
            );
        }
        Ok(row)
    }

    /// Entries of an account, oldest first.
    pub async fn entries(&self, account_id: AccountId, pagination: Pagination) -> LedgerResult<EntryPage> {
        Ok(self.store.list_entries(account_id, pagination).await?)
    }

    /// Balance to report for a key that already produced `existing`.
    async fn replayed_balance(
        &self,
        account_id: AccountId,
        key: &IdempotencyKey,
        existing: &LedgerEntry,
    ) -> LedgerResult<i64> {
        if existing.account_id != account_id {
            return Err(LedgerError::IdempotencyKeyReused {
                key: key.to_string(),
                owner: existing.account_id,
            });
        }
        Ok(self.store.sum_balance(account_id).await?)
    }

    /// A concurrent caller committed the same key between the pre-check and
    /// our insert.
    async fn replay_after_race(
        &self,
        account_id: AccountId,
        key: Option<&IdempotencyKey>,
    ) -> LedgerResult<i64> {
        let Some(key) = key else {
            return Err(LedgerError::Store(LedgerStoreError::Backend(
                "uniqueness violation on an entry without idempotency key".to_string(),
            )));
        };
        warn!(key = key.as_str(), "idempotency race lost, reporting replay");
        match self.store.find_by_idempotency_key(key).await? {
            Some(existing) => self.replayed_balance(account_id, key, &existing).await,
            None => Err(LedgerError::Store(LedgerStoreError::Transient(format!(
                "idempotency key {key} reported taken but not visible yet"
            )))),
        }
    }
}
