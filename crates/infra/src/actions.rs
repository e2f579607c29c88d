//! Paid actions and admin adjustments on top of the ledger engine.
//!
//! Callers never build idempotency keys themselves: the gateway derives them
//! from the key policy so the same business action always maps to the same key.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument};

use creditledger_core::AccountId;
use creditledger_ledger::{
    ActionCosts, ActionKind, EntryType, GrantRequest, IdempotencyKey, SpendRequest,
};

use crate::engine::LedgerEngine;
use crate::error::{LedgerError, LedgerResult};
use crate::ledger_store::LedgerStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionOutcome {
    Performed { new_balance: i64 },
    /// The key already paid for this action; nothing was charged.
    AlreadyPerformed { balance: i64 },
    InsufficientBalance { balance: i64, cost: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AdjustmentOutcome {
    Applied { new_balance: i64 },
    Replayed { balance: i64 },
    /// A deduction larger than the balance; nothing was written.
    Insufficient { balance: i64 },
}

pub struct ActionGateway<S> {
    engine: Arc<LedgerEngine<S>>,
    costs: ActionCosts,
}

impl<S: LedgerStore> ActionGateway<S> {
    pub fn new(engine: Arc<LedgerEngine<S>>, costs: ActionCosts) -> Self {
        Self { engine, costs }
    }

    pub fn costs(&self) -> &ActionCosts {
        &self.costs
    }

    /// Charge `actor` for `action` on `target`, at most once per key period.
    #[instrument(skip(self), fields(actor = %actor, action = %action), err)]
    pub async fn perform(
        &self,
        actor: AccountId,
        action: ActionKind,
        target: Option<&str>,
        now: DateTime<Utc>,
    ) -> LedgerResult<ActionOutcome> {
        let key = action.idempotency_key(actor, target, now)?;
        let cost = self.costs.cost_of(action);

        let mut request = SpendRequest::new(actor, cost, action.as_str()).with_idempotency_key(key);
        if let Some(target) = target {
            request = request.with_related_id(target.trim());
        }

        let outcome = self.engine.spend(request).await?;
        Ok(match (outcome.success, outcome.idempotent) {
            (false, _) => ActionOutcome::InsufficientBalance {
                balance: outcome.new_balance,
                cost,
            },
            (true, true) => ActionOutcome::AlreadyPerformed {
                balance: outcome.new_balance,
            },
            (true, false) => ActionOutcome::Performed {
                new_balance: outcome.new_balance,
            },
        })
    }

    /// Manual balance correction by `admin`.
    ///
    /// Positive amounts are `admin_grant` credits; negative amounts are
    /// `admin_deduct` debits through the sufficiency-checked spend path.
    /// `at` is part of the key: a retry of the same adjustment must reuse it.
    #[instrument(skip(self, reason), fields(admin = admin, account_id = %account_id), err)]
    pub async fn adjust(
        &self,
        admin: &str,
        account_id: AccountId,
        amount: i64,
        reason: &str,
        at: DateTime<Utc>,
    ) -> LedgerResult<AdjustmentOutcome> {
        if amount == 0 {
            return Err(LedgerError::Validation("adjustment amount must not be zero".to_string()));
        }
        let key = IdempotencyKey::admin_adjustment(admin, account_id, at)?;
        let reason = if reason.trim().is_empty() {
            format!("admin adjustment by {admin}")
        } else {
            reason.trim().to_string()
        };

        let outcome = if amount > 0 {
            let grant = self
                .engine
                .grant(
                    GrantRequest::new(account_id, amount, EntryType::AdminGrant, reason)
                        .with_idempotency_key(key),
                )
                .await?;
            if grant.idempotent {
                AdjustmentOutcome::Replayed { balance: grant.new_balance }
            } else {
                AdjustmentOutcome::Applied { new_balance: grant.new_balance }
            }
        } else {
            let cost = amount.checked_neg().ok_or_else(|| {
                LedgerError::Validation(format!("adjustment amount {amount} is out of range"))
            })?;
            let spend = self
                .engine
                .spend(
                    SpendRequest::new(account_id, cost, reason)
                        .with_entry_type(EntryType::AdminDeduct)
                        .with_idempotency_key(key),
                )
                .await?;
            match (spend.success, spend.idempotent) {
                (false, _) => AdjustmentOutcome::Insufficient { balance: spend.new_balance },
                (true, true) => AdjustmentOutcome::Replayed { balance: spend.new_balance },
                (true, false) => AdjustmentOutcome::Applied { new_balance: spend.new_balance },
            }
        };

        info!(amount, ?outcome, "admin adjustment");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::ledger_store::InMemoryLedgerStore;

    async fn funded(amount: i64) -> (ActionGateway<InMemoryLedgerStore>, AccountId) {
        let engine = Arc::new(LedgerEngine::new(InMemoryLedgerStore::new()));
        let account = AccountId::new();
        engine
            .grant(GrantRequest::new(account, amount, EntryType::Purchase, "pack"))
            .await
            .unwrap();
        (ActionGateway::new(engine, ActionCosts::default()), account)
    }

    fn day(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, d, h, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn one_shot_action_charges_once_per_target() {
        let (gateway, actor) = funded(20).await;

        let first = gateway.perform(actor, ActionKind::SendOffer, Some("req-1"), day(1, 9)).await.unwrap();
        let again = gateway.perform(actor, ActionKind::SendOffer, Some("req-1"), day(9, 9)).await.unwrap();
        let other = gateway.perform(actor, ActionKind::SendOffer, Some("req-2"), day(9, 9)).await.unwrap();

        assert_eq!(first, ActionOutcome::Performed { new_balance: 15 });
        assert_eq!(again, ActionOutcome::AlreadyPerformed { balance: 15 });
        assert_eq!(other, ActionOutcome::Performed { new_balance: 10 });
    }

    #[tokio::test]
    async fn daily_action_repeats_on_the_next_day() {
        let (gateway, actor) = funded(20).await;

        let a = gateway.perform(actor, ActionKind::Republish, Some("listing-1"), day(3, 8)).await.unwrap();
        let b = gateway.perform(actor, ActionKind::Republish, Some("listing-1"), day(3, 22)).await.unwrap();
        let c = gateway.perform(actor, ActionKind::Republish, Some("listing-1"), day(4, 1)).await.unwrap();

        assert_eq!(a, ActionOutcome::Performed { new_balance: 17 });
        assert_eq!(b, ActionOutcome::AlreadyPerformed { balance: 17 });
        assert_eq!(c, ActionOutcome::Performed { new_balance: 14 });
    }

    #[tokio::test]
    async fn insufficient_balance_reports_cost() {
        let (gateway, actor) = funded(4).await;
        let outcome = gateway
            .perform(actor, ActionKind::FeatureListing, Some("listing-1"), day(1, 0))
            .await
            .unwrap();
        assert_eq!(outcome, ActionOutcome::InsufficientBalance { balance: 4, cost: 10 });
    }

    #[tokio::test]
    async fn missing_target_is_a_validation_error() {
        let (gateway, actor) = funded(10).await;
        let err = gateway.perform(actor, ActionKind::UnlockInterest, None, day(1, 0)).await.unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[tokio::test]
    async fn adjustments_credit_debit_and_replay() {
        let (gateway, account) = funded(10).await;
        let t0 = day(2, 10);

        let credit = gateway.adjust("ops-1", account, 30, "goodwill", t0).await.unwrap();
        assert_eq!(credit, AdjustmentOutcome::Applied { new_balance: 40 });

        let replay = gateway.adjust("ops-1", account, 30, "goodwill", t0).await.unwrap();
        assert_eq!(replay, AdjustmentOutcome::Replayed { balance: 40 });

        let debit = gateway.adjust("ops-1", account, -15, "", day(2, 11)).await.unwrap();
        assert_eq!(debit, AdjustmentOutcome::Applied { new_balance: 25 });

        let too_much = gateway.adjust("ops-1", account, -100, "clawback", day(2, 12)).await.unwrap();
        assert_eq!(too_much, AdjustmentOutcome::Insufficient { balance: 25 });

        assert!(gateway.adjust("ops-1", account, 0, "noop", t0).await.is_err());
    }

    #[tokio::test]
    async fn extreme_adjustments_are_validation_errors() {
        let (gateway, account) = funded(10).await;

        for amount in [i64::MIN, i64::MAX, -i64::MAX] {
            let err = gateway
                .adjust("ops-1", account, amount, "typo", day(3, 9))
                .await
                .unwrap_err();
            assert!(matches!(err, LedgerError::Validation(_)), "{amount}: {err}");
        }
        assert_eq!(gateway.engine.get_balance(account).await.unwrap(), 10);
    }
}
