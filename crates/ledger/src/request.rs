//! Ledger mutation requests and their outcomes.

use serde::{Deserialize, Serialize};

use creditledger_core::{AccountId, DomainError, DomainResult};

use crate::entry::{EntryType, NewLedgerEntry};
use crate::idempotency::IdempotencyKey;

/// Largest magnitude a single grant, spend or purchase may carry.
pub const MAX_CREDIT_AMOUNT: i64 = 1_000_000_000;

/// Request: debit `cost` credits from an account if the balance allows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendRequest {
    pub account_id: AccountId,
    /// Positive number of credits to deduct.
    pub cost: i64,
    pub entry_type: EntryType,
    pub reason: String,
    pub related_id: Option<String>,
    pub idempotency_key: Option<IdempotencyKey>,
}

impl SpendRequest {
    pub fn new(account_id: AccountId, cost: i64, reason: impl Into<String>) -> Self {
        Self {
            account_id,
            cost,
            entry_type: EntryType::Spend,
            reason: reason.into(),
            related_id: None,
            idempotency_key: None,
        }
    }

    pub fn with_related_id(mut self, related_id: impl Into<String>) -> Self {
        self.related_id = Some(related_id.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: IdempotencyKey) -> Self {
        self.idempotency_key = Some(key);
        self
    }

    pub fn with_entry_type(mut self, entry_type: EntryType) -> Self {
        self.entry_type = entry_type;
        self
    }

    /// Checks that run before any lock is taken.
    pub fn validate(&self) -> DomainResult<()> {
        if self.cost <= 0 {
            return Err(DomainError::validation(format!(
                "spend cost must be a positive integer (got {})",
                self.cost
            )));
        }
        if self.cost > MAX_CREDIT_AMOUNT {
            return Err(DomainError::validation(format!(
                "spend cost exceeds {MAX_CREDIT_AMOUNT} (got {})",
                self.cost
            )));
        }
        if !self.entry_type.is_debit() {
            return Err(DomainError::validation(format!(
                "entry type '{}' cannot be used for a spend",
                self.entry_type
            )));
        }
        Ok(())
    }

    /// The debit entry this request appends.
    pub fn to_entry(&self) -> NewLedgerEntry {
        NewLedgerEntry {
            account_id: self.account_id,
            amount: -self.cost,
            entry_type: self.entry_type,
            reason: self.reason.clone(),
            related_id: self.related_id.clone(),
            idempotency_key: self.idempotency_key.clone(),
        }
    }
}

/// Request: append a signed credit entry with no sufficiency check.
///
/// Negative amounts are administrative corrections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantRequest {
    pub account_id: AccountId,
    pub amount: i64,
    pub entry_type: EntryType,
    pub reason: String,
    pub related_id: Option<String>,
    pub idempotency_key: Option<IdempotencyKey>,
}

impl GrantRequest {
    pub fn new(
        account_id: AccountId,
        amount: i64,
        entry_type: EntryType,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            account_id,
            amount,
            entry_type,
            reason: reason.into(),
            related_id: None,
            idempotency_key: None,
        }
    }

    pub fn with_related_id(mut self, related_id: impl Into<String>) -> Self {
        self.related_id = Some(related_id.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: IdempotencyKey) -> Self {
        self.idempotency_key = Some(key);
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.amount == 0 {
            return Err(DomainError::validation("grant amount must not be zero"));
        }
        if self.amount.unsigned_abs() > MAX_CREDIT_AMOUNT.unsigned_abs() {
            return Err(DomainError::validation(format!(
                "grant amount exceeds {MAX_CREDIT_AMOUNT} in magnitude (got {})",
                self.amount
            )));
        }
        if self.entry_type.is_debit() {
            return Err(DomainError::validation(format!(
                "entry type '{}' must go through spend",
                self.entry_type
            )));
        }
        Ok(())
    }

    pub fn to_entry(&self) -> NewLedgerEntry {
        NewLedgerEntry {
            account_id: self.account_id,
            amount: self.amount,
            entry_type: self.entry_type,
            reason: self.reason.clone(),
            related_id: self.related_id.clone(),
            idempotency_key: self.idempotency_key.clone(),
        }
    }
}

/// Result of a spend.
///
/// `success = false` means insufficient balance: an expected business
/// outcome, reported with the unchanged balance. `idempotent = true` means
/// the key had already produced an entry and nothing new happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendOutcome {
    pub success: bool,
    pub new_balance: i64,
    pub idempotent: bool,
}

impl SpendOutcome {
    pub fn applied(new_balance: i64) -> Self {
        Self {
            success: true,
            new_balance,
            idempotent: false,
        }
    }

    pub fn insufficient(balance: i64) -> Self {
        Self {
            success: false,
            new_balance: balance,
            idempotent: false,
        }
    }

    pub fn replayed(balance: i64) -> Self {
        Self {
            success: true,
            new_balance: balance,
            idempotent: true,
        }
    }
}

/// Result of a grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantOutcome {
    pub new_balance: i64,
    pub idempotent: bool,
}

impl GrantOutcome {
    pub fn applied(new_balance: i64) -> Self {
        Self {
            new_balance,
            idempotent: false,
        }
    }

    pub fn replayed(balance: i64) -> Self {
        Self {
            new_balance: balance,
            idempotent: true,
        }
    }
}
