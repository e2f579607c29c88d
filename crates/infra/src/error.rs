use thiserror::Error;

use creditledger_core::{AccountId, DomainError};

use crate::ledger_store::LedgerStoreError;

/// Ledger engine error.
///
/// Insufficient balance and idempotent replays are outcomes, not errors;
/// see `SpendOutcome` / `GrantOutcome`.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Rejected before any lock was taken.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The key already produced an entry on another account.
    #[error("idempotency key '{key}' already belongs to account {owner}")]
    IdempotencyKeyReused { key: String, owner: AccountId },

    /// A negative correction larger than the balance it corrects.
    #[error("correction of {amount} would take account {account_id} below zero (balance {balance})")]
    WouldGoNegative {
        account_id: AccountId,
        balance: i64,
        amount: i64,
    },

    /// Transient conflicts persisted through every attempt. Nothing was
    /// committed; retrying with the same key is safe.
    #[error("ledger unavailable after {attempts} attempts: {message}")]
    Unavailable { attempts: u32, message: String },

    #[error(transparent)]
    Store(#[from] LedgerStoreError),
}

impl LedgerError {
    /// True if the failed attempt left no trace and a retry may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            LedgerError::Unavailable { .. } => true,
            LedgerError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<DomainError> for LedgerError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg)
            | DomainError::InvariantViolation(msg)
            | DomainError::InvalidId(msg) => LedgerError::Validation(msg),
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
