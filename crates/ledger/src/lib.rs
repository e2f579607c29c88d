//! Credit ledger domain model.
//!
//! Pure types and rules: entries, requests, outcomes, the idempotency key
//! policy and the catalogue of paid actions. Persistence and concurrency live
//! in `creditledger-infra`.

pub mod action;
pub mod entry;
pub mod idempotency;
pub mod request;

pub use action::{ActionCosts, ActionKind};
pub use entry::{ledger_balance, BalanceCache, EntryType, LedgerEntry, NewLedgerEntry};
pub use idempotency::{IdempotencyKey, KeyScope, MAX_KEY_LEN};
pub use request::{GrantOutcome, GrantRequest, SpendOutcome, SpendRequest, MAX_CREDIT_AMOUNT};
