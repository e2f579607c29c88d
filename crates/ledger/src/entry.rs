use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use creditledger_core::{AccountId, DomainError, EntryId};

use crate::idempotency::IdempotencyKey;

/// Economic event recorded by a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Purchase,
    Spend,
    Grant,
    Refund,
    AdminGrant,
    AdminDeduct,
}

impl EntryType {
    pub const ALL: [EntryType; 6] = [
        EntryType::Purchase,
        EntryType::Spend,
        EntryType::Grant,
        EntryType::Refund,
        EntryType::AdminGrant,
        EntryType::AdminDeduct,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Purchase => "purchase",
            EntryType::Spend => "spend",
            EntryType::Grant => "grant",
            EntryType::Refund => "refund",
            EntryType::AdminGrant => "admin_grant",
            EntryType::AdminDeduct => "admin_deduct",
        }
    }

    /// Debit types go through the sufficiency-checked spend path.
    pub fn is_debit(&self) -> bool {
        matches!(self, EntryType::Spend | EntryType::AdminDeduct)
    }
}

impl core::fmt::Display for EntryType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntryType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown entry type '{s}'")))
    }
}

/// An entry ready to be appended (not yet assigned an id or timestamp).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLedgerEntry {
    pub account_id: AccountId,
    /// Signed amount: positive = credit, negative = debit.
    pub amount: i64,
    pub entry_type: EntryType,
    pub reason: String,
    pub related_id: Option<String>,
    pub idempotency_key: Option<IdempotencyKey>,
}

impl NewLedgerEntry {
    /// Stamp the entry with its identity. Called by the store at insert time.
    pub fn into_entry(self, entry_id: EntryId, created_at: DateTime<Utc>) -> LedgerEntry {
        LedgerEntry {
            entry_id,
            account_id: self.account_id,
            amount: self.amount,
            entry_type: self.entry_type,
            reason: self.reason,
            related_id: self.related_id,
            idempotency_key: self.idempotency_key,
            created_at,
        }
    }
}

/// Immutable, append-only record of one balance change.
///
/// Never updated or deleted; corrections are new offsetting entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: EntryId,
    pub account_id: AccountId,
    pub amount: i64,
    pub entry_type: EntryType,
    pub reason: String,
    pub related_id: Option<String>,
    pub idempotency_key: Option<IdempotencyKey>,
    pub created_at: DateTime<Utc>,
}

/// Denormalized per-account balance, kept in lockstep with the ledger.
///
/// Never authoritative: it can be dropped and rebuilt from the entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceCache {
    pub account_id: AccountId,
    pub cached_value: i64,
    pub last_synced_at: DateTime<Utc>,
}

/// Sum of signed amounts: the true balance of whatever entries are passed in.
pub fn ledger_balance<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> i64 {
    entries.into_iter().map(|e| e.amount).sum()
}
