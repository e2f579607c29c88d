//! Idempotency key policy.
//!
//! Every caller derives keys through this module so that the same business
//! action always maps to the same key. A key is globally unique in the ledger:
//! re-using it yields the entry it first produced, never a second one.
//!
//! Key shapes:
//!
//! | scope | shape |
//! |---|---|
//! | one-shot | `<action>:<actor>:<target>` |
//! | daily | `<action>:<actor>:<target>:<YYYYMMDD>` |
//! | monthly | `<action>:<actor>:<target>:<YYYYMM>` |
//! | payment provider | `provider:<session_id>` |
//! | admin adjustment | `admin:<actor>:<account>:<timestamp>` |
//!
//! `<target>` is `global` for actions without a target.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use creditledger_core::{AccountId, DomainError, DomainResult};

/// Upper bound enforced by the ledger schema.
pub const MAX_KEY_LEN: usize = 255;

const GLOBAL_TARGET: &str = "global";

/// How often the same action on the same target may be charged again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyScope {
    /// Exactly once per (actor, action, target), ever.
    OneShot,
    /// Once per UTC calendar day.
    Daily,
    /// Once per UTC calendar month.
    Monthly,
}

impl KeyScope {
    fn period(&self, at: DateTime<Utc>) -> Option<String> {
        match self {
            KeyScope::OneShot => None,
            KeyScope::Daily => Some(at.format("%Y%m%d").to_string()),
            KeyScope::Monthly => Some(at.format("%Y%m").to_string()),
        }
    }
}

/// Caller-supplied deduplication key for a ledger mutation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Wrap a raw key. Surrounding whitespace is trimmed; empty or oversized
    /// keys are rejected.
    pub fn new(raw: impl Into<String>) -> DomainResult<Self> {
        let raw = raw.into();
        let key = raw.trim();
        if key.is_empty() {
            return Err(DomainError::validation("idempotency key must not be empty"));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(DomainError::validation(format!(
                "idempotency key exceeds {MAX_KEY_LEN} bytes"
            )));
        }
        Ok(Self(key.to_string()))
    }

    /// Key for a user-facing paid action.
    pub fn for_action(
        action: &str,
        scope: KeyScope,
        actor: AccountId,
        target: Option<&str>,
        at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let target = target.map(str::trim).filter(|t| !t.is_empty()).unwrap_or(GLOBAL_TARGET);
        let mut key = format!("{action}:{actor}:{target}");
        if let Some(period) = scope.period(at) {
            key.push(':');
            key.push_str(&period);
        }
        Self::new(key)
    }

    /// Key shared by the payment webhook and the reconciliation job, so that
    /// whichever runs first wins and the other is a no-op.
    pub fn provider_session(session_id: &str) -> DomainResult<Self> {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(DomainError::validation("provider session id must not be empty"));
        }
        Self::new(format!("provider:{session_id}"))
    }

    /// Key for a manual adjustment. The timestamp keeps distinct adjustments
    /// from collapsing into one; retries must reuse the same `at`.
    pub fn admin_adjustment(actor: &str, account: AccountId, at: DateTime<Utc>) -> DomainResult<Self> {
        let actor = actor.trim();
        if actor.is_empty() {
            return Err(DomainError::validation("admin actor must not be empty"));
        }
        Self::new(format!(
            "admin:{actor}:{account}:{}",
            at.to_rfc3339_opts(SecondsFormat::Nanos, true)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for IdempotencyKey {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<IdempotencyKey> for String {
    fn from(value: IdempotencyKey) -> Self {
        value.0
    }
}
