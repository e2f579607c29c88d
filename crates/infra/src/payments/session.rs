use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use creditledger_core::AccountId;
use creditledger_ledger::MAX_CREDIT_AMOUNT;

use super::provider::ProviderError;
use crate::error::LedgerError;

/// Checkout session id issued by the payment provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub fn new(raw: impl Into<String>) -> Result<Self, PaymentError> {
        let raw = raw.into();
        let id = raw.trim();
        if id.is_empty() {
            return Err(PaymentError::Validation("session id must not be empty".to_string()));
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for SessionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = PaymentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SessionId> for String {
    fn from(value: SessionId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SessionStatus::Pending),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            other => Err(PaymentError::Store(format!("unknown session status '{other}'"))),
        }
    }
}

/// A credit purchase in flight at the payment provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSession {
    pub session_id: SessionId,
    pub account_id: AccountId,
    /// Credits granted once the provider confirms payment.
    pub credits: i64,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentSession {
    pub fn pending(
        session_id: SessionId,
        account_id: AccountId,
        credits: i64,
        now: DateTime<Utc>,
    ) -> Result<Self, PaymentError> {
        if credits <= 0 {
            return Err(PaymentError::Validation(format!(
                "session credits must be positive (got {credits})"
            )));
        }
        if credits > MAX_CREDIT_AMOUNT {
            return Err(PaymentError::Validation(format!(
                "session credits exceed {MAX_CREDIT_AMOUNT} (got {credits})"
            )));
        }
        Ok(Self {
            session_id,
            account_id,
            credits,
            status: SessionStatus::Pending,
            created_at: now,
            updated_at: now,
        })
    }
}

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("payment session not found: {0}")]
    NotFound(String),

    #[error("payment session conflict: {0}")]
    Conflict(String),

    #[error("payment session store error: {0}")]
    Store(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Persistence for payment sessions.
///
/// Status moves only forward: `pending → completed`, `pending → failed`, and
/// `failed → completed` when payment is confirmed late.
#[async_trait]
pub trait PaymentSessionStore: Send + Sync {
    /// Insert a pending session. Recording the same session again is a no-op
    /// returning the stored row; a different account or amount is a conflict.
    async fn record_pending(&self, session: PaymentSession) -> Result<PaymentSession, PaymentError>;

    async fn get(&self, session_id: &SessionId) -> Result<Option<PaymentSession>, PaymentError>;

    /// Pending sessions created before `older_than`, oldest first.
    async fn stale_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<PaymentSession>, PaymentError>;

    /// Returns false if the session was already completed.
    async fn mark_completed(&self, session_id: &SessionId, now: DateTime<Utc>) -> Result<bool, PaymentError>;

    /// Returns false unless the session was pending.
    async fn mark_failed(&self, session_id: &SessionId, now: DateTime<Utc>) -> Result<bool, PaymentError>;
}

#[async_trait]
impl<S> PaymentSessionStore for Arc<S>
where
    S: PaymentSessionStore + ?Sized,
{
    async fn record_pending(&self, session: PaymentSession) -> Result<PaymentSession, PaymentError> {
        (**self).record_pending(session).await
    }

    async fn get(&self, session_id: &SessionId) -> Result<Option<PaymentSession>, PaymentError> {
        (**self).get(session_id).await
    }

    async fn stale_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<PaymentSession>, PaymentError> {
        (**self).stale_pending(older_than, limit).await
    }

    async fn mark_completed(&self, session_id: &SessionId, now: DateTime<Utc>) -> Result<bool, PaymentError> {
        (**self).mark_completed(session_id, now).await
    }

    async fn mark_failed(&self, session_id: &SessionId, now: DateTime<Utc>) -> Result<bool, PaymentError> {
        (**self).mark_failed(session_id, now).await
    }
}

/// In-memory session store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryPaymentSessionStore {
    sessions: RwLock<HashMap<SessionId, PaymentSession>>,
}

impl InMemoryPaymentSessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn transition(
        &self,
        session_id: &SessionId,
        to: SessionStatus,
        allowed_from: &[SessionStatus],
        now: DateTime<Utc>,
    ) -> Result<bool, PaymentError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| PaymentError::Store("lock poisoned".to_string()))?;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| PaymentError::NotFound(session_id.to_string()))?;
        if !allowed_from.contains(&session.status) {
            return Ok(false);
        }
        session.status = to;
        session.updated_at = now;
        Ok(true)
    }
}

#[async_trait]
impl PaymentSessionStore for InMemoryPaymentSessionStore {
    async fn record_pending(&self, session: PaymentSession) -> Result<PaymentSession, PaymentError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| PaymentError::Store("lock poisoned".to_string()))?;
        if let Some(existing) = sessions.get(&session.session_id) {
            if existing.account_id != session.account_id || existing.credits != session.credits {
                return Err(PaymentError::Conflict(format!(
                    "session {} already recorded with different terms",
                    session.session_id
                )));
            }
            return Ok(existing.clone());
        }
        sessions.insert(session.session_id.clone(), session.clone());
        Ok(session)
    }

    async fn get(&self, session_id: &SessionId) -> Result<Option<PaymentSession>, PaymentError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| PaymentError::Store("lock poisoned".to_string()))?;
        Ok(sessions.get(session_id).cloned())
    }

    async fn stale_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<PaymentSession>, PaymentError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| PaymentError::Store("lock poisoned".to_string()))?;
        let mut stale: Vec<PaymentSession> = sessions
            .values()
            .filter(|s| s.status == SessionStatus::Pending && s.created_at < older_than)
            .cloned()
            .collect();
        stale.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        stale.truncate(limit as usize);
        Ok(stale)
    }

    async fn mark_completed(&self, session_id: &SessionId, now: DateTime<Utc>) -> Result<bool, PaymentError> {
        self.transition(
            session_id,
            SessionStatus::Completed,
            &[SessionStatus::Pending, SessionStatus::Failed],
            now,
        )
    }

    async fn mark_failed(&self, session_id: &SessionId, now: DateTime<Utc>) -> Result<bool, PaymentError> {
        self.transition(session_id, SessionStatus::Failed, &[SessionStatus::Pending], now)
    }
}
