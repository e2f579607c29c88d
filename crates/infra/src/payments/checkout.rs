//! Checkout completion: the webhook path that turns a paid session into credits.
//!
//! A notification only names a session. What happened to it is always asked
//! of the provider, so a forged or replayed "paid" body cannot mint credits.
//!
//! The grant carries the key `provider:<session_id>`, shared with the
//! reconciliation job, so whichever path runs first credits the account and
//! the other is an idempotent no-op.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use creditledger_core::AccountId;
use creditledger_ledger::{EntryType, GrantOutcome, GrantRequest, IdempotencyKey};

use super::provider::{PaymentProvider, ProviderStatus};
use super::session::{PaymentError, PaymentSession, PaymentSessionStore, SessionId, SessionStatus};
use crate::engine::LedgerEngine;
use crate::ledger_store::LedgerStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionOutcome {
    pub session_id: SessionId,
    pub account_id: AccountId,
    pub credits: i64,
    pub new_balance: i64,
    /// The session had already been credited.
    pub idempotent: bool,
}

/// What the provider's answer did to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Credited(CompletionOutcome),
    /// The provider will never collect. `changed` is false if the session
    /// was no longer pending.
    Failed { changed: bool },
    /// Payment not collected yet; the session stays pending.
    Open,
}

pub struct CheckoutCompletion<S> {
    engine: Arc<LedgerEngine<S>>,
    sessions: Arc<dyn PaymentSessionStore>,
}

impl<S: LedgerStore> CheckoutCompletion<S> {
    pub fn new(engine: Arc<LedgerEngine<S>>, sessions: Arc<dyn PaymentSessionStore>) -> Self {
        Self { engine, sessions }
    }

    pub fn sessions(&self) -> &Arc<dyn PaymentSessionStore> {
        &self.sessions
    }

    /// Remember a checkout the account just started.
    pub async fn open(
        &self,
        session_id: SessionId,
        account_id: AccountId,
        credits: i64,
        now: DateTime<Utc>,
    ) -> Result<PaymentSession, PaymentError> {
        let session = PaymentSession::pending(session_id, account_id, credits, now)?;
        self.sessions.record_pending(session).await
    }

    /// Settle a session by its status at the provider.
    ///
    /// Unknown sessions are [`PaymentError::NotFound`] before the provider is
    /// asked. Safe to call any number of times, from the webhook or the
    /// reconciliation job.
    #[instrument(skip(self, provider), fields(session_id = %session_id), err)]
    pub async fn settle(
        &self,
        session_id: &SessionId,
        provider: &dyn PaymentProvider,
        now: DateTime<Utc>,
    ) -> Result<Settlement, PaymentError> {
        if self.sessions.get(session_id).await?.is_none() {
            return Err(PaymentError::NotFound(session_id.to_string()));
        }

        match provider.session_status(session_id).await? {
            ProviderStatus::Paid => Ok(Settlement::Credited(self.complete(session_id, now).await?)),
            ProviderStatus::Unpaid | ProviderStatus::Expired => Ok(Settlement::Failed {
                changed: self.fail(session_id, now).await?,
            }),
            ProviderStatus::Open => Ok(Settlement::Open),
        }
    }

    /// Credit a session and mark it completed.
    ///
    /// Does not consult the provider: only call this once payment is
    /// confirmed, as [`Self::settle`] does. Idempotent per session.
    #[instrument(skip(self), fields(session_id = %session_id), err)]
    pub async fn complete(
        &self,
        session_id: &SessionId,
        now: DateTime<Utc>,
    ) -> Result<CompletionOutcome, PaymentError> {
        let session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(session_id.to_string()))?;

        let key = IdempotencyKey::provider_session(session_id.as_str())
            .map_err(|e| PaymentError::Validation(e.to_string()))?;
        let request = GrantRequest::new(
            session.account_id,
            session.credits,
            EntryType::Purchase,
            format!("credit purchase {session_id}"),
        )
        .with_related_id(session_id.as_str())
        .with_idempotency_key(key);

        let GrantOutcome {
            new_balance,
            idempotent,
        } = self.engine.grant(request).await?;

        if session.status == SessionStatus::Failed {
            warn!("payment confirmed for a session previously marked failed");
        }
        self.sessions.mark_completed(session_id, now).await?;

        if idempotent {
            info!(account_id = %session.account_id, "session already credited");
        } else {
            info!(account_id = %session.account_id, credits = session.credits, new_balance, "session credited");
        }

        Ok(CompletionOutcome {
            session_id: session.session_id,
            account_id: session.account_id,
            credits: session.credits,
            new_balance,
            idempotent,
        })
    }

    /// Record that the provider will never collect payment for this session.
    ///
    /// Returns false if the session was not pending.
    pub async fn fail(&self, session_id: &SessionId, now: DateTime<Utc>) -> Result<bool, PaymentError> {
        let changed = self.sessions.mark_failed(session_id, now).await?;
        if changed {
            info!(session_id = %session_id, "session marked failed");
        }
        Ok(changed)
    }
}
