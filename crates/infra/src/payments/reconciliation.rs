//! Reconciliation of stale checkout sessions.
//!
//! Catches purchases whose webhook never arrived: every pending session older
//! than the staleness window is checked with the provider. Paid sessions are
//! credited through the same keyed grant as the webhook, so a webhook that
//! arrives later (or arrived concurrently) cannot double-credit. Unpaid and
//! expired sessions are marked failed and never looked at again. Sessions the
//! provider still reports as open stay pending for the next run.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, instrument};

use super::checkout::{CheckoutCompletion, Settlement};
use super::provider::PaymentProvider;
use super::session::{PaymentError, PaymentSession};
use crate::ledger_store::LedgerStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileConfig {
    /// Sessions younger than this are left to the webhook.
    pub stale_after: Duration,
    /// Maximum sessions examined per run.
    pub batch_limit: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(30 * 60),
            batch_limit: 50,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub scanned: usize,
    /// Paid sessions credited by this run.
    pub credited: usize,
    /// Paid sessions whose credit had already been applied.
    pub already_credited: usize,
    pub failed: usize,
    pub still_open: usize,
    pub errors: Vec<String>,
}

enum SessionResult {
    Credited,
    AlreadyCredited,
    Failed,
    StillOpen,
}

pub struct ReconciliationJob<S> {
    checkout: Arc<CheckoutCompletion<S>>,
    provider: Arc<dyn PaymentProvider>,
    config: ReconcileConfig,
}

impl<S: LedgerStore> ReconciliationJob<S> {
    pub fn new(
        checkout: Arc<CheckoutCompletion<S>>,
        provider: Arc<dyn PaymentProvider>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            checkout,
            provider,
            config,
        }
    }

    /// Process one batch of stale sessions.
    ///
    /// A failure on one session is recorded in the report and does not stop
    /// the batch. Only failing to list sessions aborts the run.
    #[instrument(skip(self))]
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<ReconcileReport, PaymentError> {
        let window = chrono::Duration::from_std(self.config.stale_after)
            .map_err(|e| PaymentError::Validation(format!("stale window out of range: {e}")))?;
        let stale = self
            .checkout
            .sessions()
            .stale_pending(now - window, self.config.batch_limit)
            .await?;

        let mut report = ReconcileReport {
            scanned: stale.len(),
            ..Default::default()
        };

        for session in stale {
            match self.reconcile_session(&session, now).await {
                Ok(SessionResult::Credited) => report.credited += 1,
                Ok(SessionResult::AlreadyCredited) => report.already_credited += 1,
                Ok(SessionResult::Failed) => report.failed += 1,
                Ok(SessionResult::StillOpen) => report.still_open += 1,
                Err(e) => {
                    error!(session_id = %session.session_id, error = %e, "reconciliation failed for session");
                    report.errors.push(format!("{}: {e}", session.session_id));
                }
            }
        }

        info!(
            scanned = report.scanned,
            credited = report.credited,
            already_credited = report.already_credited,
            failed = report.failed,
            still_open = report.still_open,
            errors = report.errors.len(),
            "reconciliation finished"
        );
        Ok(report)
    }

    async fn reconcile_session(
        &self,
        session: &PaymentSession,
        now: DateTime<Utc>,
    ) -> Result<SessionResult, PaymentError> {
        let settled = self
            .checkout
            .settle(&session.session_id, self.provider.as_ref(), now)
            .await?;
        Ok(match settled {
            Settlement::Credited(outcome) if outcome.idempotent => SessionResult::AlreadyCredited,
            Settlement::Credited(_) => SessionResult::Credited,
            Settlement::Failed { .. } => SessionResult::Failed,
            Settlement::Open => SessionResult::StillOpen,
        })
    }
}
