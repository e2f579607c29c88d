//! Cache drift audit.
//!
//! Compares each account's cache row with its ledger sum under the account
//! lock, so a concurrent spend can never show up as false drift. Divergence is
//! reported and, when asked, repaired through `sync_cache`.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};

use creditledger_core::AccountId;

use crate::engine::LedgerEngine;
use crate::error::LedgerResult;
use crate::ledger_store::LedgerStore;

/// One account whose cache disagrees with its ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Drift {
    pub account_id: AccountId,
    pub cached: i64,
    pub ledger: i64,
    /// `cached - ledger`
    pub drift: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub checked: usize,
    pub drifted: Vec<Drift>,
    /// Accounts with entries but no cache row.
    pub missing: Vec<AccountId>,
    pub repaired: usize,
    pub errors: Vec<String>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.drifted.is_empty() && self.missing.is_empty() && self.errors.is_empty()
    }
}

enum CacheState {
    InSync,
    Missing,
    Drifted(Drift),
}

pub struct CacheAuditor<S> {
    engine: Arc<LedgerEngine<S>>,
}

impl<S: LedgerStore> CacheAuditor<S> {
    pub fn new(engine: Arc<LedgerEngine<S>>) -> Self {
        Self { engine }
    }

    /// Check every known account; repair divergent rows if `auto_repair`.
    #[instrument(skip(self))]
    pub async fn audit(&self, auto_repair: bool) -> LedgerResult<AuditReport> {
        let accounts = self.engine.store().known_accounts().await?;
        let mut report = AuditReport::default();

        for account_id in accounts {
            report.checked += 1;
            let state = match self.inspect(account_id).await {
                Ok(state) => state,
                Err(e) => {
                    report.errors.push(format!("{account_id}: {e}"));
                    continue;
                }
            };

            let needs_repair = match state {
                CacheState::InSync => false,
                CacheState::Missing => {
                    report.missing.push(account_id);
                    true
                }
                CacheState::Drifted(drift) => {
                    warn!(
                        account_id = %drift.account_id,
                        cached = drift.cached,
                        ledger = drift.ledger,
                        drift = drift.drift,
                        "cache drift detected"
                    );
                    report.drifted.push(drift);
                    true
                }
            };

            if needs_repair && auto_repair {
                match self.engine.sync_cache(account_id).await {
                    Ok(_) => report.repaired += 1,
                    Err(e) => report.errors.push(format!("{account_id}: repair failed: {e}")),
                }
            }
        }

        info!(
            checked = report.checked,
            drifted = report.drifted.len(),
            missing = report.missing.len(),
            repaired = report.repaired,
            "cache audit finished"
        );
        Ok(report)
    }

    async fn inspect(&self, account_id: AccountId) -> LedgerResult<CacheState> {
        let store = self.engine.store();
        // Held only to freeze the account; dropped without commit.
        let mut unit = store.begin(account_id).await?;
        let ledger = unit.locked_balance().await?;
        let cached = store.cached_balance(account_id).await?;
        drop(unit);

        Ok(match cached {
            None if ledger == 0 => CacheState::InSync,
            None => CacheState::Missing,
            Some(row) if row.cached_value == ledger.max(0) => CacheState::InSync,
            Some(row) => CacheState::Drifted(Drift {
                account_id,
                cached: row.cached_value,
                ledger,
                drift: row.cached_value - ledger,
            }),
        })
    }
}
